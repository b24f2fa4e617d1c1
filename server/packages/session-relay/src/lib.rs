//! Session relay server: per-session coordination of agent executions
//! running in remote sandboxes.

pub mod bundles;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod dispatch;
pub mod router;
pub mod secrets;

pub use coordinator::{CallbackReport, ChatStream, CoordinatorRegistry, RelayServices, SessionCoordinator};
pub use dispatch::{ChatRequest, PromptPayload};
pub use router::{build_router, ApiDoc, AppState, AuthConfig};

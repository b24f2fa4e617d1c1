//! Keeps a session's remote sandbox reachable and configured.

mod control;
mod error;
mod injection;
mod manager;
mod session;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use control::{
    ExecOptions, ExecOutput, HttpSandboxControl, OutputStream, ProcessHandle, SandboxCallError,
    SandboxControl, SandboxFuture, NOT_READY_SIGNATURES,
};
pub use error::{LifecycleError, ProvisionStep};
pub use injection::{
    BundleFile, BundleSource, ConfigBundle, ConfigInjector, InjectionLayout, USER_RULES_MARKER,
};
pub use manager::{CreateOptions, ExecResult, LifecycleConfig, SandboxLifecycle, HEALTH_CHECK_COMMAND};
pub use session::{
    session_key, InMemorySessionStore, Session, SessionMetadata, SessionStatus, SessionStore,
    StoreError,
};

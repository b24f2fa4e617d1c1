//! Per-execution bridge between a sandbox callback stream and a client
//! output channel.

mod bridge;
mod decoder;
mod protocol;
mod signal;
mod translate;

pub use bridge::{BridgeOutcome, BridgeSink, OutboundFrame, StreamBridge, StreamFormat};
pub use decoder::{LineDecoder, MAX_LINE_BYTES};
pub use protocol::{AgentEvent, ClientEvent};
pub use signal::{completion_pair, BridgeFailure, CompletionSignal, CompletionWaiter};
pub use translate::EventTranslator;

pub const OUTPUT_CHANNEL_CAPACITY: usize = 256;

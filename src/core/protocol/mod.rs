//! Wire vocabulary: data-channel control envelopes and relayed signals.

pub mod message;
pub mod signal;

pub use message::{ControlMessage, FileMeta};
pub use signal::{IceCandidate, SignalPayload};

//! roomdrop: one-to-one file exchange over a WebRTC data channel.
//!
//! A host opens a room on a signaling relay and receives a 4-digit code; a
//! joiner enters the code, the two sides negotiate a peer connection through
//! the relay, and from then on catalogs, requests and file chunks travel
//! directly over a single ordered data channel.
//!
//! The library is organised as:
//! - [`core::session`]: the coordinator event loop and session state machine
//! - [`core::pipeline`]: chunk sender, reassembler, download queue
//! - [`core::catalog`] and [`core::protocol`]: file catalogs and wire messages
//! - [`core::connection`]: relay and peer-link seams with WebRTC, WebSocket
//!   and in-memory implementations
//! - [`workers`]: the headless command-line front-end

pub mod core;
pub mod utils;
pub mod workers;

pub use crate::core::config::TransferConfig;
pub use crate::core::session::{inbox, Coordinator, SessionHandle, SessionState, SessionUpdate};
pub use crate::utils::sos::SignalOfStop;

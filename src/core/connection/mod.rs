//! Transport seams.
//!
//! The coordinator never touches WebRTC or WebSocket types directly. It
//! drives a [`SignalingRelay`] to find the peer and a [`Connector`] to build
//! one [`PeerLink`] per connection attempt. Both push their callbacks into
//! the session event queue; these traits only cover the outbound half.
//!
//! Production implementations live in [`webrtc`] and [`relay`]; [`memory`]
//! wires two sessions together inside one process.

pub mod memory;
pub mod relay;
pub mod webrtc;

use crate::core::config::TransferConfig;
use crate::core::protocol::SignalPayload;
use crate::core::session::events::LinkEvents;
use crate::core::session::state::Role;
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;

pub use memory::{MemoryConnector, MemoryLink, MemoryNetwork, MemoryRelay, MemoryRelayHub};
pub use relay::WsRelay;
pub use webrtc::{WebRtcConnector, WebRtcLink};

/// The ordered, reliable data channel of one link.
#[async_trait]
pub trait TransferChannel: Send + Sync {
    fn is_open(&self) -> bool;

    async fn send_text(&self, text: String) -> Result<()>;

    async fn send_binary(&self, data: Bytes) -> Result<()>;

    /// Bytes accepted by `send_*` but not yet flushed to the network.
    async fn buffered_amount(&self) -> usize;
}

/// One peer connection plus its data channel.
#[async_trait]
pub trait PeerLink: TransferChannel {
    /// Host side: produce the offer to relay to the joiner.
    async fn create_offer(&self) -> Result<SignalPayload>;

    /// Apply a relayed signal. An offer yields the answer to send back.
    async fn apply_signal(&self, payload: SignalPayload) -> Result<Option<SignalPayload>>;

    async fn close(&self);
}

/// Factory for peer links.
#[async_trait]
pub trait Connector: Send {
    type Link: PeerLink + 'static;

    /// Build a fresh link. The host side opens the data channel right away;
    /// the joiner side waits for the host's channel to arrive.
    async fn prepare(
        &mut self,
        role: Role,
        events: LinkEvents,
        config: &TransferConfig,
    ) -> Result<Self::Link>;
}

/// Client half of the rendezvous relay. Replies arrive asynchronously as
/// `RelayEvent`s on the session queue.
#[async_trait]
pub trait SignalingRelay: Send {
    async fn create_room(&mut self) -> Result<()>;

    async fn join_room(&mut self, code: &str) -> Result<()>;

    async fn signal(&mut self, room: &str, payload: SignalPayload) -> Result<()>;

    async fn cancel_session(&mut self, room: &str) -> Result<()>;
}

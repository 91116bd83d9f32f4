//! Centralized configuration constants for roomdrop.
//!
//! All tunable parameters live here so they can be reviewed and adjusted
//! in a single place. Wire vocabulary stays in `protocol`.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

// ── Transfer / Chunking ──────────────────────────────────────────────────────

/// Default chunk size in bytes (64 KB).
///
/// One chunk is one binary message on the data channel. 64 KB stays under
/// the SCTP message size every mainstream WebRTC stack accepts without
/// negotiating `a=max-message-size`.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// High water mark for unflushed outbound bytes on the data channel (16 MB).
///
/// The sender parks before a slice that would push `buffered_amount`
/// above this value and resumes when the channel reports the buffer has
/// drained far enough for the next slice.
pub const HIGH_WATER_MARK: usize = 16 * 1024 * 1024;

/// Maximum slices the sender pushes in one event-loop turn before it yields
/// so that queued events (cancel, new catalogs) are serviced in between.
pub const SENDS_PER_TURN: usize = 64;

/// How long an inbound transfer may go without a chunk before it is
/// declared stalled and discarded.
pub const STALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Largest SCTP message the data channel will send (1 MB), advertised to
/// the peer through `a=max-message-size`.
///
/// The `webrtc` crate caps outbound messages at 64 KB unless told
/// otherwise, so chunk sizes above that need this raised. It is also the
/// upper bound for [`TransferConfig::chunk_size`].
pub const SCTP_MAX_MESSAGE_SIZE: u32 = 1024 * 1024;

// ── Session / Relay ──────────────────────────────────────────────────────────

/// Room codes handed out by the relay are this many ASCII digits.
pub const ROOM_CODE_LEN: usize = 4;

/// Label of the single data channel opened by the host.
pub const DATA_CHANNEL_LABEL: &str = "file-transfer";

/// Default signaling relay endpoint.
pub const DEFAULT_RELAY_URL: &str = "ws://127.0.0.1:5000/ws";

/// Timeout for establishing the WebSocket to the relay.
pub const RELAY_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Public STUN server used for NAT traversal.
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

// ── Per-session configuration ────────────────────────────────────────────────

/// Transfer parameters for one session.
///
/// Defaults come from the constants above; the binary overrides them from
/// CLI flags or the TOML config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Chunk size C, in bytes.
    pub chunk_size: usize,
    /// High water mark W, in bytes.
    pub high_water_mark: usize,
    /// Slices sent per event-loop turn before yielding.
    pub sends_per_turn: usize,
    /// Inbound stall timeout.
    #[serde(with = "duration_secs")]
    pub stall_timeout: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            high_water_mark: HIGH_WATER_MARK,
            sends_per_turn: SENDS_PER_TURN,
            stall_timeout: STALL_TIMEOUT,
        }
    }
}

impl TransferConfig {
    /// Threshold at which the channel should report "buffer drained":
    /// the point where one more full slice fits under the high water mark.
    pub fn low_water_mark(&self) -> usize {
        self.high_water_mark.saturating_sub(self.chunk_size)
    }

    /// Clamp nonsensical values (zero or oversized chunks, zero batch) to
    /// usable ones.
    pub fn sanitized(mut self) -> Self {
        if self.chunk_size == 0 {
            self.chunk_size = CHUNK_SIZE;
        }
        let max_chunk = SCTP_MAX_MESSAGE_SIZE as usize;
        if self.chunk_size > max_chunk {
            warn!(
                event = "chunk_size_clamped",
                requested = self.chunk_size,
                max = max_chunk,
                "Chunk size exceeds the data channel message limit"
            );
            self.chunk_size = max_chunk;
        }
        if self.sends_per_turn == 0 {
            self.sends_per_turn = 1;
        }
        self
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn low_water_mark_leaves_room_for_one_slice() {
        let cfg = TransferConfig::default();
        assert_eq!(cfg.low_water_mark() + cfg.chunk_size, cfg.high_water_mark);

        let tiny = TransferConfig {
            chunk_size: 1024,
            high_water_mark: 512,
            ..TransferConfig::default()
        };
        assert_eq!(tiny.low_water_mark(), 0);
    }

    #[test]
    fn sanitized_fixes_zero_values() {
        let cfg = TransferConfig {
            chunk_size: 0,
            sends_per_turn: 0,
            ..TransferConfig::default()
        }
        .sanitized();
        assert_eq!(cfg.chunk_size, CHUNK_SIZE);
        assert_eq!(cfg.sends_per_turn, 1);
    }

    #[test]
    fn sanitized_caps_chunk_at_message_limit() {
        let large = TransferConfig {
            chunk_size: 256 * 1024,
            ..TransferConfig::default()
        }
        .sanitized();
        assert_eq!(large.chunk_size, 256 * 1024);

        let huge = TransferConfig {
            chunk_size: 8 * 1024 * 1024,
            ..TransferConfig::default()
        }
        .sanitized();
        assert_eq!(huge.chunk_size, SCTP_MAX_MESSAGE_SIZE as usize);
    }

    #[test]
    fn partial_toml_uses_defaults() {
        let cfg: TransferConfig = toml::from_str("chunk_size = 1024\nstall_timeout = 5").unwrap();
        assert_eq!(cfg.chunk_size, 1024);
        assert_eq!(cfg.high_water_mark, HIGH_WATER_MARK);
        assert_eq!(cfg.stall_timeout, Duration::from_secs(5));
    }
}

//! Inbound reassembly.
//!
//! At most one transfer is open at a time. `begin-transfer` opens it, every
//! binary message appends to it, and a matching `end-transfer` turns the
//! accumulated chunks into one [`ReceivedFile`]. Binary data with no open
//! transfer is ignored.
//!
//! Per-file progress is `floor(100 * received / declared)`, held at 99
//! until `end-transfer` arrives so a peer that sends more than it declared
//! can never report completion early.

use crate::core::protocol::FileMeta;
use bytes::{Bytes, BytesMut};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// A fully received file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub name: String,
    pub mime_type: String,
    pub data: Bytes,
}

impl ReceivedFile {
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

/// Progress after one accepted chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkProgress {
    pub name: String,
    pub received: u64,
    pub declared: u64,
    pub percent: u8,
}

/// The transfer currently open.
#[derive(Debug)]
pub struct TransferContext {
    pub name: String,
    pub mime_type: String,
    pub declared_size: u64,
    pub received: u64,
    chunks: Vec<Bytes>,
    last_activity: Instant,
}

impl TransferContext {
    fn new(meta: FileMeta) -> Self {
        Self {
            name: meta.name,
            mime_type: meta.mime_type,
            declared_size: meta.size,
            received: 0,
            chunks: Vec::new(),
            last_activity: Instant::now(),
        }
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    fn assemble(self) -> ReceivedFile {
        let mut buf = BytesMut::with_capacity(self.received as usize);
        for chunk in &self.chunks {
            buf.extend_from_slice(chunk);
        }
        ReceivedFile {
            name: self.name,
            mime_type: self.mime_type,
            data: buf.freeze(),
        }
    }
}

/// `floor(100 * received / declared)`, capped at 99. A zero declared size
/// reports 0 until the transfer ends.
pub fn file_percent(received: u64, declared: u64) -> u8 {
    if declared == 0 {
        return 0;
    }
    let pct = (received as u128 * 100) / declared as u128;
    pct.min(99) as u8
}

#[derive(Debug, Default)]
pub struct Reassembler {
    context: Option<TransferContext>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(&self) -> Option<&TransferContext> {
        self.context.as_ref()
    }

    /// Open a transfer, discarding any transfer that never finished.
    pub fn begin(&mut self, meta: FileMeta) {
        if let Some(stale) = self.context.take() {
            warn!(
                event = "transfer_superseded",
                file = %stale.name,
                received = stale.received,
                declared = stale.declared_size,
                "Unfinished transfer replaced by a new begin-transfer"
            );
        }
        info!(
            event = "transfer_begin",
            file = %meta.name,
            size = meta.size,
            mime = %meta.mime_type,
            "Inbound transfer started"
        );
        self.context = Some(TransferContext::new(meta));
    }

    /// Append one chunk to the open transfer. `None` if nothing is open.
    pub fn push_chunk(&mut self, data: Bytes) -> Option<ChunkProgress> {
        let Some(ctx) = self.context.as_mut() else {
            debug!(event = "chunk_without_transfer", bytes = data.len(), "Stray chunk ignored");
            return None;
        };

        ctx.received += data.len() as u64;
        ctx.chunks.push(data);
        ctx.last_activity = Instant::now();

        Some(ChunkProgress {
            name: ctx.name.clone(),
            received: ctx.received,
            declared: ctx.declared_size,
            percent: file_percent(ctx.received, ctx.declared_size),
        })
    }

    /// Close the open transfer if `name` matches it.
    pub fn finish(&mut self, name: &str) -> Option<ReceivedFile> {
        match self.context.as_ref() {
            Some(ctx) if ctx.name == name => {}
            Some(ctx) => {
                warn!(
                    event = "end_transfer_mismatch",
                    expected = %ctx.name,
                    got = %name,
                    "end-transfer does not match the open transfer"
                );
                return None;
            }
            None => {
                debug!(event = "end_transfer_without_begin", file = %name);
                return None;
            }
        }

        let ctx = self.context.take()?;
        if ctx.received != ctx.declared_size {
            warn!(
                event = "transfer_size_mismatch",
                file = %ctx.name,
                received = ctx.received,
                declared = ctx.declared_size,
                "Received byte count differs from the declared size"
            );
        }
        let file = ctx.assemble();
        info!(event = "transfer_complete", file = %file.name, bytes = file.size(), "Inbound transfer complete");
        Some(file)
    }

    /// When the open transfer will count as stalled.
    pub fn stall_deadline(&self, timeout: Duration) -> Option<Instant> {
        self.context.as_ref().map(|ctx| ctx.last_activity + timeout)
    }

    /// Discard the open transfer if it has been silent for `timeout`.
    pub fn take_stalled(&mut self, now: Instant, timeout: Duration) -> Option<TransferContext> {
        let deadline = self.stall_deadline(timeout)?;
        if now < deadline {
            return None;
        }
        let ctx = self.context.take()?;
        warn!(
            event = "transfer_stalled",
            file = %ctx.name,
            received = ctx.received,
            declared = ctx.declared_size,
            "Inbound transfer stalled, discarding"
        );
        Some(ctx)
    }

    pub fn reset(&mut self) {
        self.context = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(name: &str, size: u64) -> FileMeta {
        FileMeta {
            name: name.into(),
            size,
            mime_type: "text/plain".into(),
        }
    }

    #[test]
    fn reassembles_in_arrival_order() {
        let mut r = Reassembler::new();
        r.begin(meta("a.txt", 6));
        r.push_chunk(Bytes::from_static(b"abc"));
        let p = r.push_chunk(Bytes::from_static(b"def")).unwrap();
        assert_eq!(p.received, 6);
        assert_eq!(p.percent, 99);

        let file = r.finish("a.txt").unwrap();
        assert_eq!(&file.data[..], b"abcdef");
        assert_eq!(file.mime_type, "text/plain");
        assert!(r.active().is_none());
    }

    #[test]
    fn stray_chunk_is_ignored() {
        let mut r = Reassembler::new();
        assert!(r.push_chunk(Bytes::from_static(b"zzz")).is_none());
        assert!(r.active().is_none());
    }

    #[test]
    fn mismatched_end_keeps_transfer_open() {
        let mut r = Reassembler::new();
        r.begin(meta("a", 1));
        assert!(r.finish("b").is_none());
        assert_eq!(r.active().unwrap().name, "a");
    }

    #[test]
    fn new_begin_discards_unfinished() {
        let mut r = Reassembler::new();
        r.begin(meta("a", 10));
        r.push_chunk(Bytes::from_static(b"12345"));
        r.begin(meta("b", 2));

        let ctx = r.active().unwrap();
        assert_eq!(ctx.name, "b");
        assert_eq!(ctx.received, 0);
        assert_eq!(ctx.chunk_count(), 0);
    }

    #[test]
    fn percent_is_floored_and_capped() {
        assert_eq!(file_percent(0, 0), 0);
        assert_eq!(file_percent(1, 3), 33);
        assert_eq!(file_percent(2, 3), 66);
        assert_eq!(file_percent(3, 3), 99);
        assert_eq!(file_percent(10, 3), 99);
        assert_eq!(file_percent(u64::MAX, u64::MAX), 99);
    }

    #[test]
    fn oversized_transfer_still_completes() {
        let mut r = Reassembler::new();
        r.begin(meta("a", 2));
        r.push_chunk(Bytes::from_static(b"1234"));
        let file = r.finish("a").unwrap();
        assert_eq!(file.size(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn stall_detection() {
        let timeout = Duration::from_secs(30);
        let mut r = Reassembler::new();
        assert!(r.stall_deadline(timeout).is_none());

        r.begin(meta("slow", 100));
        tokio::time::advance(Duration::from_secs(20)).await;
        r.push_chunk(Bytes::from_static(b"x"));
        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(r.take_stalled(Instant::now(), timeout).is_none());

        tokio::time::advance(Duration::from_secs(11)).await;
        let ctx = r.take_stalled(Instant::now(), timeout).unwrap();
        assert_eq!(ctx.name, "slow");
        assert!(r.active().is_none());
    }
}

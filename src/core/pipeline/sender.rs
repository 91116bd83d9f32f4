//! Chunk sender: streams one requested local file at a time.
//!
//! A request produces `begin-transfer`, then `ceil(size / C)` binary slices
//! in offset order, then `end-transfer`. Requests arriving while a file is in
//! flight wait in FIFO order.
//!
//! The sender never blocks the event loop. [`ChunkSender::pump`] pushes
//! slices until one of three things happens:
//!
//! - the next slice would push the channel's buffered amount past the high
//!   water mark W → [`PumpOutcome::Parked`], resume on `BufferedAmountLow`;
//! - the per-turn budget is spent → [`PumpOutcome::Yielded`], resume on a
//!   self-posted wake-up;
//! - the file is done → [`PumpOutcome::Finished`].
//!
//! ```text
//! request-file ─► pending ─► begin-transfer ─► slice* ─► end-transfer
//!                               ▲      │
//!                               └──────┘ park / yield
//! ```

use crate::core::catalog::{Catalog, FileSource};
use crate::core::config::TransferConfig;
use crate::core::connection::TransferChannel;
use crate::core::protocol::ControlMessage;
use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use std::collections::VecDeque;
use std::path::PathBuf;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

/// What one call to [`ChunkSender::pump`] achieved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PumpOutcome {
    /// Nothing in flight and nothing pending.
    Idle,
    /// Waiting for the channel buffer to drain.
    Parked,
    /// Per-turn budget spent; call again on the next turn.
    Yielded,
    /// `end-transfer` was sent.
    Finished { name: String, chunks: u64 },
    /// A request was discarded before `begin-transfer` went out.
    Dropped { name: String },
    /// Streaming aborted mid-file. No `end-transfer` was sent.
    Failed { name: String, error: String },
}

/// Sequential reader over one file's content.
enum SliceReader {
    Memory(Bytes),
    File {
        path: PathBuf,
        file: Option<tokio::fs::File>,
    },
}

impl SliceReader {
    fn new(source: &FileSource) -> Self {
        match source {
            FileSource::Memory(bytes) => SliceReader::Memory(bytes.clone()),
            FileSource::Path(path) => SliceReader::File {
                path: path.clone(),
                file: None,
            },
        }
    }

    /// Read `len` bytes at `offset`. Calls are strictly sequential, so the
    /// file variant never seeks.
    async fn read(&mut self, offset: u64, len: usize) -> Result<Bytes> {
        match self {
            SliceReader::Memory(bytes) => {
                let start = offset as usize;
                let end = start + len;
                if end > bytes.len() {
                    return Err(anyhow!(
                        "content shrank: wanted {}..{} of {} bytes",
                        start,
                        end,
                        bytes.len()
                    ));
                }
                Ok(bytes.slice(start..end))
            }
            SliceReader::File { path, file } => {
                if file.is_none() {
                    let opened = tokio::fs::File::open(&*path)
                        .await
                        .with_context(|| format!("cannot open {}", path.display()))?;
                    *file = Some(opened);
                }
                let file = file
                    .as_mut()
                    .ok_or_else(|| anyhow!("file handle missing"))?;
                let mut buf = vec![0u8; len];
                file.read_exact(&mut buf)
                    .await
                    .with_context(|| format!("read failed at offset {offset} of {}", path.display()))?;
                Ok(Bytes::from(buf))
            }
        }
    }
}

/// The file currently being streamed.
struct ActiveSend {
    name: String,
    size: u64,
    offset: u64,
    chunks: u64,
    reader: SliceReader,
}

impl ActiveSend {
    fn remaining(&self) -> u64 {
        self.size - self.offset
    }
}

pub struct ChunkSender {
    config: TransferConfig,
    active: Option<ActiveSend>,
    pending: VecDeque<String>,
    parked: bool,
}

impl ChunkSender {
    pub fn new(config: TransferConfig) -> Self {
        Self {
            config,
            active: None,
            pending: VecDeque::new(),
            parked: false,
        }
    }

    /// Queue a `request-file`.
    pub fn enqueue(&mut self, name: impl Into<String>) {
        let name = name.into();
        debug!(event = "send_request_queued", file = %name, pending = self.pending.len() + 1);
        self.pending.push_back(name);
    }

    /// A file is in flight.
    pub fn is_busy(&self) -> bool {
        self.active.is_some()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn is_parked(&self) -> bool {
        self.parked
    }

    pub fn active_name(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.name.as_str())
    }

    /// Forget the active send and all pending requests.
    pub fn reset(&mut self) {
        if let Some(active) = self.active.take() {
            info!(
                event = "send_abandoned",
                file = %active.name,
                sent = active.offset,
                size = active.size,
                "Outbound transfer abandoned"
            );
        }
        self.pending.clear();
        self.parked = false;
    }

    /// Make progress on the active send, starting the next pending request
    /// if nothing is in flight.
    pub async fn pump<T>(&mut self, catalog: &Catalog, channel: &T) -> PumpOutcome
    where
        T: TransferChannel + ?Sized,
    {
        self.parked = false;

        if self.active.is_none() {
            let Some(name) = self.pending.pop_front() else {
                return PumpOutcome::Idle;
            };
            if let Some(dropped) = self.start(name, catalog, channel).await {
                return dropped;
            }
        }

        self.stream(channel).await
    }

    /// Open a send for `name`. Returns an outcome only if the request was
    /// dropped.
    async fn start<T>(&mut self, name: String, catalog: &Catalog, channel: &T) -> Option<PumpOutcome>
    where
        T: TransferChannel + ?Sized,
    {
        let Some(record) = catalog.get(&name) else {
            warn!(event = "send_unknown_file", file = %name, "Peer requested a file we do not offer");
            return Some(PumpOutcome::Dropped { name });
        };
        let Some(source) = record.content.as_ref() else {
            warn!(event = "send_no_content", file = %name, "Record has no content handle");
            return Some(PumpOutcome::Dropped { name });
        };
        if !channel.is_open() {
            debug!(event = "send_channel_closed", file = %name, "Channel not open, request dropped");
            return Some(PumpOutcome::Dropped { name });
        }

        let begin = ControlMessage::BeginTransfer(record.meta());
        let sent = match begin.encode() {
            Ok(text) => channel.send_text(text).await,
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            warn!(event = "send_begin_failed", file = %name, error = %e);
            return Some(PumpOutcome::Dropped { name });
        }

        info!(
            event = "send_started",
            file = %name,
            size = record.size,
            chunk_size = self.config.chunk_size,
            "Outbound transfer started"
        );
        self.active = Some(ActiveSend {
            name,
            size: record.size,
            offset: 0,
            chunks: 0,
            reader: SliceReader::new(source),
        });
        None
    }

    async fn stream<T>(&mut self, channel: &T) -> PumpOutcome
    where
        T: TransferChannel + ?Sized,
    {
        let chunk_size = self.config.chunk_size as u64;
        let high = self.config.high_water_mark;
        let budget = self.config.sends_per_turn;

        let Some(active) = self.active.as_mut() else {
            return PumpOutcome::Idle;
        };

        let mut sent_this_turn = 0usize;
        while active.remaining() > 0 {
            if !channel.is_open() {
                return self.fail(anyhow!("data channel closed mid-transfer"));
            }
            if sent_this_turn >= budget {
                return PumpOutcome::Yielded;
            }

            let len = active.remaining().min(chunk_size) as usize;
            let buffered = channel.buffered_amount().await;
            if buffered > 0 && buffered + len > high {
                debug!(
                    event = "send_parked",
                    file = %active.name,
                    buffered,
                    next = len,
                    high_water_mark = high,
                    "Applying backpressure"
                );
                self.parked = true;
                return PumpOutcome::Parked;
            }

            let slice = match active.reader.read(active.offset, len).await {
                Ok(slice) => slice,
                Err(e) => return self.fail(e),
            };
            if let Err(e) = channel.send_binary(slice).await {
                return self.fail(e);
            }
            active.offset += len as u64;
            active.chunks += 1;
            sent_this_turn += 1;
        }

        let end = ControlMessage::EndTransfer {
            name: active.name.clone(),
        };
        let sent = match end.encode() {
            Ok(text) => channel.send_text(text).await,
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            return self.fail(e);
        }

        let Some(done) = self.active.take() else {
            return PumpOutcome::Idle;
        };
        info!(
            event = "send_complete",
            file = %done.name,
            bytes = done.size,
            chunks = done.chunks,
            "Outbound transfer complete"
        );
        PumpOutcome::Finished {
            name: done.name,
            chunks: done.chunks,
        }
    }

    fn fail(&mut self, error: anyhow::Error) -> PumpOutcome {
        let name = self
            .active
            .take()
            .map(|a| a.name)
            .unwrap_or_default();
        warn!(event = "send_failed", file = %name, error = %error, "Outbound transfer aborted");
        PumpOutcome::Failed {
            name,
            error: error.to_string(),
        }
    }
}

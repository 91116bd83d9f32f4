//! Session event vocabulary.
//!
//! Everything that can happen to a session (user commands, relay
//! notifications, data-channel callbacks) is funnelled into one
//! [`SessionEvent`] queue and processed by the coordinator one at a time,
//! in arrival order. Everything the session wants a front-end to know
//! leaves as a [`SessionUpdate`].

use crate::core::catalog::{FileRecord, LocalFile};
use crate::core::pipeline::receiver::ReceivedFile;
use crate::core::protocol::SignalPayload;
use crate::core::session::state::SessionState;
use anyhow::{anyhow, Result};
use bytes::Bytes;
use tokio::sync::mpsc;

// ── Inbound ──────────────────────────────────────────────────────────────────

/// User actions.
#[derive(Debug, Clone)]
pub enum Command {
    /// Ask the relay for a fresh room and host it.
    Create,
    /// Join an existing room by code.
    Join(String),
    /// Tear everything down and return to idle.
    Cancel,
    /// Offer more local files (latest record per name wins).
    AddFiles(Vec<LocalFile>),
    /// Download every file in the remote catalog.
    RequestAll,
    /// Download one file from the remote catalog.
    RequestOne(String),
}

/// Notifications from the signaling relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    RoomCreated(String),
    PeerJoined,
    PeerLeft,
    RoomFull,
    RoomNotFound,
    SessionCancelled,
    Signal(SignalPayload),
    /// The relay connection itself went away.
    Disconnected(String),
}

/// Callbacks from one peer link (connection + data channel).
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// A locally gathered candidate that must be relayed to the peer.
    LocalSignal(SignalPayload),
    Connected,
    /// The peer connection failed or closed.
    Lost,
    ChannelOpen,
    ChannelClosed,
    Text(String),
    Binary(Bytes),
    /// The outbound buffer drained to the low-water threshold.
    BufferedAmountLow,
    Error(String),
}

/// The single inbound event type of the coordinator loop.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Command(Command),
    Relay(RelayEvent),
    /// A link callback, stamped with the epoch of the link that produced it.
    Link { epoch: u64, event: LinkEvent },
    /// Self-posted wake-up for the chunk sender.
    ResumeSend,
}

pub type EventSender = mpsc::UnboundedSender<SessionEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<SessionEvent>;

/// Event sink handed to one link. Stamps every event with the link's epoch
/// so the coordinator can drop callbacks from links it already discarded.
#[derive(Debug, Clone)]
pub struct LinkEvents {
    epoch: u64,
    tx: EventSender,
}

impl LinkEvents {
    pub fn new(epoch: u64, tx: EventSender) -> Self {
        Self { epoch, tx }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Returns `false` once the coordinator is gone.
    pub fn emit(&self, event: LinkEvent) -> bool {
        self.tx
            .send(SessionEvent::Link {
                epoch: self.epoch,
                event,
            })
            .is_ok()
    }
}

/// Cloneable front-end handle: submits commands and hands out the raw
/// sender that relay and link implementations push their events into.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    tx: EventSender,
}

impl SessionHandle {
    pub fn sender(&self) -> EventSender {
        self.tx.clone()
    }

    pub fn send(&self, command: Command) -> Result<()> {
        self.tx
            .send(SessionEvent::Command(command))
            .map_err(|_| anyhow!("session loop has stopped"))
    }

    pub fn create(&self) -> Result<()> {
        self.send(Command::Create)
    }

    pub fn join(&self, code: impl Into<String>) -> Result<()> {
        self.send(Command::Join(code.into()))
    }

    pub fn cancel(&self) -> Result<()> {
        self.send(Command::Cancel)
    }

    pub fn add_files(&self, files: Vec<LocalFile>) -> Result<()> {
        self.send(Command::AddFiles(files))
    }

    pub fn request_all(&self) -> Result<()> {
        self.send(Command::RequestAll)
    }

    pub fn request_one(&self, name: impl Into<String>) -> Result<()> {
        self.send(Command::RequestOne(name.into()))
    }
}

/// Create the coordinator's inbox and the handle that feeds it.
pub fn inbox() -> (SessionHandle, EventReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (SessionHandle { tx }, rx)
}

// ── Outbound ─────────────────────────────────────────────────────────────────

/// User-visible statuses that do not change the session state by themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notice {
    RoomFull,
    RoomNotFound,
    InvalidCode,
    SessionCancelledByHost,
    PeerLeft,
    PeerLost,
    NegotiationFailed,
    RelayUnavailable,
    PeerDownloadComplete,
}

impl Notice {
    pub fn message(&self) -> &'static str {
        match self {
            Notice::RoomFull => "Session is full.",
            Notice::RoomNotFound => "Share code not found.",
            Notice::InvalidCode => "Please enter a valid 4-digit code.",
            Notice::SessionCancelledByHost => "The session was ended by the host.",
            Notice::PeerLeft => "Peer left the session.",
            Notice::PeerLost => "Connection to peer lost.",
            Notice::NegotiationFailed => "Could not establish a connection to the peer.",
            Notice::RelayUnavailable => "Signaling relay unavailable.",
            Notice::PeerDownloadComplete => "Files sent successfully!",
        }
    }
}

/// Events delivered from the coordinator to the front-end.
#[derive(Debug, Clone)]
pub enum SessionUpdate {
    StateChanged(SessionState),
    RoomCreated(String),
    Notice(Notice),
    /// The remote catalog after an announcement was applied.
    RemoteCatalog(Vec<FileRecord>),
    FileProgress { name: String, percent: u8 },
    BatchProgress { percent: u8 },
    FileReceived(ReceivedFile),
    /// The download queue drained.
    DownloadFinished,
    TransferStalled { name: String },
    SendFinished { name: String, chunks: u64 },
    SendFailed { name: String, error: String },
    /// All session state was discarded.
    Reset,
}

pub type UpdateSender = mpsc::UnboundedSender<SessionUpdate>;
pub type UpdateReceiver = mpsc::UnboundedReceiver<SessionUpdate>;

/// Forward an update to the front-end, if one is still listening.
#[inline]
pub(crate) fn notify_app(tx: &UpdateSender, update: SessionUpdate) {
    let _ = tx.send(update);
}

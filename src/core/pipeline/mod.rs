//! Transfer pipeline: chunk sender, inbound reassembly, download queue.
//!
//! None of these types own a task or a channel. The session coordinator
//! owns them and drives them from its event loop.

pub mod queue;
pub mod receiver;
pub mod sender;

pub use queue::{DownloadQueue, QueueStep};
pub use receiver::{ReceivedFile, Reassembler};
pub use sender::{ChunkSender, PumpOutcome};

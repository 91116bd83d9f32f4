//! Headless front-end: drives one session from the command line.
//!
//! The coordinator runs on its own task; this worker submits the initial
//! commands, follows the update stream, prints progress, and writes
//! received files to the output directory.

use crate::core::catalog::{FileRecord, LocalFile};
use crate::core::connection::{WebRtcConnector, WsRelay};
use crate::core::session::{inbox, Coordinator, Notice, SessionHandle, SessionState, SessionUpdate};
use crate::utils::artifact::save_artifact;
use crate::utils::formatters::{format_file_size, progress_bar};
use crate::utils::sos::SignalOfStop;
use crate::workers::args::{Mode, Settings};
use anyhow::{anyhow, bail, Context, Result};
use std::path::PathBuf;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};

const BAR_WIDTH: usize = 30;

/// What the front-end loop should do after an update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Done,
    Abort(String),
}

#[derive(Debug)]
enum Side {
    Host,
    Join {
        out_dir: PathBuf,
        only: Vec<String>,
        requested: bool,
    },
}

/// Turns session updates into console output and follow-up commands.
#[derive(Debug)]
pub struct Console {
    side: Side,
    last_notice: Option<Notice>,
    saved: Vec<PathBuf>,
}

impl Console {
    pub fn host() -> Self {
        Self {
            side: Side::Host,
            last_notice: None,
            saved: Vec::new(),
        }
    }

    pub fn join(out_dir: PathBuf, only: Vec<String>) -> Self {
        Self {
            side: Side::Join {
                out_dir,
                only,
                requested: false,
            },
            last_notice: None,
            saved: Vec::new(),
        }
    }

    /// Paths of every file written so far.
    pub fn saved(&self) -> &[PathBuf] {
        &self.saved
    }

    pub fn on_update(&mut self, update: SessionUpdate, handle: &SessionHandle) -> Result<Flow> {
        match update {
            SessionUpdate::StateChanged(state) => {
                debug!(event = "ui_state", state = %state);
                if state == SessionState::Negotiating {
                    println!("Peer found, connecting...");
                }
                if state == SessionState::ConnectedIdle && matches!(self.side, Side::Host) {
                    println!("Connected. Waiting for requests.");
                }
            }
            SessionUpdate::RoomCreated(code) => {
                println!("Room code: {code}");
                println!("Share it with the receiving peer: roomdrop join {code}");
            }
            SessionUpdate::Notice(notice) => {
                self.last_notice = Some(notice);
                eprintln!("{}", notice.message());
                if matches!(self.side, Side::Join { .. })
                    && matches!(notice, Notice::RoomFull | Notice::RoomNotFound | Notice::InvalidCode)
                {
                    return Ok(Flow::Abort(notice.message().to_string()));
                }
            }
            SessionUpdate::RemoteCatalog(records) => return self.on_catalog(&records, handle),
            SessionUpdate::FileProgress { name, percent } => {
                if percent == 100 {
                    debug!(event = "ui_file_done", file = %name);
                }
            }
            SessionUpdate::BatchProgress { percent } => {
                println!("{}", progress_bar(percent, BAR_WIDTH));
            }
            SessionUpdate::FileReceived(file) => {
                let Side::Join { out_dir, .. } = &self.side else {
                    warn!(event = "ui_unexpected_file", file = %file.name);
                    return Ok(Flow::Continue);
                };
                let path = save_artifact(out_dir, &file)
                    .with_context(|| format!("cannot save {}", file.name))?;
                println!("Saved {} ({})", path.display(), format_file_size(file.size()));
                self.saved.push(path);
            }
            SessionUpdate::DownloadFinished => {
                println!("All files received.");
                return Ok(Flow::Done);
            }
            SessionUpdate::TransferStalled { name } => {
                eprintln!("Transfer of {name} stalled and was abandoned.");
            }
            SessionUpdate::SendFinished { name, chunks } => {
                println!("Sent {name} ({chunks} chunks)");
            }
            SessionUpdate::SendFailed { name, error } => {
                eprintln!("Sending {name} failed: {error}");
            }
            SessionUpdate::Reset => {
                let reason = self
                    .last_notice
                    .map(|n| n.message().to_string())
                    .unwrap_or_else(|| "Session ended.".to_string());
                return Ok(Flow::Abort(reason));
            }
        }
        Ok(Flow::Continue)
    }

    fn on_catalog(&mut self, records: &[FileRecord], handle: &SessionHandle) -> Result<Flow> {
        let Side::Join { only, requested, .. } = &mut self.side else {
            return Ok(Flow::Continue);
        };

        println!("Peer offers {} file(s):", records.len());
        for record in records {
            println!("  {}  {}  {}", record.name, format_file_size(record.size), record.mime_type);
        }
        if *requested {
            return Ok(Flow::Continue);
        }
        if records.is_empty() {
            println!("Waiting for the host to add files...");
            return Ok(Flow::Continue);
        }

        if only.is_empty() {
            handle.request_all()?;
        } else {
            let wanted: Vec<&String> = only
                .iter()
                .filter(|name| records.iter().any(|r| &r.name == *name))
                .collect();
            if wanted.is_empty() {
                return Ok(Flow::Abort(format!("None of {} is offered by the peer.", only.join(", "))));
            }
            for name in wanted {
                handle.request_one(name.clone())?;
            }
        }
        *requested = true;
        Ok(Flow::Continue)
    }
}

/// Connect to the relay, run one session in `mode`, and return when it is
/// over or `sos` fires.
pub async fn run(mode: Mode, settings: Settings, sos: SignalOfStop) -> Result<()> {
    let (handle, events) = inbox();
    let relay = WsRelay::connect(&settings.relay_url, handle.sender()).await?;
    let connector = WebRtcConnector::new(settings.ice_servers.clone());
    let (coordinator, updates) =
        Coordinator::new(relay, connector, settings.transfer.clone(), &handle, events);
    let session = tokio::spawn(coordinator.run(sos.clone()));

    let console = match mode {
        Mode::Host { files } => {
            let files = files
                .iter()
                .map(LocalFile::from_path)
                .collect::<Result<Vec<_>>>()?;
            info!(event = "hosting", files = files.len(), "Offering files");
            handle.add_files(files)?;
            handle.create()?;
            Console::host()
        }
        Mode::Join { code, only, .. } => {
            handle.join(code)?;
            Console::join(settings.out_dir.clone(), only)
        }
    };

    let outcome = follow(console, updates, &handle, &sos).await;
    sos.cancel();
    session
        .await
        .map_err(|e| anyhow!("session task failed: {e}"))??;
    outcome
}

async fn follow(
    mut console: Console,
    mut updates: UnboundedReceiver<SessionUpdate>,
    handle: &SessionHandle,
    sos: &SignalOfStop,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = sos.wait() => {
                info!(event = "ui_stopping", "Interrupted");
                return Ok(());
            }
            update = updates.recv() => {
                let Some(update) = update else {
                    bail!("session loop ended unexpectedly");
                };
                match console.on_update(update, handle)? {
                    Flow::Continue => {}
                    Flow::Done => return Ok(()),
                    Flow::Abort(reason) => bail!(reason),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::catalog::Origin;
    use crate::core::pipeline::ReceivedFile;
    use crate::core::session::{Command, SessionEvent};
    use bytes::Bytes;

    fn record(name: &str) -> FileRecord {
        FileRecord {
            name: name.into(),
            size: 3,
            mime_type: "text/plain".into(),
            origin: Origin::Remote,
            progress: 0,
            content: None,
        }
    }

    fn commands(rx: &mut crate::core::session::events::EventReceiver) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let SessionEvent::Command(command) = event {
                out.push(match command {
                    Command::RequestAll => "all".to_string(),
                    Command::RequestOne(name) => format!("one:{name}"),
                    other => format!("{other:?}"),
                });
            }
        }
        out
    }

    #[test]
    fn joiner_requests_everything_once() {
        let (handle, mut rx) = inbox();
        let mut console = Console::join(PathBuf::from("."), Vec::new());

        let catalog = SessionUpdate::RemoteCatalog(vec![record("a"), record("b")]);
        assert_eq!(console.on_update(catalog.clone(), &handle).unwrap(), Flow::Continue);
        assert_eq!(console.on_update(catalog, &handle).unwrap(), Flow::Continue);
        assert_eq!(commands(&mut rx), vec!["all".to_string()]);
    }

    #[test]
    fn joiner_waits_for_a_non_empty_catalog() {
        let (handle, mut rx) = inbox();
        let mut console = Console::join(PathBuf::from("."), Vec::new());

        console.on_update(SessionUpdate::RemoteCatalog(Vec::new()), &handle).unwrap();
        assert!(commands(&mut rx).is_empty());
        console.on_update(SessionUpdate::RemoteCatalog(vec![record("a")]), &handle).unwrap();
        assert_eq!(commands(&mut rx), vec!["all".to_string()]);
    }

    #[test]
    fn only_filters_requests() {
        let (handle, mut rx) = inbox();
        let mut console = Console::join(PathBuf::from("."), vec!["b".into(), "zzz".into()]);

        console
            .on_update(SessionUpdate::RemoteCatalog(vec![record("a"), record("b")]), &handle)
            .unwrap();
        assert_eq!(commands(&mut rx), vec!["one:b".to_string()]);

        let mut picky = Console::join(PathBuf::from("."), vec!["zzz".into()]);
        let flow = picky
            .on_update(SessionUpdate::RemoteCatalog(vec![record("a")]), &handle)
            .unwrap();
        assert!(matches!(flow, Flow::Abort(_)));
    }

    #[test]
    fn joiner_aborts_on_unknown_room_and_reset() {
        let (handle, _rx) = inbox();
        let mut console = Console::join(PathBuf::from("."), Vec::new());
        let flow = console
            .on_update(SessionUpdate::Notice(Notice::RoomNotFound), &handle)
            .unwrap();
        assert_eq!(flow, Flow::Abort(Notice::RoomNotFound.message().to_string()));

        let mut console = Console::join(PathBuf::from("."), Vec::new());
        console
            .on_update(SessionUpdate::Notice(Notice::SessionCancelledByHost), &handle)
            .unwrap();
        let flow = console.on_update(SessionUpdate::Reset, &handle).unwrap();
        assert_eq!(flow, Flow::Abort(Notice::SessionCancelledByHost.message().to_string()));
    }

    #[test]
    fn host_keeps_going_after_peer_leaves() {
        let (handle, _rx) = inbox();
        let mut console = Console::host();
        let flow = console
            .on_update(SessionUpdate::Notice(Notice::PeerLeft), &handle)
            .unwrap();
        assert_eq!(flow, Flow::Continue);
        let flow = console
            .on_update(SessionUpdate::StateChanged(SessionState::Hosting), &handle)
            .unwrap();
        assert_eq!(flow, Flow::Continue);
    }

    #[test]
    fn received_files_are_saved_and_download_finishes() {
        let dir = std::env::temp_dir().join("roomdrop_test").join("console");
        let _ = std::fs::remove_dir_all(&dir);
        let (handle, _rx) = inbox();
        let mut console = Console::join(dir.clone(), Vec::new());

        let file = ReceivedFile {
            name: "hello.txt".into(),
            mime_type: "text/plain".into(),
            data: Bytes::from_static(b"hey"),
        };
        console.on_update(SessionUpdate::FileReceived(file), &handle).unwrap();
        assert_eq!(console.saved(), &[dir.join("hello.txt")]);
        assert_eq!(std::fs::read(dir.join("hello.txt")).unwrap(), b"hey");

        let flow = console.on_update(SessionUpdate::DownloadFinished, &handle).unwrap();
        assert_eq!(flow, Flow::Done);
        let _ = std::fs::remove_dir_all(&dir);
    }
}

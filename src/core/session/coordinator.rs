//! Session coordinator: the one event loop that owns a session.
//!
//! Every input (user command, relay notification, link callback) arrives
//! as a [`SessionEvent`] and is handled to completion before the next one
//! is looked at. That total order is what keeps "one open transfer" and
//! "one outstanding request" true without locks.
//!
//! # Link epochs
//!
//! Each prepared link gets a fresh epoch and stamps its callbacks with it.
//! Discarding a link bumps the epoch, so late callbacks from a closed link
//! (chunks, requests, close notifications) are dropped on arrival instead
//! of acting on state that no longer exists.
//!
//! # Recovery
//!
//! ```text
//! Idle ─create─► Hosting ─peer-joined─► Negotiating ─channel-open─► Connected
//!                  ▲                                                   │
//!                  └──────────── peer-left / lost (host) ──────────────┘
//! ```
//!
//! A joiner that loses its peer goes back to Idle and must rejoin.

use crate::core::config::{TransferConfig, ROOM_CODE_LEN};
use crate::core::connection::{Connector, PeerLink, SignalingRelay, TransferChannel};
use crate::core::pipeline::queue::{DownloadQueue, QueueStep};
use crate::core::pipeline::receiver::Reassembler;
use crate::core::pipeline::sender::{ChunkSender, PumpOutcome};
use crate::core::protocol::{ControlMessage, SignalPayload};
use crate::core::session::events::{
    notify_app, Command, EventReceiver, EventSender, LinkEvent, LinkEvents, Notice, RelayEvent,
    SessionEvent, SessionHandle, SessionUpdate, UpdateReceiver, UpdateSender,
};
use crate::core::session::state::{Phase, Role, Session, SessionState};
use crate::utils::sos::SignalOfStop;
use anyhow::{anyhow, Result};
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// `true` for exactly [`ROOM_CODE_LEN`] ASCII digits.
pub fn valid_room_code(code: &str) -> bool {
    code.len() == ROOM_CODE_LEN && code.bytes().all(|b| b.is_ascii_digit())
}

async fn stall_timer(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

pub struct Coordinator<R, C>
where
    R: SignalingRelay,
    C: Connector,
{
    relay: R,
    connector: C,
    config: TransferConfig,
    session: Session,
    link: Option<C::Link>,
    epoch: u64,
    sender: ChunkSender,
    receiver: Reassembler,
    events_tx: EventSender,
    inbox: EventReceiver,
    updates: UpdateSender,
    last_state: SessionState,
}

impl<R, C> Coordinator<R, C>
where
    R: SignalingRelay,
    C: Connector,
{
    /// Build a coordinator around the inbox created by
    /// [`inbox`](crate::core::session::events::inbox). Returns the stream of
    /// updates for the front-end.
    pub fn new(
        relay: R,
        connector: C,
        config: TransferConfig,
        handle: &SessionHandle,
        inbox: EventReceiver,
    ) -> (Self, UpdateReceiver) {
        let config = config.sanitized();
        let (updates, updates_rx) = mpsc::unbounded_channel();
        let coordinator = Self {
            relay,
            connector,
            sender: ChunkSender::new(config.clone()),
            config,
            session: Session::new(),
            link: None,
            epoch: 0,
            receiver: Reassembler::new(),
            events_tx: handle.sender(),
            inbox,
            updates,
            last_state: SessionState::Idle,
        };
        (coordinator, updates_rx)
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn link(&self) -> Option<&C::Link> {
        self.link.as_ref()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn receiver(&self) -> &Reassembler {
        &self.receiver
    }

    pub fn sender(&self) -> &ChunkSender {
        &self.sender
    }

    /// Run until `sos` fires. On stop the session is cancelled, which
    /// notifies the peer when we are hosting.
    pub async fn run(mut self, sos: SignalOfStop) -> Result<()> {
        info!(event = "coordinator_started", session = %self.session.id, "Session loop running");
        loop {
            let stall = self.receiver.stall_deadline(self.config.stall_timeout);
            tokio::select! {
                _ = sos.wait() => {
                    info!(event = "coordinator_stopping", "Stop requested, cancelling session");
                    self.handle_event(SessionEvent::Command(Command::Cancel)).await;
                    return Ok(());
                }
                event = self.inbox.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => return Err(anyhow!("session event queue closed")),
                },
                _ = stall_timer(stall) => {
                    self.check_stall().await;
                    self.publish_state();
                }
            }
        }
    }

    /// Handle every event already queued, without waiting for more.
    /// Returns how many were handled.
    pub async fn process_pending(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.inbox.try_recv() {
            self.handle_event(event).await;
            handled += 1;
        }
        handled
    }

    pub async fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Command(command) => self.on_command(command).await,
            SessionEvent::Relay(event) => self.on_relay(event).await,
            SessionEvent::Link { epoch, event } => {
                if epoch != self.epoch || self.link.is_none() {
                    trace!(event = "stale_link_event", epoch, current = self.epoch);
                } else {
                    self.on_link(event).await;
                }
            }
            SessionEvent::ResumeSend => self.pump_sender().await,
        }
        self.publish_state();
    }

    // ── Commands ──────────────────────────────────────────────────────────

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Create => self.create().await,
            Command::Join(code) => self.join(code.trim().to_string()).await,
            Command::Cancel => self.cancel().await,
            Command::AddFiles(files) => {
                for file in files {
                    debug!(event = "local_file_added", file = %file.name, size = file.size);
                    self.session.local.insert(file.into());
                }
                if self.session.phase == Phase::Connected {
                    self.announce().await;
                }
            }
            Command::RequestAll => self.request_downloads(None).await,
            Command::RequestOne(name) => self.request_downloads(Some(name)).await,
        }
    }

    async fn create(&mut self) {
        if self.session.phase != Phase::Idle {
            warn!(event = "create_ignored", state = %self.session.state(), "Session already active");
            return;
        }
        self.session.begin(Role::Host, None, Phase::Hosting);
        if let Err(e) = self.relay.create_room().await {
            warn!(event = "relay_create_failed", error = %e);
            self.notice(Notice::RelayUnavailable);
            self.reset().await;
        }
    }

    async fn join(&mut self, code: String) {
        if !valid_room_code(&code) {
            self.notice(Notice::InvalidCode);
            return;
        }
        let rejoin = self.session.phase == Phase::Joining && self.session.is_joiner();
        if self.session.phase != Phase::Idle && !rejoin {
            warn!(event = "join_ignored", state = %self.session.state(), "Session already active");
            return;
        }
        self.session.begin(Role::Joiner, Some(code.clone()), Phase::Joining);
        info!(event = "joining", room = %code, session = %self.session.id);
        if let Err(e) = self.relay.join_room(&code).await {
            warn!(event = "relay_join_failed", error = %e);
            self.notice(Notice::RelayUnavailable);
            self.reset().await;
        }
    }

    async fn cancel(&mut self) {
        if self.session.is_host() {
            if let Some(room) = self.session.room.clone() {
                if let Err(e) = self.relay.cancel_session(&room).await {
                    warn!(event = "relay_cancel_failed", room = %room, error = %e, "Peer may not learn of the cancel");
                }
            }
        }
        self.reset().await;
    }

    async fn request_downloads(&mut self, name: Option<String>) {
        if self.session.phase != Phase::Connected {
            warn!(event = "download_ignored", state = %self.session.state(), "Not connected");
            return;
        }
        let queue = self.session.queue.get_or_insert_with(DownloadQueue::new);
        let request = match name.as_deref() {
            Some(name) => queue.request_one(&self.session.remote, name),
            None => queue.request_all(&self.session.remote),
        };
        if queue.is_empty() {
            self.session.queue = None;
        }
        if let Some(request) = request {
            self.send_control(&request).await;
        }
    }

    // ── Relay ─────────────────────────────────────────────────────────────

    async fn on_relay(&mut self, event: RelayEvent) {
        match event {
            RelayEvent::RoomCreated(code) => self.on_room_created(code).await,
            RelayEvent::PeerJoined => {
                if !(self.session.is_host() && self.session.phase == Phase::Hosting) {
                    debug!(event = "peer_joined_ignored", state = %self.session.state());
                    return;
                }
                info!(event = "peer_joined", room = ?self.session.room, "Peer joined, sending offer");
                if let Err(e) = self.send_offer().await {
                    self.negotiation_failed(e).await;
                }
            }
            RelayEvent::PeerLeft => match self.session.role {
                Some(Role::Host) => {
                    info!(event = "peer_left", room = ?self.session.room, "Peer left, awaiting a new one");
                    self.notice(Notice::PeerLeft);
                    self.rehost().await;
                }
                Some(Role::Joiner) => {
                    self.notice(Notice::PeerLeft);
                    self.reset().await;
                }
                None => {}
            },
            RelayEvent::RoomFull => self.notice(Notice::RoomFull),
            RelayEvent::RoomNotFound => self.notice(Notice::RoomNotFound),
            RelayEvent::SessionCancelled => {
                if self.session.phase != Phase::Idle {
                    self.notice(Notice::SessionCancelledByHost);
                    self.reset().await;
                }
            }
            RelayEvent::Signal(payload) => self.on_signal(payload).await,
            RelayEvent::Disconnected(reason) => {
                warn!(event = "relay_lost", reason = %reason);
                self.notice(Notice::RelayUnavailable);
            }
        }
    }

    async fn on_room_created(&mut self, code: String) {
        if !(self.session.is_host() && self.session.phase == Phase::Hosting && self.session.room.is_none()) {
            debug!(event = "room_created_ignored", room = %code);
            return;
        }
        info!(event = "room_created", room = %code, session = %self.session.id, "Hosting room");
        self.session.room = Some(code.clone());
        self.notify(SessionUpdate::RoomCreated(code));
        if let Err(e) = self.open_link(Role::Host).await {
            warn!(event = "link_prepare_failed", error = %e);
            self.notice(Notice::NegotiationFailed);
            self.reset().await;
        }
    }

    async fn on_signal(&mut self, payload: SignalPayload) {
        match payload {
            SignalPayload::Offer { .. } => {
                let expecting = self.session.is_joiner()
                    && matches!(self.session.phase, Phase::Joining | Phase::Negotiating);
                if !expecting {
                    debug!(event = "offer_ignored", state = %self.session.state());
                    return;
                }
                if let Err(e) = self.accept_offer(payload).await {
                    self.negotiation_failed(e).await;
                }
            }
            SignalPayload::Answer { .. } => {
                if !(self.session.is_host() && self.session.phase == Phase::Negotiating) {
                    debug!(event = "answer_ignored", state = %self.session.state());
                    return;
                }
                let Some(link) = self.link.as_ref() else {
                    return;
                };
                if let Err(e) = link.apply_signal(payload).await {
                    self.negotiation_failed(e).await;
                }
            }
            SignalPayload::Candidate(_) => {
                let Some(link) = self.link.as_ref() else {
                    debug!(event = "candidate_without_link");
                    return;
                };
                if let Err(e) = link.apply_signal(payload).await {
                    warn!(event = "ice_candidate_rejected", error = %e);
                }
            }
        }
    }

    async fn send_offer(&mut self) -> Result<()> {
        if self.link.is_none() {
            self.open_link(Role::Host).await?;
        }
        let room = self.session.room.clone().ok_or_else(|| anyhow!("no room code"))?;
        let link = self.link.as_ref().ok_or_else(|| anyhow!("no peer link"))?;
        let offer = link.create_offer().await?;
        self.relay.signal(&room, offer).await?;
        self.session.transition(Phase::Negotiating);
        Ok(())
    }

    async fn accept_offer(&mut self, offer: SignalPayload) -> Result<()> {
        if self.link.is_none() {
            self.open_link(Role::Joiner).await?;
        }
        let room = self.session.room.clone().ok_or_else(|| anyhow!("no room code"))?;
        let link = self.link.as_ref().ok_or_else(|| anyhow!("no peer link"))?;
        let answer = link
            .apply_signal(offer)
            .await?
            .ok_or_else(|| anyhow!("offer produced no answer"))?;
        self.relay.signal(&room, answer).await?;
        self.session.transition(Phase::Negotiating);
        Ok(())
    }

    async fn negotiation_failed(&mut self, error: anyhow::Error) {
        warn!(event = "negotiation_failed", role = ?self.session.role, error = %error);
        self.notice(Notice::NegotiationFailed);
        if self.session.is_host() {
            self.rehost().await;
        } else {
            self.reset().await;
        }
    }

    // ── Link ──────────────────────────────────────────────────────────────

    async fn on_link(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::LocalSignal(payload) => {
                let Some(room) = self.session.room.clone() else {
                    debug!(event = "local_signal_without_room", kind = payload.kind());
                    return;
                };
                if let Err(e) = self.relay.signal(&room, payload).await {
                    warn!(event = "relay_signal_failed", error = %e);
                }
            }
            LinkEvent::Connected => {
                debug!(event = "peer_connected", session = %self.session.id);
            }
            LinkEvent::ChannelOpen => {
                if matches!(self.session.phase, Phase::Idle | Phase::Connected) {
                    return;
                }
                self.session.transition(Phase::Connected);
                info!(event = "channel_open", session = %self.session.id, role = ?self.session.role, "Transfer channel open");
                self.announce().await;
            }
            LinkEvent::Lost | LinkEvent::ChannelClosed => self.connection_lost().await,
            LinkEvent::Text(text) => match ControlMessage::decode(&text) {
                Ok(message) => self.on_control(message).await,
                Err(e) => warn!(event = "control_desync", error = %e, "Dropping unparseable control message"),
            },
            LinkEvent::Binary(data) => self.on_chunk(data),
            LinkEvent::BufferedAmountLow => {
                if self.sender.is_parked() {
                    self.pump_sender().await;
                }
            }
            LinkEvent::Error(e) => warn!(event = "channel_error", error = %e),
        }
    }

    async fn connection_lost(&mut self) {
        if self.session.phase == Phase::Idle {
            return;
        }
        warn!(event = "peer_connection_lost", role = ?self.session.role, state = %self.session.state());
        self.notice(Notice::PeerLost);
        if self.session.is_host() {
            self.rehost().await;
        } else {
            self.reset().await;
        }
    }

    async fn on_control(&mut self, message: ControlMessage) {
        debug!(event = "control_received", kind = message.kind());
        match message {
            ControlMessage::FileList(list) => {
                self.session.remote.apply_announcement(list);
                self.notify(SessionUpdate::RemoteCatalog(self.session.remote.records().to_vec()));
            }
            ControlMessage::RequestFile { name } => {
                if self.session.phase != Phase::Connected {
                    debug!(event = "request_dropped", file = %name, "Not connected");
                    return;
                }
                self.sender.enqueue(name);
                if !self.sender.is_busy() {
                    self.pump_sender().await;
                }
            }
            ControlMessage::BeginTransfer(meta) => self.receiver.begin(meta),
            ControlMessage::EndTransfer { name } => {
                let Some(file) = self.receiver.finish(&name) else {
                    return;
                };
                self.session.remote.set_progress(&name, 100);
                self.notify(SessionUpdate::FileProgress {
                    name: name.clone(),
                    percent: 100,
                });
                self.session.downloads.insert(name.clone(), file.clone());
                self.notify(SessionUpdate::FileReceived(file));
                self.advance_queue(&name).await;
            }
            ControlMessage::DownloadComplete => {
                info!(event = "peer_download_complete", "Peer finished downloading");
                self.notice(Notice::PeerDownloadComplete);
            }
        }
    }

    fn on_chunk(&mut self, data: Bytes) {
        let Some(progress) = self.receiver.push_chunk(data) else {
            return;
        };

        let before = self.session.remote.get(&progress.name).map(|r| r.progress);
        self.session.remote.set_progress(&progress.name, progress.percent);
        let after = self.session.remote.get(&progress.name).map(|r| r.progress);
        if let Some(percent) = after.filter(|_| after != before) {
            self.notify(SessionUpdate::FileProgress {
                name: progress.name.clone(),
                percent,
            });
        }

        let Some(queue) = self.session.queue.as_mut() else {
            return;
        };
        if queue.in_flight().is_some_and(|f| f.name == progress.name) {
            let before = queue.last_reported();
            let percent = queue.aggregate_percent(progress.received);
            if percent != before {
                self.notify(SessionUpdate::BatchProgress { percent });
            }
        }
    }

    /// The head of the queue resolved (finished or stalled): request the
    /// next file or close the batch.
    async fn advance_queue(&mut self, name: &str) {
        let Some(queue) = self.session.queue.as_mut() else {
            return;
        };
        match queue.complete(name) {
            QueueStep::NotHead => {}
            QueueStep::Next(request) => {
                let before = queue.last_reported();
                let percent = queue.aggregate_percent(0);
                if percent != before {
                    self.notify(SessionUpdate::BatchProgress { percent });
                }
                self.send_control(&request).await;
            }
            QueueStep::Drained => {
                self.session.queue = None;
                self.notify(SessionUpdate::BatchProgress { percent: 100 });
                self.send_control(&ControlMessage::DownloadComplete).await;
                info!(event = "download_finished", files = self.session.downloads.len(), "Download queue drained");
                self.notify(SessionUpdate::DownloadFinished);
            }
        }
    }

    /// Drop an inbound transfer that has gone quiet for too long.
    pub(crate) async fn check_stall(&mut self) {
        let Some(ctx) = self
            .receiver
            .take_stalled(Instant::now(), self.config.stall_timeout)
        else {
            return;
        };
        self.notify(SessionUpdate::TransferStalled {
            name: ctx.name.clone(),
        });
        self.advance_queue(&ctx.name).await;
    }

    // ── Sending ───────────────────────────────────────────────────────────

    async fn pump_sender(&mut self) {
        let Some(link) = self.link.as_ref() else {
            self.sender.reset();
            return;
        };
        let outcome = self.sender.pump(&self.session.local, link).await;
        match outcome {
            PumpOutcome::Idle | PumpOutcome::Parked => return,
            PumpOutcome::Yielded => {
                self.post(SessionEvent::ResumeSend);
                return;
            }
            PumpOutcome::Finished { name, chunks } => {
                self.notify(SessionUpdate::SendFinished { name, chunks });
            }
            PumpOutcome::Dropped { name } => {
                debug!(event = "send_dropped", file = %name);
            }
            PumpOutcome::Failed { name, error } => {
                self.notify(SessionUpdate::SendFailed { name, error });
            }
        }
        if self.sender.has_pending() {
            self.post(SessionEvent::ResumeSend);
        }
    }

    async fn announce(&self) {
        let message = self.session.local.announcement();
        self.send_control(&message).await;
    }

    async fn send_control(&self, message: &ControlMessage) -> bool {
        let Some(link) = self.link.as_ref() else {
            debug!(event = "control_dropped", kind = message.kind(), "No link");
            return false;
        };
        if !link.is_open() {
            debug!(event = "control_dropped", kind = message.kind(), "Channel not open");
            return false;
        }
        let text = match message.encode() {
            Ok(text) => text,
            Err(e) => {
                warn!(event = "control_encode_failed", kind = message.kind(), error = %e);
                return false;
            }
        };
        match link.send_text(text).await {
            Ok(()) => {
                debug!(event = "control_sent", kind = message.kind());
                true
            }
            Err(e) => {
                warn!(event = "control_send_failed", kind = message.kind(), error = %e);
                false
            }
        }
    }

    // ── Lifecycle helpers ─────────────────────────────────────────────────

    async fn open_link(&mut self, role: Role) -> Result<()> {
        self.drop_link().await;
        let events = LinkEvents::new(self.epoch, self.events_tx.clone());
        let link = self.connector.prepare(role, events, &self.config).await?;
        self.link = Some(link);
        Ok(())
    }

    async fn drop_link(&mut self) {
        self.epoch += 1;
        if let Some(link) = self.link.take() {
            link.close().await;
        }
    }

    /// Host only: forget the current peer and listen for a new one in the
    /// same room.
    async fn rehost(&mut self) {
        self.drop_link().await;
        self.sender.reset();
        self.receiver.reset();
        self.session.clear_peer();
        self.session.transition(Phase::Hosting);
        if let Err(e) = self.open_link(Role::Host).await {
            warn!(event = "link_prepare_failed", error = %e);
            self.notice(Notice::NegotiationFailed);
            self.reset().await;
        }
    }

    async fn reset(&mut self) {
        self.drop_link().await;
        self.sender.reset();
        self.receiver.reset();
        self.session.reset();
        info!(event = "session_reset", "Session state discarded");
        self.notify(SessionUpdate::Reset);
    }

    fn post(&self, event: SessionEvent) {
        let _ = self.events_tx.send(event);
    }

    fn notify(&self, update: SessionUpdate) {
        notify_app(&self.updates, update);
    }

    fn notice(&self, notice: Notice) {
        info!(event = "notice", notice = ?notice, message = notice.message());
        self.notify(SessionUpdate::Notice(notice));
    }

    fn publish_state(&mut self) {
        let state = self.session.state();
        if state != self.last_state {
            self.last_state = state;
            self.notify(SessionUpdate::StateChanged(state));
        }
    }
}

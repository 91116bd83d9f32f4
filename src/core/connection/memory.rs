//! In-process transports.
//!
//! [`MemoryRelayHub`] implements the relay's room semantics (4-digit codes,
//! one host, at most one joiner) for any number of clients in one process.
//! [`MemoryConnector`] builds [`MemoryLink`]s that pair up through the usual
//! offer/answer exchange and deliver messages straight into the peer's event
//! queue.
//!
//! A link can retain outbound frames instead of delivering them, which
//! makes `buffered_amount` observable and lets a caller drain the buffer
//! by hand.

use crate::core::config::TransferConfig;
use crate::core::connection::{Connector, PeerLink, SignalingRelay, TransferChannel};
use crate::core::protocol::SignalPayload;
use crate::core::session::events::{EventSender, LinkEvent, LinkEvents, RelayEvent, SessionEvent};
use crate::core::session::state::Role;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, info};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Relay ────────────────────────────────────────────────────────────────────

struct Room {
    host: u64,
    joiner: Option<u64>,
}

#[derive(Default)]
struct HubState {
    next_client: u64,
    next_code: u16,
    clients: HashMap<u64, EventSender>,
    rooms: HashMap<String, Room>,
}

impl HubState {
    fn deliver(&self, client: u64, event: RelayEvent) {
        if let Some(tx) = self.clients.get(&client) {
            let _ = tx.send(SessionEvent::Relay(event));
        }
    }

    fn fresh_code(&mut self) -> String {
        loop {
            if !(1000..=9999).contains(&self.next_code) {
                self.next_code = 1000;
            }
            let code = self.next_code.to_string();
            self.next_code += 1;
            if !self.rooms.contains_key(&code) {
                return code;
            }
        }
    }
}

/// Shared room registry. Cloning shares the registry.
#[derive(Clone, Default)]
pub struct MemoryRelayHub {
    state: Arc<Mutex<HubState>>,
}

impl MemoryRelayHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect a new client whose notifications go to `events`.
    pub fn client(&self, events: EventSender) -> MemoryRelay {
        let mut state = lock(&self.state);
        state.next_client += 1;
        let id = state.next_client;
        state.clients.insert(id, events);
        MemoryRelay {
            hub: self.clone(),
            id,
        }
    }

    pub fn room_count(&self) -> usize {
        lock(&self.state).rooms.len()
    }
}

/// One client of a [`MemoryRelayHub`]. Dropping it counts as a disconnect.
pub struct MemoryRelay {
    hub: MemoryRelayHub,
    id: u64,
}

impl MemoryRelay {
    /// Leave every room, telling the other side.
    pub fn disconnect(&self) {
        let mut state = lock(&self.hub.state);
        if state.clients.remove(&self.id).is_none() {
            return;
        }

        let mut closed = Vec::new();
        let mut notify = Vec::new();
        for (code, room) in state.rooms.iter_mut() {
            if room.host == self.id {
                closed.push(code.clone());
                if let Some(joiner) = room.joiner {
                    notify.push(joiner);
                }
            } else if room.joiner == Some(self.id) {
                room.joiner = None;
                notify.push(room.host);
            }
        }
        for code in closed {
            state.rooms.remove(&code);
        }
        for client in notify {
            state.deliver(client, RelayEvent::PeerLeft);
        }
    }
}

impl Drop for MemoryRelay {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[async_trait]
impl SignalingRelay for MemoryRelay {
    async fn create_room(&mut self) -> Result<()> {
        let mut state = lock(&self.hub.state);
        let code = state.fresh_code();
        state.rooms.insert(
            code.clone(),
            Room {
                host: self.id,
                joiner: None,
            },
        );
        debug!(event = "relay_room_created", room = %code);
        state.deliver(self.id, RelayEvent::RoomCreated(code));
        Ok(())
    }

    async fn join_room(&mut self, code: &str) -> Result<()> {
        let mut state = lock(&self.hub.state);
        let reply = match state.rooms.get_mut(code) {
            None => Err(RelayEvent::RoomNotFound),
            Some(room) if room.joiner.is_some() => Err(RelayEvent::RoomFull),
            Some(room) => {
                room.joiner = Some(self.id);
                Ok(room.host)
            }
        };
        match reply {
            Ok(host) => state.deliver(host, RelayEvent::PeerJoined),
            Err(event) => state.deliver(self.id, event),
        }
        Ok(())
    }

    async fn signal(&mut self, room: &str, payload: SignalPayload) -> Result<()> {
        let state = lock(&self.hub.state);
        let Some(entry) = state.rooms.get(room) else {
            debug!(event = "relay_signal_dropped", room = %room, "No such room");
            return Ok(());
        };
        let target = if entry.host == self.id {
            entry.joiner
        } else if entry.joiner == Some(self.id) {
            Some(entry.host)
        } else {
            None
        };
        if let Some(target) = target {
            state.deliver(target, RelayEvent::Signal(payload));
        }
        Ok(())
    }

    async fn cancel_session(&mut self, room: &str) -> Result<()> {
        let mut state = lock(&self.hub.state);
        let Some(entry) = state.rooms.remove(room) else {
            return Ok(());
        };
        let other = if entry.host == self.id {
            entry.joiner
        } else {
            Some(entry.host)
        };
        if let Some(other) = other {
            state.deliver(other, RelayEvent::SessionCancelled);
        }
        Ok(())
    }
}

// ── Links ────────────────────────────────────────────────────────────────────

const OFFER_PREFIX: &str = "memory-offer:";
const ANSWER_PREFIX: &str = "memory-answer:";

enum Frame {
    Text(String),
    Binary(Bytes),
}

impl Frame {
    fn len(&self) -> usize {
        match self {
            Frame::Text(t) => t.len(),
            Frame::Binary(b) => b.len(),
        }
    }
}

#[derive(Default)]
struct LinkState {
    open: bool,
    closed: bool,
    peer: Option<Weak<LinkShared>>,
    outbox: VecDeque<Frame>,
    buffered: usize,
    peak: usize,
}

struct LinkShared {
    id: u64,
    role: Role,
    events: LinkEvents,
    low_threshold: usize,
    retain: bool,
    state: Mutex<LinkState>,
}

impl LinkShared {
    fn peer(&self) -> Option<Arc<LinkShared>> {
        lock(&self.state).peer.as_ref().and_then(Weak::upgrade)
    }

    fn open(&self) {
        lock(&self.state).open = true;
        self.events.emit(LinkEvent::Connected);
        self.events.emit(LinkEvent::ChannelOpen);
    }

    /// Deliver up to `max_frames` buffered frames to the peer.
    fn flush(&self, max_frames: usize) -> usize {
        let (frames, crossed_low) = {
            let mut state = lock(&self.state);
            let before = state.buffered;
            let take = max_frames.min(state.outbox.len());
            let frames: Vec<Frame> = state.outbox.drain(..take).collect();
            let drained: usize = frames.iter().map(Frame::len).sum();
            state.buffered -= drained;
            let crossed = before > self.low_threshold && state.buffered <= self.low_threshold;
            (frames, crossed)
        };

        let count = frames.len();
        if let Some(peer) = self.peer() {
            for frame in frames {
                let event = match frame {
                    Frame::Text(t) => LinkEvent::Text(t),
                    Frame::Binary(b) => LinkEvent::Binary(b),
                };
                peer.events.emit(event);
            }
        }
        if crossed_low {
            self.events.emit(LinkEvent::BufferedAmountLow);
        }
        count
    }

    fn enqueue(&self, frame: Frame) -> Result<()> {
        {
            let mut state = lock(&self.state);
            if !state.open || state.closed {
                return Err(anyhow!("memory channel is not open"));
            }
            state.buffered += frame.len();
            state.peak = state.peak.max(state.buffered);
            state.outbox.push_back(frame);
        }
        if !self.retain {
            self.flush(usize::MAX);
        }
        Ok(())
    }
}

/// Shared registry that lets links find each other by offer id. Cloning
/// shares the registry.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<NetworkState>>,
}

#[derive(Default)]
struct NetworkState {
    next_id: u64,
    links: Vec<Arc<LinkShared>>,
}

impl NetworkState {
    fn prune(&mut self) {
        self.links.retain(|l| !lock(&l.state).closed);
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every link on this network that has not been closed, oldest first.
    pub fn links(&self) -> Vec<MemoryLink> {
        let mut net = lock(&self.inner);
        net.prune();
        net.links
            .iter()
            .map(|shared| MemoryLink {
                shared: shared.clone(),
                network: self.clone(),
            })
            .collect()
    }

    fn find(&self, id: u64) -> Option<MemoryLink> {
        lock(&self.inner)
            .links
            .iter()
            .find(|l| l.id == id)
            .map(|shared| MemoryLink {
                shared: shared.clone(),
                network: self.clone(),
            })
    }
}

/// Connector producing [`MemoryLink`]s on a shared [`MemoryNetwork`].
pub struct MemoryConnector {
    network: MemoryNetwork,
    retain: bool,
}

impl MemoryConnector {
    /// Links deliver every frame immediately.
    pub fn new(network: MemoryNetwork) -> Self {
        Self {
            network,
            retain: false,
        }
    }

    /// Links keep frames buffered until [`MemoryLink::flush`] is called.
    pub fn retaining(network: MemoryNetwork) -> Self {
        Self {
            network,
            retain: true,
        }
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    type Link = MemoryLink;

    async fn prepare(
        &mut self,
        role: Role,
        events: LinkEvents,
        config: &TransferConfig,
    ) -> Result<MemoryLink> {
        let mut net = lock(&self.network.inner);
        net.prune();
        net.next_id += 1;
        let link = MemoryLink {
            shared: Arc::new(LinkShared {
                id: net.next_id,
                role,
                events,
                low_threshold: config.low_water_mark(),
                retain: self.retain,
                state: Mutex::new(LinkState::default()),
            }),
            network: self.network.clone(),
        };
        net.links.push(link.shared.clone());
        debug!(event = "memory_link_prepared", id = link.shared.id, role = ?role);
        Ok(link)
    }
}

/// In-process peer link.
#[derive(Clone)]
pub struct MemoryLink {
    shared: Arc<LinkShared>,
    network: MemoryNetwork,
}

impl MemoryLink {
    pub fn role(&self) -> Role {
        self.shared.role
    }

    pub fn epoch(&self) -> u64 {
        self.shared.events.epoch()
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.shared.state).closed
    }

    /// Deliver every retained frame.
    pub fn flush(&self) -> usize {
        self.shared.flush(usize::MAX)
    }

    /// Deliver at most `frames` retained frames.
    pub fn flush_frames(&self, frames: usize) -> usize {
        self.shared.flush(frames)
    }

    /// Highest buffered amount ever observed.
    pub fn peak_buffered(&self) -> usize {
        lock(&self.shared.state).peak
    }

    fn parse_id(sdp: &str, prefix: &str) -> Result<u64> {
        sdp.strip_prefix(prefix)
            .and_then(|id| id.parse().ok())
            .ok_or_else(|| anyhow!("not a memory session description: {sdp}"))
    }
}

#[async_trait]
impl TransferChannel for MemoryLink {
    fn is_open(&self) -> bool {
        let state = lock(&self.shared.state);
        state.open && !state.closed
    }

    async fn send_text(&self, text: String) -> Result<()> {
        self.shared.enqueue(Frame::Text(text))
    }

    async fn send_binary(&self, data: Bytes) -> Result<()> {
        self.shared.enqueue(Frame::Binary(data))
    }

    async fn buffered_amount(&self) -> usize {
        lock(&self.shared.state).buffered
    }
}

#[async_trait]
impl PeerLink for MemoryLink {
    async fn create_offer(&self) -> Result<SignalPayload> {
        Ok(SignalPayload::Offer {
            sdp: format!("{OFFER_PREFIX}{}", self.shared.id),
        })
    }

    async fn apply_signal(&self, payload: SignalPayload) -> Result<Option<SignalPayload>> {
        match payload {
            SignalPayload::Offer { sdp } => {
                let host_id = Self::parse_id(&sdp, OFFER_PREFIX)?;
                let host = self
                    .network
                    .find(host_id)
                    .ok_or_else(|| anyhow!("offer refers to unknown link {host_id}"))?;
                if lock(&host.shared.state).closed {
                    return Err(anyhow!("offering link {host_id} is closed"));
                }
                lock(&host.shared.state).peer = Some(Arc::downgrade(&self.shared));
                lock(&self.shared.state).peer = Some(Arc::downgrade(&host.shared));
                Ok(Some(SignalPayload::Answer {
                    sdp: format!("{ANSWER_PREFIX}{}", self.shared.id),
                }))
            }
            SignalPayload::Answer { sdp } => {
                let joiner_id = Self::parse_id(&sdp, ANSWER_PREFIX)?;
                let peer = self
                    .shared
                    .peer()
                    .filter(|p| p.id == joiner_id)
                    .ok_or_else(|| anyhow!("answer from unexpected link {joiner_id}"))?;
                info!(event = "memory_link_open", host = self.shared.id, joiner = peer.id);
                self.shared.open();
                peer.open();
                Ok(None)
            }
            SignalPayload::Candidate(_) => Ok(None),
        }
    }

    async fn close(&self) {
        let peer = {
            let mut state = lock(&self.shared.state);
            if state.closed {
                return;
            }
            state.closed = true;
            state.open = false;
            state.outbox.clear();
            state.buffered = 0;
            state.peer.take().and_then(|p| p.upgrade())
        };
        if let Some(peer) = peer {
            let was_open = {
                let mut state = lock(&peer.state);
                let was_open = state.open;
                state.open = false;
                state.peer = None;
                was_open
            };
            if was_open {
                peer.events.emit(LinkEvent::ChannelClosed);
            } else {
                peer.events.emit(LinkEvent::Lost);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::session::events::{inbox, EventReceiver};

    fn drain_relay(rx: &mut EventReceiver) -> Vec<RelayEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let SessionEvent::Relay(e) = event {
                out.push(e);
            }
        }
        out
    }

    #[tokio::test]
    async fn room_lifecycle() {
        let hub = MemoryRelayHub::new();
        let (host_handle, mut host_rx) = inbox();
        let (join_handle, mut join_rx) = inbox();
        let (late_handle, mut late_rx) = inbox();
        let mut host = hub.client(host_handle.sender());
        let mut joiner = hub.client(join_handle.sender());
        let mut late = hub.client(late_handle.sender());

        host.create_room().await.unwrap();
        let code = match drain_relay(&mut host_rx).as_slice() {
            [RelayEvent::RoomCreated(code)] => code.clone(),
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(code.len(), 4);
        assert!(code.chars().all(|c| c.is_ascii_digit()));

        joiner.join_room(&code).await.unwrap();
        assert_eq!(drain_relay(&mut host_rx), vec![RelayEvent::PeerJoined]);

        late.join_room(&code).await.unwrap();
        assert_eq!(drain_relay(&mut late_rx), vec![RelayEvent::RoomFull]);

        let offer = SignalPayload::Offer { sdp: "x".into() };
        host.signal(&code, offer.clone()).await.unwrap();
        assert_eq!(drain_relay(&mut join_rx), vec![RelayEvent::Signal(offer)]);

        host.cancel_session(&code).await.unwrap();
        assert_eq!(drain_relay(&mut join_rx), vec![RelayEvent::SessionCancelled]);
        assert_eq!(hub.room_count(), 0);

        late.join_room(&code).await.unwrap();
        assert_eq!(drain_relay(&mut late_rx), vec![RelayEvent::RoomNotFound]);
    }

    #[tokio::test]
    async fn host_disconnect_tells_joiner() {
        let hub = MemoryRelayHub::new();
        let (host_handle, mut host_rx) = inbox();
        let (join_handle, mut join_rx) = inbox();
        let mut host = hub.client(host_handle.sender());
        let mut joiner = hub.client(join_handle.sender());

        host.create_room().await.unwrap();
        let code = match drain_relay(&mut host_rx).pop() {
            Some(RelayEvent::RoomCreated(code)) => code,
            other => panic!("unexpected {other:?}"),
        };
        joiner.join_room(&code).await.unwrap();
        drop(host);

        assert_eq!(drain_relay(&mut join_rx), vec![RelayEvent::PeerLeft]);
        assert_eq!(hub.room_count(), 0);
    }

    #[tokio::test]
    async fn links_pair_and_buffer() {
        let network = MemoryNetwork::new();
        let mut connector = MemoryConnector::retaining(network.clone());
        let (host_handle, mut host_rx) = inbox();
        let (join_handle, mut join_rx) = inbox();
        let config = TransferConfig {
            chunk_size: 4,
            high_water_mark: 8,
            ..TransferConfig::default()
        };

        let host = connector
            .prepare(Role::Host, LinkEvents::new(1, host_handle.sender()), &config)
            .await
            .unwrap();
        let joiner = connector
            .prepare(Role::Joiner, LinkEvents::new(1, join_handle.sender()), &config)
            .await
            .unwrap();
        assert!(host.send_text("early".into()).await.is_err());

        let offer = host.create_offer().await.unwrap();
        let answer = joiner.apply_signal(offer).await.unwrap().unwrap();
        assert!(host.apply_signal(answer).await.unwrap().is_none());
        assert!(host.is_open() && joiner.is_open());

        host.send_binary(Bytes::from_static(b"abcd")).await.unwrap();
        host.send_binary(Bytes::from_static(b"efgh")).await.unwrap();
        assert_eq!(host.buffered_amount().await, 8);
        assert_eq!(host.peak_buffered(), 8);

        host.flush_frames(1);
        assert_eq!(host.buffered_amount().await, 4);
        let mut saw_low = false;
        while let Ok(event) = host_rx.try_recv() {
            if let SessionEvent::Link { event: LinkEvent::BufferedAmountLow, .. } = event {
                saw_low = true;
            }
        }
        assert!(saw_low);

        let mut received = Vec::new();
        while let Ok(event) = join_rx.try_recv() {
            if let SessionEvent::Link { event: LinkEvent::Binary(b), .. } = event {
                received.push(b);
            }
        }
        assert_eq!(received, vec![Bytes::from_static(b"abcd")]);

        assert_eq!(network.links().len(), 2);
        host.close().await;
        assert!(host.is_closed());
        assert!(!joiner.is_open() && !joiner.is_closed());

        let remaining = network.links();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].role(), Role::Joiner);

        joiner.close().await;
        connector
            .prepare(Role::Host, LinkEvents::new(2, host_handle.sender()), &config)
            .await
            .unwrap();
        assert_eq!(network.links().len(), 1);
    }
}

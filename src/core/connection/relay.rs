//! WebSocket client for the signaling relay.
//!
//! Frames are JSON text messages of the form `{"event": "...", "data": ...}`.
//! A reader task turns inbound frames into [`RelayEvent`]s on the session
//! queue; outbound calls write straight to the socket sink.

use crate::core::config::RELAY_CONNECT_TIMEOUT;
use crate::core::connection::SignalingRelay;
use crate::core::protocol::SignalPayload;
use crate::core::session::events::{EventSender, RelayEvent, SessionEvent};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Client → relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientFrame {
    CreateRoom,
    JoinRoom(String),
    Signal { room: String, data: SignalPayload },
    CancelSession(String),
}

/// Relay → client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerFrame {
    RoomCreated(String),
    PeerJoined,
    PeerLeft,
    SessionCancelled,
    RoomFull,
    RoomNotFound,
    Signal(SignalPayload),
}

impl From<ServerFrame> for RelayEvent {
    fn from(frame: ServerFrame) -> Self {
        match frame {
            ServerFrame::RoomCreated(code) => RelayEvent::RoomCreated(code),
            ServerFrame::PeerJoined => RelayEvent::PeerJoined,
            ServerFrame::PeerLeft => RelayEvent::PeerLeft,
            ServerFrame::SessionCancelled => RelayEvent::SessionCancelled,
            ServerFrame::RoomFull => RelayEvent::RoomFull,
            ServerFrame::RoomNotFound => RelayEvent::RoomNotFound,
            ServerFrame::Signal(payload) => RelayEvent::Signal(payload),
        }
    }
}

/// Parse one inbound text frame. Unknown events yield `None`.
pub fn parse_frame(text: &str) -> Option<RelayEvent> {
    match serde_json::from_str::<ServerFrame>(text) {
        Ok(frame) => Some(frame.into()),
        Err(e) => {
            debug!(event = "relay_frame_ignored", error = %e, frame = %text, "Unrecognised relay frame");
            None
        }
    }
}

pub struct WsRelay {
    sink: SplitSink<Socket, Message>,
    reader: JoinHandle<()>,
}

impl WsRelay {
    /// Connect to `url` and start forwarding relay events to `events`.
    pub async fn connect(url: &str, events: EventSender) -> Result<Self> {
        let (socket, _response) = tokio::time::timeout(RELAY_CONNECT_TIMEOUT, tokio_tungstenite::connect_async(url))
            .await
            .map_err(|_| anyhow!("timed out connecting to relay {url}"))?
            .with_context(|| format!("cannot connect to relay {url}"))?;
        info!(event = "relay_connected", url = %url, "Connected to signaling relay");

        let (sink, stream) = socket.split();
        let reader = tokio::spawn(read_loop(stream, events));
        Ok(Self { sink, reader })
    }

    async fn send(&mut self, frame: ClientFrame) -> Result<()> {
        let text = serde_json::to_string(&frame).context("failed to encode relay frame")?;
        self.sink
            .send(Message::text(text))
            .await
            .context("relay send failed")
    }
}

impl Drop for WsRelay {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_loop(mut stream: SplitStream<Socket>, events: EventSender) {
    let reason = loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                if let Some(event) = parse_frame(text.as_str()) {
                    if events.send(SessionEvent::Relay(event)).is_err() {
                        return;
                    }
                }
            }
            Some(Ok(Message::Close(frame))) => {
                break frame
                    .map(|f| f.reason.as_str().to_string())
                    .unwrap_or_else(|| "closed by relay".to_string());
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => break e.to_string(),
            None => break "connection ended".to_string(),
        }
    };
    warn!(event = "relay_disconnected", reason = %reason, "Signaling relay connection lost");
    let _ = events.send(SessionEvent::Relay(RelayEvent::Disconnected(reason)));
}

#[async_trait]
impl SignalingRelay for WsRelay {
    async fn create_room(&mut self) -> Result<()> {
        self.send(ClientFrame::CreateRoom).await
    }

    async fn join_room(&mut self, code: &str) -> Result<()> {
        self.send(ClientFrame::JoinRoom(code.to_string())).await
    }

    async fn signal(&mut self, room: &str, payload: SignalPayload) -> Result<()> {
        self.send(ClientFrame::Signal {
            room: room.to_string(),
            data: payload,
        })
        .await
    }

    async fn cancel_session(&mut self, room: &str) -> Result<()> {
        self.send(ClientFrame::CancelSession(room.to_string())).await
    }
}

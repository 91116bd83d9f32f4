//! WebRTC peer links on the `webrtc` crate.
//!
//! One [`RTCPeerConnection`] per link carries exactly one ordered, reliable
//! data channel labelled `file-transfer`. The host creates it before the
//! offer; the joiner adopts it from `on_data_channel`. ICE candidates trickle
//! through the relay as `SignalPayload::Candidate`.
//!
//! Both sides raise the SCTP send limit to [`SCTP_MAX_MESSAGE_SIZE`] and
//! advertise it in their session description, so chunks larger than the
//! crate's 64 KB default go through.

mod handlers;

use crate::core::config::{
    TransferConfig, DATA_CHANNEL_LABEL, DEFAULT_STUN_SERVER, SCTP_MAX_MESSAGE_SIZE,
};
use crate::core::connection::{Connector, PeerLink, TransferChannel};
use crate::core::protocol::SignalPayload;
use crate::core::session::events::LinkEvents;
use crate::core::session::state::Role;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::{SctpMaxMessageSize, SettingEngine};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

type ChannelSlot = Arc<Mutex<Option<Arc<RTCDataChannel>>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn create_webrtc_api() -> Result<webrtc::api::API> {
    let mut me = MediaEngine::default();
    let reg = register_default_interceptors(Registry::new(), &mut me)?;

    let mut se = SettingEngine::default();
    se.set_sctp_max_message_size_can_send(SctpMaxMessageSize::Bounded(SCTP_MAX_MESSAGE_SIZE));

    Ok(APIBuilder::new()
        .with_setting_engine(se)
        .with_media_engine(me)
        .with_interceptor_registry(reg)
        .build())
}

/// Append `a=max-message-size` so the peer knows how large a message we
/// accept. A description that already carries the attribute is left alone.
fn with_max_message_size(mut sdp: String) -> String {
    if !sdp.contains("a=max-message-size:") {
        if !sdp.is_empty() && !sdp.ends_with("\r\n") {
            sdp.push_str("\r\n");
        }
        sdp.push_str(&format!("a=max-message-size:{SCTP_MAX_MESSAGE_SIZE}\r\n"));
    }
    sdp
}

/// Builds [`WebRtcLink`]s against a fixed list of ICE servers.
#[derive(Debug, Clone)]
pub struct WebRtcConnector {
    ice_servers: Vec<String>,
}

impl Default for WebRtcConnector {
    fn default() -> Self {
        Self::new(vec![DEFAULT_STUN_SERVER.to_string()])
    }
}

impl WebRtcConnector {
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self { ice_servers }
    }

    fn rtc_configuration(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: self
                .ice_servers
                .iter()
                .map(|url| RTCIceServer {
                    urls: vec![url.clone()],
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }
}

#[async_trait]
impl Connector for WebRtcConnector {
    type Link = WebRtcLink;

    async fn prepare(
        &mut self,
        role: Role,
        events: LinkEvents,
        config: &TransferConfig,
    ) -> Result<WebRtcLink> {
        let api = create_webrtc_api()?;
        let pc = Arc::new(
            api.new_peer_connection(self.rtc_configuration())
                .await
                .context("cannot create peer connection")?,
        );
        handlers::watch_peer_connection(&pc, events.clone());
        handlers::forward_candidates(&pc, events.clone());

        let slot: ChannelSlot = Arc::new(Mutex::new(None));
        let threshold = config.low_water_mark();

        match role {
            Role::Host => {
                let init = RTCDataChannelInit {
                    ordered: Some(true),
                    ..Default::default()
                };
                let dc = pc
                    .create_data_channel(DATA_CHANNEL_LABEL, Some(init))
                    .await
                    .context("cannot create data channel")?;
                handlers::attach_channel(&dc, events, threshold).await;
                *lock(&slot) = Some(dc);
            }
            Role::Joiner => {
                let adopt = slot.clone();
                pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                    let adopt = adopt.clone();
                    let events = events.clone();
                    Box::pin(async move {
                        if dc.label() != DATA_CHANNEL_LABEL {
                            warn!(event = "dc_unexpected", channel = %dc.label(), "Ignoring unknown data channel");
                            return;
                        }
                        *lock(&adopt) = Some(dc.clone());
                        handlers::attach_channel(&dc, events, threshold).await;
                    })
                }));
            }
        }

        debug!(event = "webrtc_link_prepared", role = ?role, "Peer connection ready");
        Ok(WebRtcLink { pc, channel: slot })
    }
}

pub struct WebRtcLink {
    pc: Arc<RTCPeerConnection>,
    channel: ChannelSlot,
}

impl WebRtcLink {
    fn channel(&self) -> Option<Arc<RTCDataChannel>> {
        lock(&self.channel).clone()
    }

    fn open_channel(&self) -> Result<Arc<RTCDataChannel>> {
        let dc = self
            .channel()
            .ok_or_else(|| anyhow!("data channel not established"))?;
        let state = dc.ready_state();
        if state != RTCDataChannelState::Open {
            return Err(anyhow!("data channel not open: {state:?}"));
        }
        Ok(dc)
    }
}

#[async_trait]
impl TransferChannel for WebRtcLink {
    fn is_open(&self) -> bool {
        self.channel()
            .is_some_and(|dc| dc.ready_state() == RTCDataChannelState::Open)
    }

    async fn send_text(&self, text: String) -> Result<()> {
        let dc = self.open_channel()?;
        dc.send_text(text).await?;
        Ok(())
    }

    async fn send_binary(&self, data: Bytes) -> Result<()> {
        let dc = self.open_channel()?;
        dc.send(&data).await?;
        Ok(())
    }

    async fn buffered_amount(&self) -> usize {
        match self.channel() {
            Some(dc) => dc.buffered_amount().await,
            None => 0,
        }
    }
}

#[async_trait]
impl PeerLink for WebRtcLink {
    async fn create_offer(&self) -> Result<SignalPayload> {
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer.clone()).await?;
        info!(event = "webrtc_offer_created", "Local offer set");
        Ok(SignalPayload::Offer {
            sdp: with_max_message_size(offer.sdp),
        })
    }

    async fn apply_signal(&self, payload: SignalPayload) -> Result<Option<SignalPayload>> {
        match payload {
            SignalPayload::Offer { sdp } => {
                let desc = RTCSessionDescription::offer(sdp)?;
                self.pc.set_remote_description(desc).await?;
                let answer = self.pc.create_answer(None).await?;
                self.pc.set_local_description(answer.clone()).await?;
                info!(event = "webrtc_answer_created", "Remote offer applied, answer set");
                Ok(Some(SignalPayload::Answer {
                    sdp: with_max_message_size(answer.sdp),
                }))
            }
            SignalPayload::Answer { sdp } => {
                let desc = RTCSessionDescription::answer(sdp)?;
                self.pc.set_remote_description(desc).await?;
                info!(event = "webrtc_answer_applied", "Remote answer applied");
                Ok(None)
            }
            SignalPayload::Candidate(c) => {
                self.pc
                    .add_ice_candidate(RTCIceCandidateInit {
                        candidate: c.candidate,
                        sdp_mid: c.sdp_mid,
                        sdp_mline_index: c.sdp_mline_index,
                        username_fragment: None,
                    })
                    .await?;
                Ok(None)
            }
        }
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            warn!(event = "webrtc_close_failed", error = %e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_message_size_is_advertised_once() {
        let sdp = "v=0\r\nm=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n".to_string();
        let patched = with_max_message_size(sdp);
        assert!(patched.ends_with(&format!("a=max-message-size:{SCTP_MAX_MESSAGE_SIZE}\r\n")));
        assert_eq!(with_max_message_size(patched.clone()), patched);

        let bare = with_max_message_size("v=0".to_string());
        assert_eq!(bare, format!("v=0\r\na=max-message-size:{SCTP_MAX_MESSAGE_SIZE}\r\n"));
    }

    #[test]
    fn api_builds_with_raised_message_limit() {
        assert!(create_webrtc_api().is_ok());
    }
}

//! Callback wiring: peer-connection and data-channel events become
//! [`LinkEvent`]s on the session queue.

use crate::core::protocol::{IceCandidate, SignalPayload};
use crate::core::session::events::{LinkEvent, LinkEvents};
use bytes::Bytes;
use std::sync::Arc;
use tracing::{error, info, warn};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::RTCPeerConnection;

pub(super) fn watch_peer_connection(pc: &Arc<RTCPeerConnection>, events: LinkEvents) {
    pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        let events = events.clone();
        Box::pin(async move {
            match s {
                RTCPeerConnectionState::Connected => {
                    info!(event = "webrtc_connected", "WebRTC connection established");
                    events.emit(LinkEvent::Connected);
                }
                RTCPeerConnectionState::Failed => {
                    error!(event = "webrtc_failed", "WebRTC connection failed");
                    events.emit(LinkEvent::Lost);
                }
                RTCPeerConnectionState::Disconnected => {
                    warn!(
                        event = "webrtc_disconnected",
                        "WebRTC transient disconnect (ICE may recover)"
                    );
                }
                RTCPeerConnectionState::Closed => {
                    info!(event = "webrtc_closed", "WebRTC connection closed");
                    events.emit(LinkEvent::Lost);
                }
                _ => {}
            }
        })
    }));
}

pub(super) fn forward_candidates(pc: &Arc<RTCPeerConnection>, events: LinkEvents) {
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let events = events.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else {
                return;
            };
            match candidate.to_json() {
                Ok(init) => {
                    events.emit(LinkEvent::LocalSignal(SignalPayload::Candidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                    })));
                }
                Err(e) => warn!(event = "ice_candidate_encode_failed", error = %e),
            }
        })
    }));
}

/// Attach open/close/error/message and low-buffer callbacks to `dc`.
pub(super) async fn attach_channel(dc: &Arc<RTCDataChannel>, events: LinkEvents, low_threshold: usize) {
    let label = dc.label().to_string();

    let on_open = events.clone();
    let open_label = label.clone();
    dc.on_open(Box::new(move || {
        Box::pin(async move {
            info!(event = "dc_open", channel = %open_label, "DataChannel open");
            on_open.emit(LinkEvent::ChannelOpen);
        })
    }));

    let on_close = events.clone();
    let close_label = label.clone();
    dc.on_close(Box::new(move || {
        let on_close = on_close.clone();
        let label = close_label.clone();
        Box::pin(async move {
            warn!(event = "dc_closed", channel = %label, "DataChannel closed by transport");
            on_close.emit(LinkEvent::ChannelClosed);
        })
    }));

    let on_error = events.clone();
    dc.on_error(Box::new(move |err| {
        let on_error = on_error.clone();
        let label = label.clone();
        Box::pin(async move {
            error!(event = "dc_error", channel = %label, %err, "DataChannel transport error");
            on_error.emit(LinkEvent::Error(err.to_string()));
        })
    }));

    let on_message = events.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let on_message = on_message.clone();
        Box::pin(async move {
            if msg.is_string {
                match String::from_utf8(msg.data.to_vec()) {
                    Ok(text) => {
                        on_message.emit(LinkEvent::Text(text));
                    }
                    Err(e) => warn!(event = "dc_text_invalid", error = %e, "Dropping non-UTF-8 text message"),
                }
            } else {
                on_message.emit(LinkEvent::Binary(Bytes::from(msg.data)));
            }
        })
    }));

    dc.set_buffered_amount_low_threshold(low_threshold).await;
    let on_low = events.clone();
    dc.on_buffered_amount_low(Box::new(move || {
        let on_low = on_low.clone();
        Box::pin(async move {
            on_low.emit(LinkEvent::BufferedAmountLow);
        })
    }))
    .await;

    // The channel may already be open by the time an adopted channel is wired.
    if dc.ready_state() == RTCDataChannelState::Open {
        events.emit(LinkEvent::ChannelOpen);
    }
}

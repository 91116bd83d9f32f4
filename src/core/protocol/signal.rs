//! Connection-negotiation payloads carried opaquely by the signaling relay.

use serde::{Deserialize, Serialize};

/// Payload of one relayed signal: an offer, an answer, or a connectivity
/// candidate. The relay forwards it verbatim to the other peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalPayload {
    /// SDP offer from the host.
    Offer { sdp: String },
    /// SDP answer from the joiner.
    Answer { sdp: String },
    /// Trickled ICE candidate.
    #[serde(rename = "ice")]
    Candidate(IceCandidate),
}

impl SignalPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            SignalPayload::Offer { .. } => "offer",
            SignalPayload::Answer { .. } => "answer",
            SignalPayload::Candidate(_) => "ice",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_uses_browser_field_names() {
        let payload = SignalPayload::Candidate(IceCandidate {
            candidate: "candidate:1 1 udp 1 10.0.0.1 5000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        });
        let json: serde_json::Value = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "ice");
        assert_eq!(json["sdpMid"], "0");
        assert_eq!(json["sdpMLineIndex"], 0);

        let back: SignalPayload = serde_json::from_value(json).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn offer_is_tagged() {
        let json = serde_json::to_string(&SignalPayload::Offer { sdp: "v=0".into() }).unwrap();
        assert_eq!(json, r#"{"type":"offer","sdp":"v=0"}"#);
    }
}

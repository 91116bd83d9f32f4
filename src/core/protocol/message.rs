//! Data-channel vocabulary.
//!
//! Text messages on the channel are JSON control envelopes:
//!
//! ```text
//! {"type": "begin-transfer", "payload": {"name": "a.txt", "size": 3, "mimeType": "text/plain"}}
//! {"type": "download-complete"}
//! ```
//!
//! Binary messages are raw chunk bytes with no framing at all; they belong to
//! whatever transfer the last `begin-transfer` opened.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Metadata announced for one file. Never carries content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMeta {
    pub name: String,
    pub size: u64,
    pub mime_type: String,
}

/// Control messages exchanged on the data channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum ControlMessage {
    /// Full catalog of files the sender currently offers.
    FileList(Vec<FileMeta>),
    /// Ask the peer to stream one file.
    RequestFile { name: String },
    /// Opens an inbound transfer; binary chunks follow.
    BeginTransfer(FileMeta),
    /// Closes the inbound transfer with the given name.
    EndTransfer { name: String },
    /// The requesting side has drained its download queue.
    DownloadComplete,
}

impl ControlMessage {
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).context("failed to encode control message")
    }

    pub fn decode(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("malformed control message")
    }

    /// Short name used in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::FileList(_) => "file-list",
            ControlMessage::RequestFile { .. } => "request-file",
            ControlMessage::BeginTransfer(_) => "begin-transfer",
            ControlMessage::EndTransfer { .. } => "end-transfer",
            ControlMessage::DownloadComplete => "download-complete",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_matches_wire_vocabulary() {
        let msg = ControlMessage::BeginTransfer(FileMeta {
            name: "a.txt".into(),
            size: 3,
            mime_type: "text/plain".into(),
        });
        let json: serde_json::Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(json["type"], "begin-transfer");
        assert_eq!(json["payload"]["mimeType"], "text/plain");
        assert_eq!(json["payload"]["size"], 3);

        let done = ControlMessage::DownloadComplete.encode().unwrap();
        assert_eq!(done, r#"{"type":"download-complete"}"#);

        let req = ControlMessage::RequestFile { name: "b".into() }.encode().unwrap();
        assert_eq!(req, r#"{"type":"request-file","payload":{"name":"b"}}"#);
    }

    #[test]
    fn decodes_peer_envelopes() {
        let list = ControlMessage::decode(
            r#"{"type":"file-list","payload":[{"name":"x","size":10,"mimeType":"image/png"}]}"#,
        )
        .unwrap();
        match list {
            ControlMessage::FileList(files) => {
                assert_eq!(files.len(), 1);
                assert_eq!(files[0].mime_type, "image/png");
            }
            other => panic!("unexpected {other:?}"),
        }

        let end = ControlMessage::decode(r#"{"type":"end-transfer","payload":{"name":"x"}}"#).unwrap();
        assert_eq!(end, ControlMessage::EndTransfer { name: "x".into() });
    }

    #[test]
    fn rejects_garbage() {
        assert!(ControlMessage::decode("not json").is_err());
        assert!(ControlMessage::decode(r#"{"type":"shutdown"}"#).is_err());
    }
}

//! Wire protocol for the control-plane push channel: framed JSON messages
//! over WebSocket text frames.
//!
//! Messages are parsed envelope-first (read `type`, then decode the full
//! message) so unknown types can be skipped without failing the connection.

use crate::model::ConfigDocument;
use serde::{Deserialize, Serialize};

pub const TYPE_CONFIG_SNAPSHOT: &str = "config_snapshot";
pub const TYPE_ACK: &str = "ack";
pub const TYPE_NACK: &str = "nack";

/// First-pass parse of any inbound frame.
#[derive(Debug, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub version: Option<String>,
}

/// Full config snapshot pushed by the control plane. The document fields sit
/// at the top level next to `type`.
#[derive(Debug, Deserialize)]
pub struct ConfigSnapshotMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub document: ConfigDocument,
}

#[derive(Debug, PartialEq, Serialize)]
pub struct AckMessage {
    #[serde(rename = "type")]
    kind: &'static str,
    pub version: String,
}

impl AckMessage {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            kind: TYPE_ACK,
            version: version.into(),
        }
    }
}

#[derive(Debug, PartialEq, Serialize)]
pub struct NackMessage {
    #[serde(rename = "type")]
    kind: &'static str,
    pub version: String,
    pub error: String,
}

impl NackMessage {
    pub fn new(version: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            kind: TYPE_NACK,
            version: version.into(),
            error: error.into(),
        }
    }
}

/// Data-plane reply to a pushed snapshot.
#[derive(Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Reply {
    Ack(AckMessage),
    Nack(NackMessage),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_reads_type_and_version() {
        let envelope: Envelope =
            serde_json::from_str(r#"{"type": "config_snapshot", "version": "3", "extra": 1}"#)
                .unwrap();
        assert_eq!(envelope.kind, TYPE_CONFIG_SNAPSHOT);
        assert_eq!(envelope.version.as_deref(), Some("3"));
    }

    #[test]
    fn snapshot_message_carries_document_fields() {
        let msg: ConfigSnapshotMessage = serde_json::from_str(
            r#"{
                "type": "config_snapshot",
                "version": "3",
                "routingTable": {"visa": "visa"},
                "placements": {
                    "visa": {"url": "http://u-visa"},
                    "tier3": {"url": "http://u-t3"}
                },
                "defaultPlacement": "tier3"
            }"#,
        )
        .unwrap();
        assert_eq!(msg.document.version, "3");
        assert_eq!(msg.document.routing_table["visa"], "visa");
    }

    #[test]
    fn ack_serializes_with_type_tag() {
        let json = serde_json::to_string(&AckMessage::new("3")).unwrap();
        assert_eq!(json, r#"{"type":"ack","version":"3"}"#);
    }

    #[test]
    fn nack_serializes_with_error() {
        let json = serde_json::to_string(&NackMessage::new("3", "bad url")).unwrap();
        assert_eq!(json, r#"{"type":"nack","version":"3","error":"bad url"}"#);
    }

    #[test]
    fn legacy_snapshot_message_parses() {
        let msg: ConfigSnapshotMessage = serde_json::from_str(
            r#"{
                "type": "config_snapshot",
                "version": "4",
                "routingTable": {},
                "cellEndpoints": {"tier3": "http://u-t3"},
                "defaultPlacement": "tier3"
            }"#,
        )
        .unwrap();
        assert!(msg.document.cell_endpoints.is_some());
    }
}

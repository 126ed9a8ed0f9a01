//! JSON wire protocol between editor clients and the hub.
//!
//! Every frame is a JSON object with a `type` field discriminating the
//! message. Inbound and outbound directions each get a closed tagged enum,
//! so dispatch is an exhaustive `match` with no runtime fallthrough arm.
//!
//! ```text
//! editor ── join-document ──► Session ── init-document ──► editor
//!        ── operation ─────►         ── ack ────────────► submitter
//!                                    ── operation ──────► other roster members
//! ```
//!
//! OT operation payloads are opaque to the hub: they pass through as
//! [`RawOperation`] and only the OT engine interprets them.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::client::ClientView;

/// Opaque OT operation payload (ot.js `TextOperation.toJSON` shape:
/// an array of retain/insert/delete components).
pub type RawOperation = Value;

/// Inbound frame decode failure taxonomy.
///
/// `Malformed` frames are logged and dropped with no reply; `UnknownType`
/// frames are answered with an `error` message naming the type.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("unknown message type: {0}")]
    UnknownType(String),
}

/// Messages sent by editor clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Token handshake, consumed by the gateway before any routing.
    Authenticate { token: String, client_id: String },
    /// Join (and lazily start) a document.
    JoinDocument { doc: String, client_id: String },
    /// Submit an edit against `revision`.
    Operation {
        doc: String,
        client_id: String,
        operation: RawOperation,
        revision: u64,
    },
    /// Cursor/selection movement.
    Selection {
        doc: String,
        client_id: String,
        selection: Value,
    },
    /// Leave the current document.
    LeaveDocument { client_id: String },
    /// Mutate presence fields.
    UpdateClient {
        client_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        color: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        location: Option<String>,
    },
    /// Ask for a snapshot of currently connected peers.
    GetClients,
}

const KNOWN_TYPES: &[&str] = &[
    "authenticate",
    "join-document",
    "operation",
    "selection",
    "leave-document",
    "update-client",
    "get-clients",
];

impl ClientMessage {
    /// Decode a raw text frame.
    ///
    /// Distinguishes an unrecognized `type` (which gets an `error` reply)
    /// from an unparsable frame (which is only logged).
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let msg_type = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::Malformed("missing `type` field".into()))?;
        if !KNOWN_TYPES.contains(&msg_type) {
            return Err(ProtocolError::UnknownType(msg_type.to_string()));
        }
        serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

/// Messages sent by the hub to editor clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Successful token handshake.
    Authenticated,
    /// Reply to a freshly registered connection.
    InitConnection { peer_count: usize },
    /// Full document snapshot: the insert-everything operation, the
    /// authoritative revision, and the roster's presence views.
    InitDocument {
        operation: RawOperation,
        revision: u64,
        doc: String,
        clients: Vec<ClientView>,
    },
    /// Presence: a client appeared (also used per-peer for snapshots).
    ClientJoined {
        client_id: String,
        name: String,
        color: String,
    },
    /// Presence: a client went away.
    ClientLeft { client_id: String },
    /// Presence: a client's mutable fields changed.
    ClientUpdated {
        client_id: String,
        name: String,
        color: String,
        location: String,
    },
    /// Acknowledges the submitter's own operation.
    Ack { doc: String },
    /// A transformed operation relayed to the rest of the roster.
    Operation {
        doc: String,
        client_id: String,
        operation: RawOperation,
        revision: u64,
    },
    /// A relayed cursor/selection update.
    Selection {
        doc: String,
        client_id: String,
        selection: Value,
    },
    /// Explicit failure reply (unknown document, unrecognized type).
    Error { error: String },
}

impl ServerMessage {
    /// Encode for the wire.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_join_document() {
        let msg =
            ClientMessage::parse(r#"{"type":"join-document","doc":"notes.txt","clientId":"alice"}"#)
                .unwrap();
        assert_eq!(
            msg,
            ClientMessage::JoinDocument {
                doc: "notes.txt".into(),
                client_id: "alice".into(),
            }
        );
    }

    #[test]
    fn test_parse_operation_carries_opaque_payload() {
        let msg = ClientMessage::parse(
            r#"{"type":"operation","doc":"a","clientId":"c","operation":[3,"hi",-1],"revision":7}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::Operation {
                operation, revision, ..
            } => {
                assert_eq!(operation, json!([3, "hi", -1]));
                assert_eq!(revision, 7);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_parse_update_client_optional_fields() {
        let msg = ClientMessage::parse(r#"{"type":"update-client","clientId":"c","name":"Ann"}"#)
            .unwrap();
        assert_eq!(
            msg,
            ClientMessage::UpdateClient {
                client_id: "c".into(),
                name: Some("Ann".into()),
                color: None,
                location: None,
            }
        );
    }

    #[test]
    fn test_parse_unknown_type() {
        let err = ClientMessage::parse(r#"{"type":"frobnicate"}"#).unwrap_err();
        match err {
            ProtocolError::UnknownType(t) => assert_eq!(t, "frobnicate"),
            other => panic!("expected UnknownType, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_malformed_json() {
        assert!(matches!(
            ClientMessage::parse("{not json"),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_parse_known_type_missing_fields_is_malformed() {
        // Known type but required field absent: not an unknown-type reply.
        assert!(matches!(
            ClientMessage::parse(r#"{"type":"join-document","doc":"a"}"#),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_parse_missing_type_is_malformed() {
        assert!(matches!(
            ClientMessage::parse(r#"{"doc":"a"}"#),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_server_message_wire_shape() {
        let msg = ServerMessage::InitConnection { peer_count: 2 };
        let value: Value = serde_json::from_str(&msg.to_json()).unwrap();
        assert_eq!(value, json!({"type": "init-connection", "peerCount": 2}));
    }

    #[test]
    fn test_ack_wire_shape() {
        let msg = ServerMessage::Ack { doc: "notes.txt".into() };
        let value: Value = serde_json::from_str(&msg.to_json()).unwrap();
        assert_eq!(value, json!({"type": "ack", "doc": "notes.txt"}));
    }

    #[test]
    fn test_init_document_wire_shape() {
        let msg = ServerMessage::InitDocument {
            operation: json!(["hello"]),
            revision: 0,
            doc: "d".into(),
            clients: vec![],
        };
        let value: Value = serde_json::from_str(&msg.to_json()).unwrap();
        assert_eq!(value["type"], "init-document");
        assert_eq!(value["operation"], json!(["hello"]));
        assert_eq!(value["revision"], 0);
        assert_eq!(value["clients"], json!([]));
    }
}

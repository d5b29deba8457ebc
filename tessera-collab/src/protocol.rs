//! Wire protocol between models and stores.
//!
//! Every message is a JSON object with a `type` tag. Requests carry a
//! client-generated `id`; replies carry `ack_id` equal to it. Mutations
//! travel as [`Op`] values and are acknowledged by their op id once
//! persisted, or by an `error`-bearing ack on rejection.
//!
//! JSON (not a binary envelope) because op payloads are dynamic JSON values;
//! bandwidth is kept proportional to change size by the protocol itself:
//! subscribers receive op suffixes and query diffs, never snapshots.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use tessera_core::Op;

/// Per-document payload of a bulk `sync` request: the client's pending ops
/// plus, when the doc is observed, the version to re-subscribe at.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocSyncData {
    pub ops: Vec<Op>,
    pub version: Option<u64>,
}

/// Per-query payload of a bulk `sync` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuerySyncData {
    pub collection_name: String,
    pub expression: Value,
    pub doc_ids: Vec<String>,
}

/// Everything a reconnecting client needs the server to reconcile, keyed by
/// collection then doc id, plus subscribed queries keyed by hash.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncData {
    pub collections: HashMap<String, HashMap<String, DocSyncData>>,
    pub queries: HashMap<String, QuerySyncData>,
}

/// A document delivered inside a query diff: its full op log and version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocWithOps {
    pub ops: Vec<Op>,
    pub version: u64,
}

/// Protocol messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Client hello; the reply describes the server's shape.
    Handshake { id: String },
    HandshakeAck {
        ack_id: String,
        collection_names: Vec<String>,
        date: u64,
        projection_hashes: HashMap<String, String>,
        version: Option<String>,
    },

    /// Bulk reconnect: pending ops and re-subscriptions in one round trip.
    Sync { id: String, data: SyncData },
    SyncAck { ack_id: String },

    /// One-shot catch-up without a standing subscription.
    Fetch {
        id: String,
        collection_name: String,
        doc_id: String,
        version: u64,
    },

    Sub {
        id: String,
        collection_name: String,
        doc_id: String,
        version: u64,
    },
    /// Subscribe acknowledgment carrying the server's current version, so
    /// the client knows which pending ops still need replay.
    SubAck {
        ack_id: Option<String>,
        collection_name: String,
        doc_id: String,
        version: u64,
    },
    Unsub {
        collection_name: String,
        doc_id: String,
    },

    Qsub {
        id: String,
        collection_name: String,
        expression: Value,
        doc_ids: Vec<String>,
    },
    Qunsub {
        collection_name: String,
        hash: String,
    },
    Qfetch {
        id: String,
        collection_name: String,
        expression: Value,
        doc_ids: Vec<String>,
    },
    /// Incremental query result change: added docs (with their op logs) and
    /// removed ids, never the full result set after the first reply.
    QueryDiff {
        ack_id: Option<String>,
        collection_name: String,
        hash: String,
        added: HashMap<String, DocWithOps>,
        removed: Vec<String>,
        count: Option<u64>,
    },

    /// A mutation, client-to-server or server push to a subscriber.
    Op { op: Op },

    /// Generic reply; `error` marks a rejection of the correlated request.
    Ack {
        ack_id: String,
        collection_name: Option<String>,
        doc_id: Option<String>,
        error: Option<String>,
    },
}

impl Message {
    /// Serialize to the JSON wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from the JSON wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }

    /// The plain acknowledgment for a request id.
    pub fn ack(ack_id: impl Into<String>) -> Self {
        Message::Ack {
            ack_id: ack_id.into(),
            collection_name: None,
            doc_id: None,
            error: None,
        }
    }

    /// The request id an ack for this message would correlate by, if this
    /// message is a request.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Message::Handshake { id }
            | Message::Sync { id, .. }
            | Message::Fetch { id, .. }
            | Message::Sub { id, .. }
            | Message::Qsub { id, .. }
            | Message::Qfetch { id, .. } => Some(id.as_str()),
            Message::Op { op } => Some(op.id.as_str()),
            _ => None,
        }
    }

    /// The `(collection, doc)` a message addresses, where applicable.
    pub fn target(&self) -> (Option<&str>, Option<&str>) {
        match self {
            Message::Fetch {
                collection_name,
                doc_id,
                ..
            }
            | Message::Sub {
                collection_name,
                doc_id,
                ..
            }
            | Message::Unsub {
                collection_name,
                doc_id,
            } => (Some(collection_name.as_str()), Some(doc_id.as_str())),
            Message::Qsub {
                collection_name, ..
            }
            | Message::Qunsub {
                collection_name, ..
            }
            | Message::Qfetch {
                collection_name, ..
            } => (Some(collection_name.as_str()), None),
            Message::Op { op } => (Some(op.collection_name.as_str()), Some(op.doc_id.as_str())),
            _ => (None, None),
        }
    }

    /// An error-bearing acknowledgment; the correlated request was rejected.
    pub fn error_ack(
        ack_id: impl Into<String>,
        collection_name: Option<String>,
        doc_id: Option<String>,
        error: impl Into<String>,
    ) -> Self {
        Message::Ack {
            ack_id: ack_id.into(),
            collection_name,
            doc_id,
            error: Some(error.into()),
        }
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    Serialization(String),
    Deserialization(String),
    ConnectionClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serialization(e) => write!(f, "Serialization error: {e}"),
            Self::Deserialization(e) => write!(f, "Deserialization error: {e}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_op_message_roundtrip() {
        let op = Op::add("m1", 7, "users", "d1", json!({"name": "x"}));
        let msg = Message::Op { op: op.clone() };

        let encoded = msg.encode().unwrap();
        let decoded = Message::decode(&encoded).unwrap();

        match decoded {
            Message::Op { op: decoded_op } => assert_eq!(decoded_op, op),
            other => panic!("expected op message, got {other:?}"),
        }
    }

    #[test]
    fn test_message_type_tag() {
        let msg = Message::Handshake { id: "r1".into() };
        let value: Value = serde_json::from_slice(&msg.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "handshake");
        assert_eq!(value["id"], "r1");
    }

    #[test]
    fn test_sub_ack_roundtrip() {
        let msg = Message::SubAck {
            ack_id: Some("r2".into()),
            collection_name: "users".into(),
            doc_id: "d1".into(),
            version: 3,
        };
        let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
        match decoded {
            Message::SubAck { ack_id, version, .. } => {
                assert_eq!(ack_id.as_deref(), Some("r2"));
                assert_eq!(version, 3);
            }
            other => panic!("expected sub_ack, got {other:?}"),
        }
    }

    #[test]
    fn test_query_diff_roundtrip() {
        let op = Op::add("m1", 1, "users", "d1", json!({"name": "x"}));
        let mut added = HashMap::new();
        added.insert(
            "d1".to_string(),
            DocWithOps {
                ops: vec![op],
                version: 1,
            },
        );
        let msg = Message::QueryDiff {
            ack_id: None,
            collection_name: "users".into(),
            hash: "abc".into(),
            added,
            removed: vec!["d2".into()],
            count: None,
        };

        let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
        match decoded {
            Message::QueryDiff { added, removed, .. } => {
                assert_eq!(added.len(), 1);
                assert_eq!(added["d1"].version, 1);
                assert_eq!(removed, vec!["d2".to_string()]);
            }
            other => panic!("expected query_diff, got {other:?}"),
        }
    }

    #[test]
    fn test_error_ack() {
        let msg = Message::error_ack("op-1", Some("users".into()), Some("d1".into()), "denied");
        match Message::decode(&msg.encode().unwrap()).unwrap() {
            Message::Ack { ack_id, error, .. } => {
                assert_eq!(ack_id, "op-1");
                assert_eq!(error.as_deref(), Some("denied"));
            }
            other => panic!("expected ack, got {other:?}"),
        }
    }

    #[test]
    fn test_sync_data_roundtrip() {
        let mut collections = HashMap::new();
        let mut docs = HashMap::new();
        docs.insert(
            "d1".to_string(),
            DocSyncData {
                ops: vec![Op::set("m1", 2, "users", "d1", "name", json!("y"))],
                version: Some(4),
            },
        );
        collections.insert("users".to_string(), docs);

        let mut queries = HashMap::new();
        queries.insert(
            "h1".to_string(),
            QuerySyncData {
                collection_name: "users".into(),
                expression: json!({"name": "y"}),
                doc_ids: vec!["d1".into()],
            },
        );

        let msg = Message::Sync {
            id: "r3".into(),
            data: SyncData { collections, queries },
        };
        let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
        match decoded {
            Message::Sync { data, .. } => {
                assert_eq!(data.collections["users"]["d1"].version, Some(4));
                assert_eq!(data.queries["h1"].doc_ids, vec!["d1".to_string()]);
            }
            other => panic!("expected sync, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_invalid_bytes() {
        assert!(Message::decode(b"not json").is_err());
        assert!(Message::decode(b"{\"type\":\"nope\"}").is_err());
    }
}

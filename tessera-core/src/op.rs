//! Operations: the unit of change, transfer, and persistence.
//!
//! Every mutation to a document is captured as an immutable [`Op`]. Ops are
//! appended to a per-document log, replicated to subscribers, and persisted
//! verbatim; document state is always the left fold of its log.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// The mutation carried by an op.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OpKind {
    /// Create a document with the given payload.
    Add { value: Value },
    /// Write a value at a dot-delimited field path.
    Set { field: String, value: Value },
    /// Remove a field, or the whole document when `field` is `None`.
    Del { field: Option<String> },
}

/// One immutable mutation against a `(collection, doc)` pair.
///
/// `id` is globally unique (uuid v4, generated at creation); `source`
/// identifies the originating model or process; `date` is a logical
/// millisecond timestamp used for last-writer-wins ordering across sources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Op {
    pub id: String,
    pub source: String,
    pub date: u64,
    pub collection_name: String,
    pub doc_id: String,
    #[serde(flatten)]
    pub kind: OpKind,
}

impl Op {
    /// Generate a fresh globally-unique op id.
    pub fn new_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// Create an `add` op.
    pub fn add(
        source: impl Into<String>,
        date: u64,
        collection_name: impl Into<String>,
        doc_id: impl Into<String>,
        value: Value,
    ) -> Self {
        Self {
            id: Self::new_id(),
            source: source.into(),
            date,
            collection_name: collection_name.into(),
            doc_id: doc_id.into(),
            kind: OpKind::Add { value },
        }
    }

    /// Create a `set` op.
    pub fn set(
        source: impl Into<String>,
        date: u64,
        collection_name: impl Into<String>,
        doc_id: impl Into<String>,
        field: impl Into<String>,
        value: Value,
    ) -> Self {
        Self {
            id: Self::new_id(),
            source: source.into(),
            date,
            collection_name: collection_name.into(),
            doc_id: doc_id.into(),
            kind: OpKind::Set {
                field: field.into(),
                value,
            },
        }
    }

    /// Create a `del` op for one field, or the whole document.
    pub fn del(
        source: impl Into<String>,
        date: u64,
        collection_name: impl Into<String>,
        doc_id: impl Into<String>,
        field: Option<String>,
    ) -> Self {
        Self {
            id: Self::new_id(),
            source: source.into(),
            date,
            collection_name: collection_name.into(),
            doc_id: doc_id.into(),
            kind: OpKind::Del { field },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_op_ids_unique() {
        let a = Op::add("m1", 1, "users", "d1", json!({"name": "x"}));
        let b = Op::add("m1", 1, "users", "d1", json!({"name": "x"}));
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_op_json_roundtrip() {
        let op = Op::set("m1", 42, "users", "d1", "profile.name", json!("x"));
        let encoded = serde_json::to_string(&op).unwrap();
        let decoded: Op = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, op);
    }

    #[test]
    fn test_op_kind_tagging() {
        let op = Op::del("m1", 7, "users", "d1", None);
        let value = serde_json::to_value(&op).unwrap();
        assert_eq!(value["kind"], "del");
        assert_eq!(value["field"], Value::Null);

        let op = Op::add("m1", 7, "users", "d1", json!({"a": 1}));
        let value = serde_json::to_value(&op).unwrap();
        assert_eq!(value["kind"], "add");
        assert_eq!(value["value"]["a"], 1);
    }
}

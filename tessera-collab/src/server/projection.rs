//! Projections: named read-only views of a collection restricted to a field
//! subset.
//!
//! A projection's hash is exchanged at handshake so client and server agree
//! on the view's shape without transmitting a schema. Subscribing or
//! fetching through a projection serves field-filtered ops under the
//! projected name; mutations addressed to a projection are rejected.

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeSet;
use std::hash::{Hash, Hasher};

use serde_json::{Map, Value};

use tessera_core::{Op, OpKind};

/// A read-only field-subset view over a target collection.
#[derive(Debug, Clone)]
pub struct Projection {
    /// The name clients address.
    pub name: String,
    /// The underlying collection.
    pub collection_name: String,
    fields: BTreeSet<String>,
    hash: String,
}

impl Projection {
    pub fn new(
        name: impl Into<String>,
        collection_name: impl Into<String>,
        fields: impl IntoIterator<Item = String>,
    ) -> Self {
        let name = name.into();
        let collection_name = collection_name.into();
        let fields: BTreeSet<String> = fields.into_iter().collect();

        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        collection_name.hash(&mut hasher);
        for field in &fields {
            field.hash(&mut hasher);
        }
        let hash = format!("{:016x}", hasher.finish());

        Self {
            name,
            collection_name,
            fields,
            hash,
        }
    }

    /// Stable identity hash of this projection's shape.
    pub fn hash(&self) -> &str {
        &self.hash
    }

    fn includes(&self, field_path: &str) -> bool {
        let root = field_path.split('.').next().unwrap_or(field_path);
        self.fields.contains(root)
    }

    /// Restrict a document state to the projected fields (plus `_id`).
    pub fn project_state(&self, state: &Value) -> Value {
        let mut projected = Map::new();
        if let Some(object) = state.as_object() {
            for (key, value) in object {
                if key == "_id" || self.fields.contains(key) {
                    projected.insert(key.clone(), value.clone());
                }
            }
        }
        Value::Object(projected)
    }

    /// Rewrite an op into the projected view, or drop it when it only
    /// touches hidden fields.
    pub fn project_op(&self, op: &Op) -> Option<Op> {
        let kind = match &op.kind {
            OpKind::Add { value } => OpKind::Add {
                value: self.project_state(value),
            },
            OpKind::Set { field, value } => {
                if !self.includes(field) {
                    return None;
                }
                OpKind::Set {
                    field: field.clone(),
                    value: value.clone(),
                }
            }
            OpKind::Del { field: Some(field) } => {
                if !self.includes(field) {
                    return None;
                }
                OpKind::Del {
                    field: Some(field.clone()),
                }
            }
            OpKind::Del { field: None } => OpKind::Del { field: None },
        };
        Some(Op {
            id: op.id.clone(),
            source: op.source.clone(),
            date: op.date,
            collection_name: self.name.clone(),
            doc_id: op.doc_id.clone(),
            kind,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn projection() -> Projection {
        Projection::new("user_names", "users", vec!["name".to_string()])
    }

    #[test]
    fn test_hash_stable_and_shape_sensitive() {
        let a = projection();
        let b = Projection::new("user_names", "users", vec!["name".to_string()]);
        assert_eq!(a.hash(), b.hash());

        let c = Projection::new("user_names", "users", vec!["email".to_string()]);
        assert_ne!(a.hash(), c.hash());
    }

    #[test]
    fn test_project_state() {
        let state = json!({"_id": "d1", "name": "x", "password": "secret"});
        assert_eq!(
            projection().project_state(&state),
            json!({"_id": "d1", "name": "x"})
        );
    }

    #[test]
    fn test_project_add_filters_value() {
        let op = Op::add("m1", 1, "users", "d1", json!({"name": "x", "password": "s"}));
        let projected = projection().project_op(&op).unwrap();
        assert_eq!(projected.collection_name, "user_names");
        match projected.kind {
            OpKind::Add { value } => assert_eq!(value, json!({"name": "x"})),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_project_set_drops_hidden_field() {
        let visible = Op::set("m1", 1, "users", "d1", "name", json!("y"));
        let hidden = Op::set("m1", 1, "users", "d1", "password.hash", json!("z"));

        assert!(projection().project_op(&visible).is_some());
        assert!(projection().project_op(&hidden).is_none());
    }

    #[test]
    fn test_project_del_doc_kept() {
        let op = Op::del("m1", 1, "users", "d1", None);
        let projected = projection().project_op(&op).unwrap();
        assert!(matches!(projected.kind, OpKind::Del { field: None }));
        assert_eq!(projected.id, op.id);
    }
}

//! Client-side collection: a registry of document replicas.
//!
//! Owns its docs: attach and unattach go through the collection so lookups
//! never observe a dangling entry. Collections whose name starts with `_` or
//! `$` are local-only and never talk to a server.

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::broadcast;

use tessera_core::{path, Op};

use crate::storage::DocRecord;

use super::remote_doc::RemoteDoc;

/// Buffered collection change events per subscriber.
const CHANGE_CAPACITY: usize = 64;

pub struct Collection {
    pub name: String,
    /// Local collections never synchronize with the server.
    pub local: bool,
    docs: HashMap<String, RemoteDoc>,
    changes: broadcast::Sender<Op>,
}

impl Collection {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            local: path::is_local_collection(&name),
            name,
            docs: HashMap::new(),
            changes,
        }
    }

    pub fn get_doc(&self, doc_id: &str) -> Option<&RemoteDoc> {
        self.docs.get(doc_id)
    }

    pub fn get_doc_mut(&mut self, doc_id: &str) -> Option<&mut RemoteDoc> {
        self.docs.get_mut(doc_id)
    }

    pub fn get_or_attach(&mut self, doc_id: &str) -> &mut RemoteDoc {
        let name = self.name.clone();
        self.docs
            .entry(doc_id.to_string())
            .or_insert_with(|| RemoteDoc::new(name, doc_id))
    }

    /// Attach a replica restored from the local store.
    pub fn attach_record(&mut self, record: DocRecord) -> &mut RemoteDoc {
        let doc = RemoteDoc::from_record(self.name.clone(), record);
        let doc_id = doc.doc_id().to_string();
        self.docs.insert(doc_id.clone(), doc);
        self.docs.get_mut(&doc_id).unwrap()
    }

    pub fn unattach(&mut self, doc_id: &str) {
        self.docs.remove(doc_id);
    }

    /// Materialized states of every present document.
    pub fn states(&self) -> Vec<Value> {
        self.docs
            .values()
            .filter_map(|doc| doc.state().cloned())
            .collect()
    }

    pub fn docs(&self) -> impl Iterator<Item = &RemoteDoc> {
        self.docs.values()
    }

    pub fn changes(&self) -> broadcast::Receiver<Op> {
        self.changes.subscribe()
    }

    pub fn emit_change(&self, op: &Op) {
        let _ = self.changes.send(op.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_attach_and_lookup() {
        let mut collection = Collection::new("users");
        assert!(collection.get_doc("d1").is_none());

        let doc = collection.get_or_attach("d1");
        doc.apply_local_op(&Op::add("m1", 1, "users", "d1", json!({"name": "x"})));

        assert_eq!(
            collection.get_doc("d1").unwrap().get("name"),
            Some(&json!("x"))
        );
        assert_eq!(collection.states().len(), 1);

        collection.unattach("d1");
        assert!(collection.get_doc("d1").is_none());
    }

    #[test]
    fn test_local_naming() {
        assert!(Collection::new("_page").local);
        assert!(Collection::new("$session").local);
        assert!(!Collection::new("users").local);
    }

    #[tokio::test]
    async fn test_change_feed() {
        let collection = Collection::new("users");
        let mut changes = collection.changes();

        let op = Op::add("m1", 1, "users", "d1", json!({}));
        collection.emit_change(&op);

        assert_eq!(changes.recv().await.unwrap().id, op.id);
    }
}

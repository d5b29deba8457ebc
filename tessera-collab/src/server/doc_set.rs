//! Registry of live server docs, keyed by `(collection, doc id)`.
//!
//! Create-if-absent is explicit (double-checked under the write lock) and so
//! is eviction: a doc leaves the set only when its channel set empties.
//! Eviction never loses data; a later access recreates the doc from storage.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use tessera_core::Op;

use crate::storage::{Storage, StorageError};

use super::server_doc::ServerDoc;

pub struct DocSet {
    storage: Arc<dyn Storage>,
    docs: RwLock<HashMap<(String, String), Arc<ServerDoc>>>,
}

impl DocSet {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            docs: RwLock::new(HashMap::new()),
        }
    }

    /// Get or create the doc and wait until it is loaded.
    ///
    /// A load failure leaves the entry in place but unloaded, so the next
    /// access re-attempts the load instead of operating on empty state.
    pub async fn get_or_create(
        &self,
        collection_name: &str,
        doc_id: &str,
    ) -> Result<Arc<ServerDoc>, StorageError> {
        let key = (collection_name.to_string(), doc_id.to_string());

        let doc = {
            let docs = self.docs.read().await;
            docs.get(&key).cloned()
        };
        let doc = match doc {
            Some(doc) => doc,
            None => {
                let mut docs = self.docs.write().await;
                docs.entry(key)
                    .or_insert_with(|| {
                        ServerDoc::new(collection_name, doc_id, self.storage.clone())
                    })
                    .clone()
            }
        };

        doc.ensure_loaded().await?;
        Ok(doc)
    }

    pub async fn get(&self, collection_name: &str, doc_id: &str) -> Option<Arc<ServerDoc>> {
        let docs = self.docs.read().await;
        docs.get(&(collection_name.to_string(), doc_id.to_string()))
            .cloned()
    }

    /// Explicitly evict a doc from the registry.
    pub async fn unattach(&self, collection_name: &str, doc_id: &str) {
        let mut docs = self.docs.write().await;
        docs.remove(&(collection_name.to_string(), doc_id.to_string()));
        log::debug!("unattached {collection_name}/{doc_id}");
    }

    /// Evict the doc when its channel set is empty.
    pub async fn maybe_unattach(&self, doc: &Arc<ServerDoc>) {
        if doc.channel_count().await == 0 {
            self.unattach(&doc.collection_name, &doc.doc_id).await;
        }
    }

    /// Route a replicated op to its doc, if attached.
    pub async fn on_op(&self, op: &Op) {
        if let Some(doc) = self.get(&op.collection_name, &op.doc_id).await {
            doc.on_replicated_op(op).await;
        }
    }

    /// Unregister a closing connection from every doc, evicting the ones
    /// that end up with no subscribers.
    pub async fn channel_close(&self, client_id: u64) {
        let docs: Vec<Arc<ServerDoc>> = {
            let docs = self.docs.read().await;
            docs.values().cloned().collect()
        };
        for doc in docs {
            if doc.remove_channel(client_id).await == 0 {
                self.unattach(&doc.collection_name, &doc.doc_id).await;
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.docs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.docs.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::handle::{ClientHandle, HookParams};
    use crate::storage::MemoryStorage;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn client(id: u64) -> (Arc<ClientHandle>, mpsc::Receiver<crate::protocol::Message>) {
        let (tx, rx) = mpsc::channel(64);
        (
            Arc::new(ClientHandle::new(id, tx, HookParams::default())),
            rx,
        )
    }

    #[tokio::test]
    async fn test_get_or_create_returns_same_instance() {
        let set = DocSet::new(Arc::new(MemoryStorage::new()));
        let a = set.get_or_create("users", "d1").await.unwrap();
        let b = set.get_or_create("users", "d1").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(set.len().await, 1);
    }

    #[tokio::test]
    async fn test_unattach_and_recreate_from_storage() {
        let storage = Arc::new(MemoryStorage::new());
        let set = DocSet::new(storage.clone());

        let doc = set.get_or_create("users", "d1").await.unwrap();
        doc.on_op(&Op::add("m1", 1, "users", "d1", json!({"n": 1})))
            .await
            .unwrap();

        set.unattach("users", "d1").await;
        assert!(set.is_empty().await);

        // Eviction lost nothing: the log is recreated from storage.
        let doc = set.get_or_create("users", "d1").await.unwrap();
        assert_eq!(doc.version().await, 1);
    }

    #[tokio::test]
    async fn test_channel_close_evicts_empty_docs() {
        let set = DocSet::new(Arc::new(MemoryStorage::new()));
        let doc = set.get_or_create("users", "d1").await.unwrap();

        let (a, _rx_a) = client(1);
        let (b, _rx_b) = client(2);
        doc.subscribe(a, None, 0, None).await;
        doc.subscribe(b, None, 0, None).await;

        set.channel_close(1).await;
        assert_eq!(set.len().await, 1);

        set.channel_close(2).await;
        assert!(set.is_empty().await);
    }

    #[tokio::test]
    async fn test_on_op_ignores_unattached() {
        let set = DocSet::new(Arc::new(MemoryStorage::new()));
        // No doc attached: replicated op for it is simply dropped here.
        set.on_op(&Op::add("m1", 1, "users", "ghost", json!({})))
            .await;
        assert!(set.is_empty().await);
    }
}

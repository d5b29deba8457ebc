//! Registry of live server queries, keyed by `(collection, expression hash)`.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::RwLock;

use tessera_core::{Expression, Op};

use crate::storage::{Storage, StorageError};

use super::query::ServerQuery;

pub struct QuerySet {
    storage: Arc<dyn Storage>,
    queries: RwLock<HashMap<(String, String), Arc<ServerQuery>>>,
}

impl QuerySet {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            queries: RwLock::new(HashMap::new()),
        }
    }

    /// Get or create the query and wait until its result set is loaded.
    pub async fn get_or_create(
        &self,
        collection_name: &str,
        expression: Value,
    ) -> Result<Arc<ServerQuery>, StorageError> {
        let expression = Expression::new(expression);
        let key = (collection_name.to_string(), expression.hash());

        let query = {
            let queries = self.queries.read().await;
            queries.get(&key).cloned()
        };
        let query = match query {
            Some(query) => query,
            None => {
                let mut queries = self.queries.write().await;
                queries
                    .entry(key)
                    .or_insert_with(|| {
                        ServerQuery::new(collection_name, expression, self.storage.clone())
                    })
                    .clone()
            }
        };

        query.ensure_loaded().await?;
        Ok(query)
    }

    pub async fn get(&self, collection_name: &str, hash: &str) -> Option<Arc<ServerQuery>> {
        let queries = self.queries.read().await;
        queries
            .get(&(collection_name.to_string(), hash.to_string()))
            .cloned()
    }

    pub async fn unattach(&self, collection_name: &str, hash: &str) {
        let mut queries = self.queries.write().await;
        queries.remove(&(collection_name.to_string(), hash.to_string()));
        log::debug!("unattached query {collection_name}#{hash}");
    }

    pub async fn maybe_unattach(&self, query: &Arc<ServerQuery>) {
        if query.channel_count().await == 0 {
            self.unattach(&query.collection_name, &query.hash).await;
        }
    }

    /// Re-evaluate every query of the op's collection.
    pub async fn on_op(&self, op: &Op) {
        let queries: Vec<Arc<ServerQuery>> = {
            let queries = self.queries.read().await;
            queries
                .values()
                .filter(|query| query.collection_name == op.collection_name)
                .cloned()
                .collect()
        };
        for query in queries {
            query.on_op(op).await;
        }
    }

    /// Unregister a closing connection from every query, evicting the ones
    /// with no subscribers left.
    pub async fn channel_close(&self, client_id: u64) {
        let queries: Vec<Arc<ServerQuery>> = {
            let queries = self.queries.read().await;
            queries.values().cloned().collect()
        };
        for query in queries {
            if query.remove_channel(client_id).await == 0 {
                self.unattach(&query.collection_name, &query.hash).await;
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.queries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.queries.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::handle::{ClientHandle, HookParams};
    use crate::storage::MemoryStorage;
    use serde_json::json;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_identity_by_expression_hash() {
        let set = QuerySet::new(Arc::new(MemoryStorage::new()));

        let a = set
            .get_or_create("users", json!({"name": "x", "age": 1}))
            .await
            .unwrap();
        // Key order does not matter: same logical expression, same query.
        let b = set
            .get_or_create("users", json!({"age": 1, "name": "x"}))
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let c = set.get_or_create("users", json!({"name": "y"})).await.unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(set.len().await, 2);
    }

    #[tokio::test]
    async fn test_channel_close_evicts() {
        let set = QuerySet::new(Arc::new(MemoryStorage::new()));
        let query = set.get_or_create("users", json!({"name": "x"})).await.unwrap();

        let (tx, _rx) = mpsc::channel(16);
        let client = Arc::new(ClientHandle::new(7, tx, HookParams::default()));
        query.subscribe(client, Vec::new(), None).await;
        assert_eq!(set.len().await, 1);

        set.channel_close(7).await;
        assert!(set.is_empty().await);
    }
}

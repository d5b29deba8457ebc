//! In-memory storage adapter.
//!
//! Used by tests, in-process demos, and as the client-side local store for
//! offline persistence. The version check behaves exactly like a durable
//! adapter's, so optimistic-concurrency paths are testable against it.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use tessera_core::{Expression, Op};

use super::{DocRecord, Storage, StorageError};

/// HashMap-backed storage: collection name to (doc id to record).
#[derive(Default)]
pub struct MemoryStorage {
    collections: RwLock<HashMap<String, HashMap<String, DocRecord>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of persisted documents across all collections.
    pub async fn doc_count(&self) -> usize {
        self.collections.read().await.values().map(HashMap::len).sum()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get_doc_by_id(
        &self,
        collection_name: &str,
        doc_id: &str,
    ) -> Result<Option<DocRecord>, StorageError> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection_name)
            .and_then(|docs| docs.get(doc_id))
            .cloned())
    }

    async fn get_all_docs(&self, collection_name: &str) -> Result<Vec<DocRecord>, StorageError> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection_name)
            .map(|docs| docs.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn get_docs_by_query(
        &self,
        collection_name: &str,
        expression: &Value,
    ) -> Result<Vec<DocRecord>, StorageError> {
        let expression = Expression::new(expression.clone());
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection_name)
            .map(|docs| {
                docs.values()
                    .filter(|record| {
                        record
                            .state
                            .as_ref()
                            .is_some_and(|state| expression.matches(state))
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn save_doc(
        &self,
        collection_name: &str,
        doc_id: &str,
        prev_version: Option<u64>,
        version: u64,
        state: Option<Value>,
        ops: Vec<Op>,
    ) -> Result<(), StorageError> {
        let mut collections = self.collections.write().await;
        let docs = collections.entry(collection_name.to_string()).or_default();

        let found = docs.get(doc_id).map(|record| record.version);
        if found != prev_version {
            return Err(StorageError::VersionConflict {
                collection_name: collection_name.to_string(),
                doc_id: doc_id.to_string(),
                expected: prev_version,
                found,
            });
        }

        docs.insert(
            doc_id.to_string(),
            DocRecord {
                id: doc_id.to_string(),
                version,
                state,
                ops,
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_save_and_get() {
        let storage = MemoryStorage::new();
        let ops = vec![Op::add("m1", 1, "users", "d1", json!({"name": "x"}))];

        storage
            .save_doc("users", "d1", None, 1, Some(json!({"_id": "d1", "name": "x"})), ops)
            .await
            .unwrap();

        let record = storage.get_doc_by_id("users", "d1").await.unwrap().unwrap();
        assert_eq!(record.version, 1);
        assert_eq!(record.ops.len(), 1);
        assert_eq!(record.state.unwrap()["name"], "x");

        assert!(storage.get_doc_by_id("users", "other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_version_conflict() {
        let storage = MemoryStorage::new();
        storage
            .save_doc("users", "d1", None, 3, Some(json!({"_id": "d1"})), vec![])
            .await
            .unwrap();

        // Concurrent writer advanced the doc to 4.
        storage
            .save_doc("users", "d1", Some(3), 4, Some(json!({"_id": "d1"})), vec![])
            .await
            .unwrap();

        // Stale token: expected 3, stored is 4.
        let err = storage
            .save_doc("users", "d1", Some(3), 4, Some(json!({"_id": "d1"})), vec![])
            .await
            .unwrap_err();
        assert!(err.is_version_conflict());

        // First-time save against an existing doc conflicts too.
        let err = storage
            .save_doc("users", "d1", None, 1, None, vec![])
            .await
            .unwrap_err();
        assert!(err.is_version_conflict());
    }

    #[tokio::test]
    async fn test_get_docs_by_query() {
        let storage = MemoryStorage::new();
        for (id, name) in [("d1", "x"), ("d2", "y"), ("d3", "x")] {
            storage
                .save_doc(
                    "users",
                    id,
                    None,
                    1,
                    Some(json!({"_id": id, "name": name})),
                    vec![],
                )
                .await
                .unwrap();
        }

        let docs = storage
            .get_docs_by_query("users", &json!({"name": "x"}))
            .await
            .unwrap();
        assert_eq!(docs.len(), 2);

        let all = storage.get_all_docs("users").await.unwrap();
        assert_eq!(all.len(), 3);
        assert!(storage.get_all_docs("empty").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_deleted_doc_state_not_matched() {
        let storage = MemoryStorage::new();
        storage
            .save_doc("users", "d1", None, 2, None, vec![])
            .await
            .unwrap();

        let docs = storage
            .get_docs_by_query("users", &json!({}))
            .await
            .unwrap();
        assert!(docs.is_empty());
    }
}

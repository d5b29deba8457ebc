//! Durable storage interface and adapters.
//!
//! The durable store is the single source of truth shared by every server
//! process. There is no distributed lock: `save_doc`'s `prev_version` check
//! is the only concurrency-control primitive, and a stale token fails with
//! [`StorageError::VersionConflict`] so the caller can reload and retry.
//!
//! ```text
//! ┌───────────┐  save_doc(prev_v, v, state, ops)  ┌─────────────┐
//! │ ServerDoc │ ────────────────────────────────► │  Storage    │
//! │ (process) │ ◄──────────────────────────────── │ (shared)    │
//! └───────────┘   VersionConflict on stale prev   └─────────────┘
//! ```

pub mod memory;
pub mod rocks;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use tessera_core::Op;

pub use memory::MemoryStorage;
pub use rocks::{RocksStorage, StorageConfig};

/// A persisted document: its full op log, the version cursor the log
/// reaches, and the materialized state at that version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocRecord {
    pub id: String,
    pub version: u64,
    pub state: Option<Value>,
    pub ops: Vec<Op>,
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StorageError {
    /// The stored version no longer matches the saver's `prev_version`:
    /// another process persisted concurrently. Recoverable by reloading.
    VersionConflict {
        collection_name: String,
        doc_id: String,
        expected: Option<u64>,
        found: Option<u64>,
    },
    Database(String),
    Serialization(String),
    Io(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::VersionConflict {
                collection_name,
                doc_id,
                expected,
                found,
            } => write!(
                f,
                "Version conflict on {collection_name}/{doc_id}: expected {expected:?}, found {found:?}"
            ),
            StorageError::Database(e) => write!(f, "Database error: {e}"),
            StorageError::Serialization(e) => write!(f, "Serialization error: {e}"),
            StorageError::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for StorageError {}

impl StorageError {
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, StorageError::VersionConflict { .. })
    }
}

/// The durable store interface every server process shares.
#[async_trait]
pub trait Storage: Send + Sync + 'static {
    /// Load one document, or `None` when it was never persisted.
    async fn get_doc_by_id(
        &self,
        collection_name: &str,
        doc_id: &str,
    ) -> Result<Option<DocRecord>, StorageError>;

    /// All persisted documents of a collection.
    async fn get_all_docs(&self, collection_name: &str) -> Result<Vec<DocRecord>, StorageError>;

    /// Documents of a collection whose state matches a query expression.
    async fn get_docs_by_query(
        &self,
        collection_name: &str,
        expression: &Value,
    ) -> Result<Vec<DocRecord>, StorageError>;

    /// Persist a document's full log and state.
    ///
    /// Fails with [`StorageError::VersionConflict`] when the stored version
    /// differs from `prev_version`; any other error is terminal for this
    /// save attempt.
    async fn save_doc(
        &self,
        collection_name: &str,
        doc_id: &str,
        prev_version: Option<u64>,
        version: u64,
        state: Option<Value>,
        ops: Vec<Op>,
    ) -> Result<(), StorageError>;
}

//! RocksDB-backed durable storage adapter.
//!
//! Column families:
//! - `records` — full document records (op log + state), LZ4 compressed
//! - `meta`    — per-document metadata (bincode: version, updated_at)
//!
//! Keys are `collection \0 doc_id`, so a collection scan is a prefix
//! iteration. The optimistic-concurrency check reads `meta` before writing;
//! an in-process write lock serializes check-and-set so two stores sharing
//! one adapter behave like two processes sharing one database.

use std::path::PathBuf;
use std::time::SystemTime;

use async_trait::async_trait;
use rocksdb::{
    ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode, Direction, IteratorMode, Options,
    SingleThreaded, WriteBatch,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use tessera_core::{Expression, Op};

use super::{DocRecord, Storage, StorageError};

const CF_RECORDS: &str = "records";
const CF_META: &str = "meta";
const COLUMN_FAMILIES: &[&str] = &[CF_RECORDS, CF_META];

/// Storage configuration.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("tessera_data"),
            write_buffer_size: 16 * 1024 * 1024,
            max_open_files: 256,
        }
    }
}

impl StorageConfig {
    /// Config for tests: small buffers, temp directory.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_buffer_size: 1024 * 1024,
            max_open_files: 64,
        }
    }
}

/// Per-document metadata kept beside the record payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RecordMeta {
    version: u64,
    updated_at: u64,
}

impl RecordMeta {
    fn new(version: u64) -> Self {
        let updated_at = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        Self {
            version,
            updated_at,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StorageError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StorageError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StorageError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        Ok(meta)
    }
}

/// RocksDB-backed document store.
pub struct RocksStorage {
    db: DBWithThreadMode<SingleThreaded>,
    write_lock: Mutex<()>,
}

impl RocksStorage {
    /// Open (or create) the database at the configured path.
    pub fn open(config: StorageConfig) -> Result<Self, StorageError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| {
                let mut cf_opts = Options::default();
                cf_opts.set_compression_type(DBCompressionType::Lz4);
                cf_opts.set_write_buffer_size(config.write_buffer_size);
                ColumnFamilyDescriptor::new(*name, cf_opts)
            })
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )
        .map_err(|e| StorageError::Database(e.to_string()))?;

        Ok(Self {
            db,
            write_lock: Mutex::new(()),
        })
    }

    fn record_key(collection_name: &str, doc_id: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(collection_name.len() + doc_id.len() + 1);
        key.extend_from_slice(collection_name.as_bytes());
        key.push(0);
        key.extend_from_slice(doc_id.as_bytes());
        key
    }

    fn collection_prefix(collection_name: &str) -> Vec<u8> {
        let mut prefix = collection_name.as_bytes().to_vec();
        prefix.push(0);
        prefix
    }

    fn encode_record(record: &DocRecord) -> Result<Vec<u8>, StorageError> {
        let raw = serde_json::to_vec(record).map_err(|e| StorageError::Serialization(e.to_string()))?;
        Ok(lz4_flex::compress_prepend_size(&raw))
    }

    fn decode_record(bytes: &[u8]) -> Result<DocRecord, StorageError> {
        let raw = lz4_flex::decompress_size_prepended(bytes)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        serde_json::from_slice(&raw).map_err(|e| StorageError::Serialization(e.to_string()))
    }

    fn stored_version(&self, key: &[u8]) -> Result<Option<u64>, StorageError> {
        let cf = self
            .db
            .cf_handle(CF_META)
            .ok_or_else(|| StorageError::Database("missing meta column family".into()))?;
        match self
            .db
            .get_cf(&cf, key)
            .map_err(|e| StorageError::Database(e.to_string()))?
        {
            Some(bytes) => Ok(Some(RecordMeta::decode(&bytes)?.version)),
            None => Ok(None),
        }
    }

    fn scan_collection(&self, collection_name: &str) -> Result<Vec<DocRecord>, StorageError> {
        let cf = self
            .db
            .cf_handle(CF_RECORDS)
            .ok_or_else(|| StorageError::Database("missing records column family".into()))?;

        let prefix = Self::collection_prefix(collection_name);
        let mut records = Vec::new();
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&prefix, Direction::Forward));
        for entry in iter {
            let (key, value) = entry.map_err(|e| StorageError::Database(e.to_string()))?;
            if !key.starts_with(&prefix) {
                break;
            }
            records.push(Self::decode_record(&value)?);
        }
        Ok(records)
    }
}

#[async_trait]
impl Storage for RocksStorage {
    async fn get_doc_by_id(
        &self,
        collection_name: &str,
        doc_id: &str,
    ) -> Result<Option<DocRecord>, StorageError> {
        let cf = self
            .db
            .cf_handle(CF_RECORDS)
            .ok_or_else(|| StorageError::Database("missing records column family".into()))?;
        let key = Self::record_key(collection_name, doc_id);
        match self
            .db
            .get_cf(&cf, &key)
            .map_err(|e| StorageError::Database(e.to_string()))?
        {
            Some(bytes) => Ok(Some(Self::decode_record(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn get_all_docs(&self, collection_name: &str) -> Result<Vec<DocRecord>, StorageError> {
        self.scan_collection(collection_name)
    }

    async fn get_docs_by_query(
        &self,
        collection_name: &str,
        expression: &Value,
    ) -> Result<Vec<DocRecord>, StorageError> {
        let expression = Expression::new(expression.clone());
        Ok(self
            .scan_collection(collection_name)?
            .into_iter()
            .filter(|record| {
                record
                    .state
                    .as_ref()
                    .is_some_and(|state| expression.matches(state))
            })
            .collect())
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
        let _guard = self.write_lock.lock().await;

        let key = Self::record_key(collection_name, doc_id);
        let found = self.stored_version(&key)?;
        if found != prev_version {
            return Err(StorageError::VersionConflict {
                collection_name: collection_name.to_string(),
                doc_id: doc_id.to_string(),
                expected: prev_version,
                found,
            });
        }

        let record = DocRecord {
            id: doc_id.to_string(),
            version,
            state,
            ops,
        };
        let records_cf = self
            .db
            .cf_handle(CF_RECORDS)
            .ok_or_else(|| StorageError::Database("missing records column family".into()))?;
        let meta_cf = self
            .db
            .cf_handle(CF_META)
            .ok_or_else(|| StorageError::Database("missing meta column family".into()))?;

        let mut batch = WriteBatch::default();
        batch.put_cf(&records_cf, &key, Self::encode_record(&record)?);
        batch.put_cf(&meta_cf, &key, RecordMeta::new(version).encode()?);
        self.db
            .write(batch)
            .map_err(|e| StorageError::Database(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn open_temp() -> (tempfile::TempDir, RocksStorage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = RocksStorage::open(StorageConfig::for_testing(dir.path().join("db"))).unwrap();
        (dir, storage)
    }

    #[tokio::test]
    async fn test_save_and_reload() {
        let (_dir, storage) = open_temp();
        let ops = vec![Op::add("m1", 1, "users", "d1", json!({"name": "x"}))];
        storage
            .save_doc("users", "d1", None, 1, Some(json!({"_id": "d1", "name": "x"})), ops)
            .await
            .unwrap();

        let record = storage.get_doc_by_id("users", "d1").await.unwrap().unwrap();
        assert_eq!(record.version, 1);
        assert_eq!(record.ops.len(), 1);
        assert_eq!(record.state.unwrap()["name"], "x");
    }

    #[tokio::test]
    async fn test_version_conflict() {
        let (_dir, storage) = open_temp();
        storage
            .save_doc("users", "d1", None, 1, Some(json!({"_id": "d1"})), vec![])
            .await
            .unwrap();

        let err = storage
            .save_doc("users", "d1", None, 1, Some(json!({"_id": "d1"})), vec![])
            .await
            .unwrap_err();
        assert!(err.is_version_conflict());

        storage
            .save_doc("users", "d1", Some(1), 2, Some(json!({"_id": "d1"})), vec![])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_collection_prefix_isolation() {
        let (_dir, storage) = open_temp();
        for (collection, id) in [("users", "d1"), ("users", "d2"), ("userships", "d3")] {
            storage
                .save_doc(collection, id, None, 1, Some(json!({"_id": id})), vec![])
                .await
                .unwrap();
        }

        let users = storage.get_all_docs("users").await.unwrap();
        assert_eq!(users.len(), 2);
        let other = storage.get_all_docs("userships").await.unwrap();
        assert_eq!(other.len(), 1);
    }

    #[tokio::test]
    async fn test_query_scan() {
        let (_dir, storage) = open_temp();
        for (id, age) in [("d1", 10), ("d2", 30)] {
            storage
                .save_doc("users", id, None, 1, Some(json!({"_id": id, "age": age})), vec![])
                .await
                .unwrap();
        }

        let docs = storage
            .get_docs_by_query("users", &json!({"age": {"$gt": 20}}))
            .await
            .unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].id, "d2");
    }

    #[tokio::test]
    async fn test_reopen_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        {
            let storage = RocksStorage::open(StorageConfig::for_testing(&path)).unwrap();
            storage
                .save_doc("users", "d1", None, 2, Some(json!({"_id": "d1"})), vec![])
                .await
                .unwrap();
        }

        let storage = RocksStorage::open(StorageConfig::for_testing(&path)).unwrap();
        let record = storage.get_doc_by_id("users", "d1").await.unwrap().unwrap();
        assert_eq!(record.version, 2);
    }
}

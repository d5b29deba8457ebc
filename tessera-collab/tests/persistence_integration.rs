//! Persistence and reconnection: RocksDB-backed stores, client-side offline
//! replicas, pending-op replay over `sync`, and optimistic-concurrency
//! conflicts between stores sharing one durable store.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::{sleep, timeout};

use tessera_collab::{
    Channel, CollectionOptions, MemoryStorage, Model, RocksStorage, Storage, StorageConfig, Store,
    StoreOptions,
};

fn store_options() -> StoreOptions {
    let mut options = StoreOptions::default();
    options
        .collections
        .insert("users".to_string(), CollectionOptions { client: true });
    options
}

#[tokio::test]
async fn test_rocksdb_store_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db");

    let storage = Arc::new(RocksStorage::open(StorageConfig::for_testing(&path)).unwrap());
    {
        let store = Store::new(storage.clone(), store_options());
        let model = store.create_model();
        model
            .add("users", json!({"_id": "d1", "name": "x"}))
            .await
            .unwrap();
        sleep(Duration::from_millis(100)).await;
    }
    // Wait for connection tasks to wind down, releasing the database lock.
    for _ in 0..100 {
        if Arc::strong_count(&storage) == 1 {
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }
    drop(storage);

    let storage = Arc::new(RocksStorage::open(StorageConfig::for_testing(&path)).unwrap());
    let record = storage.get_doc_by_id("users", "d1").await.unwrap().unwrap();
    assert_eq!(record.version, 1);

    // A fresh store process lazily reloads the doc for a new subscriber.
    let store = Store::new(storage, store_options());
    let model = store.create_model();
    model.subscribe_doc("users", "d1").await.unwrap();
    assert_eq!(model.get_field("users", "d1", "name").await, Some(json!("x")));
}

#[tokio::test]
async fn test_offline_ops_replay_through_sync() {
    let client_storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());

    // Offline session: the channel's peer is gone, so ops only persist
    // locally and stay pending.
    {
        let (channel, peer) = Channel::pipe();
        drop(peer);
        let model = Model::with_storage(channel, "m-offline", client_storage.clone());
        model
            .add("users", json!({"_id": "d1", "name": "x"}))
            .await
            .unwrap();
        model.set("users", "d1", "age", json!(30)).await.unwrap();
    }

    let record = client_storage.get_doc_by_id("users", "d1").await.unwrap().unwrap();
    assert_eq!(record.ops.len(), 2);
    assert_eq!(record.version, 0); // nothing acknowledged

    // Reconnect: a new model restores the replica and syncs.
    let server_storage = Arc::new(MemoryStorage::new());
    let store = Store::new(server_storage.clone(), store_options());
    let (model_end, store_end) = Channel::pipe();
    store.on_channel(store_end);
    let model = Model::with_storage(model_end, "m-online", client_storage.clone());

    model.fill_from_storage("users").await.unwrap();
    assert_eq!(model.get_field("users", "d1", "name").await, Some(json!("x")));

    model.sync().await.unwrap();
    sleep(Duration::from_millis(100)).await;

    let record = server_storage.get_doc_by_id("users", "d1").await.unwrap().unwrap();
    assert_eq!(record.version, 2);
    assert_eq!(record.state.as_ref().unwrap()["name"], "x");
    assert_eq!(record.state.as_ref().unwrap()["age"], 30);
}

#[tokio::test]
async fn test_sync_resubscribes_docs_and_queries() {
    let storage = Arc::new(MemoryStorage::new());
    let store = Store::new(storage.clone(), store_options());

    let model_a = store.create_model();
    let model_b = store.create_model();

    let mut doc_changes = model_a.subscribe_doc("users", "d1").await.unwrap();
    let query = model_a.query("users", json!({"name": "x"}));
    let mut query_changes = query.changes().await;
    query.subscribe().await.unwrap();

    // A bulk sync must leave both subscriptions live.
    model_a.sync().await.unwrap();

    model_b
        .add("users", json!({"_id": "d1", "name": "x"}))
        .await
        .unwrap();

    timeout(Duration::from_secs(2), doc_changes.recv())
        .await
        .expect("doc subscription lost after sync")
        .unwrap();
    timeout(Duration::from_secs(2), query_changes.recv())
        .await
        .expect("query subscription lost after sync")
        .unwrap();
    assert_eq!(query.get().await.len(), 1);
}

#[tokio::test]
async fn test_concurrent_stores_converge_through_conflict() {
    let storage = Arc::new(MemoryStorage::new());
    let store1 = Store::new(storage.clone(), store_options());
    let store2 = Store::new(storage.clone(), store_options());

    let model1 = store1.create_model();
    let model2 = store2.create_model();

    // Both processes hold the doc at version 1.
    model1
        .add("users", json!({"_id": "d1", "n": 0}))
        .await
        .unwrap();
    sleep(Duration::from_millis(100)).await;
    model2.subscribe_doc("users", "d1").await.unwrap();

    // Concurrent writers: one save wins, the other reloads and retries.
    model1.set("users", "d1", "a", json!(1)).await.unwrap();
    model2.set("users", "d1", "b", json!(2)).await.unwrap();

    let mut record = None;
    for _ in 0..100 {
        record = storage.get_doc_by_id("users", "d1").await.unwrap();
        if record.as_ref().map(|r| r.version) == Some(3) {
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }
    let record = record.expect("doc never persisted");
    assert_eq!(record.version, 3);
    assert_eq!(record.ops.len(), 3);
    let state = record.state.unwrap();
    assert_eq!(state["a"], 1);
    assert_eq!(state["b"], 2);
}

#[tokio::test]
async fn test_client_replica_restores_acknowledged_state() {
    let client_storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let server_storage = Arc::new(MemoryStorage::new());
    let store = Store::new(server_storage.clone(), store_options());

    {
        let (model_end, store_end) = Channel::pipe();
        store.on_channel(store_end);
        let model = Model::with_storage(model_end, "m1", client_storage.clone());
        model
            .add("users", json!({"_id": "d1", "name": "x"}))
            .await
            .unwrap();
        model.subscribe_doc("users", "d1").await.unwrap();
        sleep(Duration::from_millis(100)).await;
    }

    // A later session restores the replica without touching the network.
    let (channel, peer) = Channel::pipe();
    drop(peer);
    let model = Model::with_storage(channel, "m2", client_storage);
    model.fill_from_storage("users").await.unwrap();

    assert_eq!(model.get_field("users", "d1", "name").await, Some(json!("x")));
    let state = model.get("users", "d1").await.unwrap();
    assert_eq!(state["_id"], "d1");
}

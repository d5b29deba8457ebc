//! End-to-end sync over a real WebSocket server and clients.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::{sleep, timeout};

use tessera_collab::{ws, CollectionOptions, MemoryStorage, Model, Store, StoreOptions};

fn store_options() -> StoreOptions {
    let mut options = StoreOptions::default();
    options
        .collections
        .insert("users".to_string(), CollectionOptions { client: true });
    options
}

async fn start_store() -> (Arc<Store>, String) {
    let store = Store::new(Arc::new(MemoryStorage::new()), store_options());
    let addr = ws::listen(store.clone(), "127.0.0.1:0").await.unwrap();
    (store, format!("ws://{addr}"))
}

#[tokio::test]
async fn test_handshake_over_websocket() {
    let (_store, url) = start_store().await;

    let channel = ws::connect(&url).await.unwrap();
    let model = Model::new(channel);

    model.handshake().await.unwrap();
    assert_eq!(model.collection_names().await, vec!["users".to_string()]);
}

#[tokio::test]
async fn test_two_websocket_clients_sync() {
    let (_store, url) = start_store().await;

    let model_a = Model::new(ws::connect(&url).await.unwrap());
    let model_b = Model::new(ws::connect(&url).await.unwrap());

    let mut changes = model_a.subscribe_doc("users", "d1").await.unwrap();

    model_b
        .add("users", json!({"_id": "d1", "name": "x"}))
        .await
        .unwrap();

    timeout(Duration::from_secs(2), changes.recv())
        .await
        .expect("no change over websocket")
        .unwrap();
    assert_eq!(
        model_a.get_field("users", "d1", "name").await,
        Some(json!("x"))
    );
}

#[tokio::test]
async fn test_websocket_query_subscription() {
    let (_store, url) = start_store().await;

    let model_a = Model::new(ws::connect(&url).await.unwrap());
    let model_b = Model::new(ws::connect(&url).await.unwrap());

    let query = model_a.query("users", json!({"role": "admin"}));
    let mut changes = query.changes().await;
    query.subscribe().await.unwrap();

    model_b
        .add("users", json!({"name": "x", "role": "admin"}))
        .await
        .unwrap();
    model_b
        .add("users", json!({"name": "y", "role": "guest"}))
        .await
        .unwrap();

    timeout(Duration::from_secs(2), changes.recv())
        .await
        .expect("no query change over websocket")
        .unwrap();
    let result = query.get().await;
    assert_eq!(result.len(), 1);
    assert_eq!(result[0]["role"], "admin");
}

#[tokio::test]
async fn test_websocket_disconnect_evicts() {
    let (store, url) = start_store().await;

    let model = Model::new(ws::connect(&url).await.unwrap());
    model.subscribe_doc("users", "d1").await.unwrap();
    assert_eq!(store.doc_count().await, 1);

    drop(model);
    for _ in 0..100 {
        if store.doc_count().await == 0 && store.client_count() == 0 {
            return;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("disconnect did not evict subscriptions");
}

//! The client-side facade.
//!
//! A `Model` owns local replicas of server collections, mutates them
//! optimistically, and talks to a store over one channel. Mutations are
//! visible locally before any server ack; each op stays pending until the
//! server confirms it, and an error-bearing ack rolls back exactly that op.
//!
//! Collections named with a leading `_` or `$` are local-only. When the
//! model is built with a local store, replicas persist across restarts and
//! pending ops replay on the next subscribe or sync.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};

use tessera_core::{path, Expression, Op, QueryResult};
use uuid::Uuid;

use crate::channel::Channel;
use crate::protocol::{Message, QuerySyncData, SyncData};
use crate::storage::{DocRecord, Storage};
use crate::util::now_millis;

use super::collection::Collection;
use super::query::{ClientQuery, QueryState};

/// Model errors.
#[derive(Debug, Clone)]
pub enum ModelError {
    /// The channel to the store is gone.
    ChannelClosed,
    /// The server rejected the request.
    Rejected(String),
    /// The local store failed.
    Storage(String),
}

impl std::fmt::Display for ModelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelError::ChannelClosed => write!(f, "Channel closed"),
            ModelError::Rejected(reason) => write!(f, "Rejected: {reason}"),
            ModelError::Storage(reason) => write!(f, "Local storage error: {reason}"),
        }
    }
}

impl std::error::Error for ModelError {}

struct ModelState {
    collections: HashMap<String, Collection>,
    queries: HashMap<(String, String), QueryState>,
    ack_waiters: HashMap<String, oneshot::Sender<Result<(), String>>>,
    collection_names: Vec<String>,
    projection_hashes: HashMap<String, String>,
}

struct ModelInner {
    source: String,
    tx: mpsc::Sender<Message>,
    storage: Option<Arc<dyn Storage>>,
    state: Mutex<ModelState>,
}

/// A client replica set bound to one channel. Cheap to clone.
#[derive(Clone)]
pub struct Model {
    inner: Arc<ModelInner>,
}

impl Model {
    pub fn new(channel: Channel) -> Self {
        let source = format!("model-{}", &Uuid::new_v4().to_string()[..8]);
        Self::build(channel, source, None)
    }

    pub fn with_source(channel: Channel, source: impl Into<String>) -> Self {
        Self::build(channel, source.into(), None)
    }

    /// A model with a local store for offline persistence.
    pub fn with_storage(
        channel: Channel,
        source: impl Into<String>,
        storage: Arc<dyn Storage>,
    ) -> Self {
        Self::build(channel, source.into(), Some(storage))
    }

    fn build(mut channel: Channel, source: String, storage: Option<Arc<dyn Storage>>) -> Self {
        let receiver = channel.take_receiver();
        let inner = Arc::new(ModelInner {
            source,
            tx: channel.sender(),
            storage,
            state: Mutex::new(ModelState {
                collections: HashMap::new(),
                queries: HashMap::new(),
                ack_waiters: HashMap::new(),
                collection_names: Vec::new(),
                projection_hashes: HashMap::new(),
            }),
        });

        if let Some(receiver) = receiver {
            let weak = Arc::downgrade(&inner);
            tokio::spawn(Self::receive_loop(weak, receiver));
        } else {
            log::error!("model built on a channel without a receiver");
        }

        Self { inner }
    }

    pub fn source(&self) -> &str {
        &self.inner.source
    }

    /// A fresh globally-unique id.
    pub fn id(&self) -> String {
        Op::new_id()
    }

    /// The logical timestamp stamped on ops.
    pub fn date(&self) -> u64 {
        now_millis()
    }

    // ─── Mutations ────────────────────────────────────────────────────

    /// Add a document; uses `value._id` when present, otherwise generates
    /// one. Visible locally before any server ack.
    pub async fn add(&self, collection_name: &str, value: Value) -> Result<String, ModelError> {
        let doc_id = value
            .get("_id")
            .and_then(Value::as_str)
            .map(String::from)
            .unwrap_or_else(Op::new_id);
        let op = Op::add(
            &self.inner.source,
            now_millis(),
            collection_name,
            &doc_id,
            value,
        );
        self.mutate(op).await?;
        Ok(doc_id)
    }

    /// Write a field by dot path; returns the previous value.
    pub async fn set(
        &self,
        collection_name: &str,
        doc_id: &str,
        field: &str,
        value: Value,
    ) -> Result<Option<Value>, ModelError> {
        let op = Op::set(
            &self.inner.source,
            now_millis(),
            collection_name,
            doc_id,
            field,
            value,
        );
        self.mutate(op).await
    }

    /// Delete a whole document; returns its previous state.
    pub async fn del(
        &self,
        collection_name: &str,
        doc_id: &str,
    ) -> Result<Option<Value>, ModelError> {
        let op = Op::del(
            &self.inner.source,
            now_millis(),
            collection_name,
            doc_id,
            None,
        );
        self.mutate(op).await
    }

    /// Delete one field; returns its previous value.
    pub async fn del_field(
        &self,
        collection_name: &str,
        doc_id: &str,
        field: &str,
    ) -> Result<Option<Value>, ModelError> {
        let op = Op::del(
            &self.inner.source,
            now_millis(),
            collection_name,
            doc_id,
            Some(field.to_string()),
        );
        self.mutate(op).await
    }

    /// Apply an op optimistically and transmit it. A send failure leaves the
    /// op pending; it replays on the next subscribe or sync.
    async fn mutate(&self, op: Op) -> Result<Option<Value>, ModelError> {
        let local = path::is_local_collection(&op.collection_name);

        let prev = {
            let mut state = self.inner.state.lock().await;
            let state = &mut *state;
            let collection = state
                .collections
                .entry(op.collection_name.clone())
                .or_insert_with(|| Collection::new(&op.collection_name));
            let (prev, record) = {
                let doc = collection.get_or_attach(&op.doc_id);
                let prev = doc.apply_local_op(&op);
                doc.emit_change();
                (prev, doc.persist_record())
            };
            collection.emit_change(&op);
            Self::refresh_local_queries(
                &state.collections,
                &mut state.queries,
                &op.collection_name,
            );
            if let Some(storage) = &self.inner.storage {
                Self::persist(storage, &op.collection_name, record).await;
            }
            prev
        };

        if !local && self.inner.tx.send(Message::Op { op }).await.is_err() {
            log::debug!("channel closed; op stays pending for replay");
        }
        Ok(prev)
    }

    // ─── Reads ────────────────────────────────────────────────────────

    /// A document's current state.
    pub async fn get(&self, collection_name: &str, doc_id: &str) -> Option<Value> {
        let state = self.inner.state.lock().await;
        state
            .collections
            .get(collection_name)?
            .get_doc(doc_id)?
            .state()
            .cloned()
    }

    /// One field of a document, by dot path.
    pub async fn get_field(
        &self,
        collection_name: &str,
        doc_id: &str,
        field: &str,
    ) -> Option<Value> {
        let state = self.inner.state.lock().await;
        state
            .collections
            .get(collection_name)?
            .get_doc(doc_id)?
            .get(field)
            .cloned()
    }

    /// All present document states of a collection.
    pub async fn get_docs(&self, collection_name: &str) -> Vec<Value> {
        let state = self.inner.state.lock().await;
        state
            .collections
            .get(collection_name)
            .map(Collection::states)
            .unwrap_or_default()
    }

    // ─── Protocol requests ────────────────────────────────────────────

    /// Exchange shapes with the server.
    pub async fn handshake(&self) -> Result<(), ModelError> {
        let id = Op::new_id();
        self.request(id.clone(), Message::Handshake { id }).await
    }

    /// Collection names advertised by the last handshake.
    pub async fn collection_names(&self) -> Vec<String> {
        self.inner.state.lock().await.collection_names.clone()
    }

    /// Projection hashes advertised by the last handshake.
    pub async fn projection_hashes(&self) -> HashMap<String, String> {
        self.inner.state.lock().await.projection_hashes.clone()
    }

    /// Subscribe to a document; returns its change feed. Reference-counted:
    /// only the 0 to 1 transition talks to the server.
    pub async fn subscribe_doc(
        &self,
        collection_name: &str,
        doc_id: &str,
    ) -> Result<broadcast::Receiver<()>, ModelError> {
        let (first, version, changes, local) = {
            let mut state = self.inner.state.lock().await;
            let collection = state
                .collections
                .entry(collection_name.to_string())
                .or_insert_with(|| Collection::new(collection_name));
            let local = collection.local;
            let doc = collection.get_or_attach(doc_id);
            (doc.subscribe_ref(), doc.version(), doc.changes(), local)
        };

        if !local && first {
            let id = Op::new_id();
            self.request(
                id.clone(),
                Message::Sub {
                    id,
                    collection_name: collection_name.to_string(),
                    doc_id: doc_id.to_string(),
                    version,
                },
            )
            .await?;
        }
        Ok(changes)
    }

    /// Drop one subscription reference; only the 1 to 0 transition sends an
    /// unsub.
    pub async fn unsubscribe_doc(&self, collection_name: &str, doc_id: &str) {
        let (last, local) = {
            let mut state = self.inner.state.lock().await;
            let Some(collection) = state.collections.get_mut(collection_name) else {
                return;
            };
            let local = collection.local;
            let Some(doc) = collection.get_doc_mut(doc_id) else {
                return;
            };
            (doc.unsubscribe_ref(), local)
        };

        if !local && last {
            let _ = self
                .inner
                .tx
                .send(Message::Unsub {
                    collection_name: collection_name.to_string(),
                    doc_id: doc_id.to_string(),
                })
                .await;
        }
    }

    /// One-shot catch-up for a document without a standing subscription.
    pub async fn fetch_doc(&self, collection_name: &str, doc_id: &str) -> Result<(), ModelError> {
        let version = {
            let mut state = self.inner.state.lock().await;
            let collection = state
                .collections
                .entry(collection_name.to_string())
                .or_insert_with(|| Collection::new(collection_name));
            collection.get_or_attach(doc_id).version()
        };
        let id = Op::new_id();
        self.request(
            id.clone(),
            Message::Fetch {
                id,
                collection_name: collection_name.to_string(),
                doc_id: doc_id.to_string(),
                version,
            },
        )
        .await
    }

    /// A query handle over a collection.
    pub fn query(&self, collection_name: &str, expression: Value) -> ClientQuery {
        ClientQuery::new(self.clone(), collection_name, expression)
    }

    pub(crate) async fn subscribe_query(&self, query: &ClientQuery) -> Result<(), ModelError> {
        let (first, known_ids) = {
            let mut state = self.inner.state.lock().await;
            let state = &mut *state;
            let query_state = state
                .queries
                .entry((query.collection_name.clone(), query.hash.clone()))
                .or_insert_with(|| {
                    QueryState::new(
                        &query.collection_name,
                        Expression::new(query.expression.clone()),
                    )
                });
            let first = query_state.subscribe_ref();
            if query.local && first {
                let states = state
                    .collections
                    .get(&query.collection_name)
                    .map(Collection::states)
                    .unwrap_or_default();
                query_state.refresh_from(&states);
            }
            (first, query_state.ids())
        };

        if !query.local && first {
            let id = Op::new_id();
            self.request(
                id.clone(),
                Message::Qsub {
                    id,
                    collection_name: query.collection_name.clone(),
                    expression: query.expression.clone(),
                    doc_ids: known_ids,
                },
            )
            .await?;
        }
        Ok(())
    }

    pub(crate) async fn unsubscribe_query(&self, query: &ClientQuery) -> Result<(), ModelError> {
        let last = {
            let mut state = self.inner.state.lock().await;
            state
                .queries
                .get_mut(&(query.collection_name.clone(), query.hash.clone()))
                .map(QueryState::unsubscribe_ref)
                .unwrap_or(false)
        };

        if !query.local && last {
            let _ = self
                .inner
                .tx
                .send(Message::Qunsub {
                    collection_name: query.collection_name.clone(),
                    hash: query.hash.clone(),
                })
                .await;
        }
        Ok(())
    }

    pub(crate) async fn fetch_query(&self, query: &ClientQuery) -> Result<(), ModelError> {
        let known_ids = {
            let state = self.inner.state.lock().await;
            state
                .queries
                .get(&(query.collection_name.clone(), query.hash.clone()))
                .map(QueryState::ids)
                .unwrap_or_default()
        };
        let id = Op::new_id();
        self.request(
            id.clone(),
            Message::Qfetch {
                id,
                collection_name: query.collection_name.clone(),
                expression: query.expression.clone(),
                doc_ids: known_ids,
            },
        )
        .await
    }

    pub(crate) async fn query_states(&self, query: &ClientQuery) -> Vec<Value> {
        let state = self.inner.state.lock().await;
        let collection = state.collections.get(&query.collection_name);

        if query.local {
            // Local queries evaluate directly over the collection.
            let states = collection.map(Collection::states).unwrap_or_default();
            let expression = Expression::new(query.expression.clone());
            return expression.matching_states(states.iter()).into_iter().cloned().collect();
        }

        let Some(query_state) = state
            .queries
            .get(&(query.collection_name.clone(), query.hash.clone()))
        else {
            return Vec::new();
        };
        let Some(collection) = collection else {
            return Vec::new();
        };
        query_state
            .ids()
            .iter()
            .filter_map(|id| collection.get_doc(id).and_then(|doc| doc.state().cloned()))
            .collect()
    }

    pub(crate) async fn query_count(&self, query: &ClientQuery) -> Option<u64> {
        let state = self.inner.state.lock().await;
        match state
            .queries
            .get(&(query.collection_name.clone(), query.hash.clone()))?
            .result()
        {
            QueryResult::Count(count) => Some(*count),
            QueryResult::Ids(_) => None,
        }
    }

    pub(crate) async fn query_changes(&self, query: &ClientQuery) -> broadcast::Receiver<()> {
        let mut state = self.inner.state.lock().await;
        state
            .queries
            .entry((query.collection_name.clone(), query.hash.clone()))
            .or_insert_with(|| {
                QueryState::new(
                    &query.collection_name,
                    Expression::new(query.expression.clone()),
                )
            })
            .changes()
    }

    /// Bulk reconnect: submit pending ops and re-subscriptions in one round
    /// trip.
    pub async fn sync(&self) -> Result<(), ModelError> {
        let data = {
            let state = self.inner.state.lock().await;
            let mut data = SyncData::default();
            for (name, collection) in &state.collections {
                if collection.local {
                    continue;
                }
                let mut docs = HashMap::new();
                for doc in collection.docs() {
                    let doc_data = doc.sync_data();
                    if doc_data.ops.is_empty() && doc_data.version.is_none() {
                        continue;
                    }
                    docs.insert(doc.doc_id().to_string(), doc_data);
                }
                if !docs.is_empty() {
                    data.collections.insert(name.clone(), docs);
                }
            }
            for ((collection_name, hash), query_state) in &state.queries {
                if query_state.local || query_state.subscribed() == 0 {
                    continue;
                }
                data.queries.insert(
                    hash.clone(),
                    QuerySyncData {
                        collection_name: collection_name.clone(),
                        expression: query_state.expression.raw().clone(),
                        doc_ids: query_state.ids(),
                    },
                );
            }
            data
        };

        let id = Op::new_id();
        self.request(id.clone(), Message::Sync { id, data }).await
    }

    /// Restore a collection's replicas from the local store.
    pub async fn fill_from_storage(&self, collection_name: &str) -> Result<(), ModelError> {
        let Some(storage) = &self.inner.storage else {
            return Ok(());
        };
        let records = storage
            .get_all_docs(collection_name)
            .await
            .map_err(|err| ModelError::Storage(err.to_string()))?;

        let mut state = self.inner.state.lock().await;
        let collection = state
            .collections
            .entry(collection_name.to_string())
            .or_insert_with(|| Collection::new(collection_name));
        for record in records {
            collection.attach_record(record);
        }
        Ok(())
    }

    /// A collection's change feed.
    pub async fn collection_changes(&self, collection_name: &str) -> broadcast::Receiver<Op> {
        let mut state = self.inner.state.lock().await;
        state
            .collections
            .entry(collection_name.to_string())
            .or_insert_with(|| Collection::new(collection_name))
            .changes()
    }

    /// A document's change feed (without subscribing it on the server).
    pub async fn doc_changes(
        &self,
        collection_name: &str,
        doc_id: &str,
    ) -> broadcast::Receiver<()> {
        let mut state = self.inner.state.lock().await;
        state
            .collections
            .entry(collection_name.to_string())
            .or_insert_with(|| Collection::new(collection_name))
            .get_or_attach(doc_id)
            .changes()
    }

    // ─── Internals ────────────────────────────────────────────────────

    /// Register a waiter for `ack_id`, send the request, await the ack.
    async fn request(&self, ack_id: String, message: Message) -> Result<(), ModelError> {
        let receiver = {
            let mut state = self.inner.state.lock().await;
            let (tx, rx) = oneshot::channel();
            state.ack_waiters.insert(ack_id, tx);
            rx
        };
        self.inner
            .tx
            .send(message)
            .await
            .map_err(|_| ModelError::ChannelClosed)?;
        match receiver.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(reason)) => Err(ModelError::Rejected(reason)),
            Err(_) => Err(ModelError::ChannelClosed),
        }
    }

    fn refresh_local_queries(
        collections: &HashMap<String, Collection>,
        queries: &mut HashMap<(String, String), QueryState>,
        collection_name: &str,
    ) {
        let Some(collection) = collections.get(collection_name) else {
            return;
        };
        let states = collection.states();
        for ((name, _), query_state) in queries.iter_mut() {
            if name == collection_name && query_state.local && query_state.refresh_from(&states) {
                query_state.emit_change();
            }
        }
    }

    async fn persist(storage: &Arc<dyn Storage>, collection_name: &str, record: DocRecord) {
        let prev = match storage.get_doc_by_id(collection_name, &record.id).await {
            Ok(existing) => existing.map(|record| record.version),
            Err(err) => {
                log::error!("local read of {collection_name}/{} failed: {err}", record.id);
                return;
            }
        };
        if let Err(err) = storage
            .save_doc(
                collection_name,
                &record.id,
                prev,
                record.version,
                record.state.clone(),
                record.ops,
            )
            .await
        {
            log::error!("local persist of {collection_name}/{} failed: {err}", record.id);
        }
    }

    async fn receive_loop(weak: Weak<ModelInner>, mut receiver: mpsc::Receiver<Message>) {
        while let Some(message) = receiver.recv().await {
            let Some(inner) = weak.upgrade() else { break };
            Self::handle_message(&inner, message).await;
        }
        log::debug!("model channel closed");
    }

    async fn handle_message(inner: &Arc<ModelInner>, message: Message) {
        let mut outgoing: Vec<Message> = Vec::new();
        {
            let mut state = inner.state.lock().await;
            let state = &mut *state;
            match message {
                Message::Op { op } => {
                    let collection = state
                        .collections
                        .entry(op.collection_name.clone())
                        .or_insert_with(|| Collection::new(&op.collection_name));
                    let record = {
                        let doc = collection.get_or_attach(&op.doc_id);
                        if doc.receive_op(&op) {
                            doc.emit_change();
                        }
                        doc.persist_record()
                    };
                    collection.emit_change(&op);
                    Self::refresh_local_queries(
                        &state.collections,
                        &mut state.queries,
                        &op.collection_name,
                    );
                    if let Some(storage) = &inner.storage {
                        Self::persist(storage, &op.collection_name, record).await;
                    }
                }

                Message::SubAck {
                    ack_id,
                    collection_name,
                    doc_id,
                    version,
                } => {
                    if let Some(doc) = state
                        .collections
                        .get_mut(&collection_name)
                        .and_then(|collection| collection.get_doc_mut(&doc_id))
                    {
                        // Replay-on-reconnect: everything the server has not
                        // acknowledged goes back on the wire.
                        for op in doc.on_subscribed(version) {
                            outgoing.push(Message::Op { op });
                        }
                    }
                    if let Some(ack_id) = ack_id {
                        Self::resolve(state, &ack_id, Ok(()));
                    }
                }

                Message::QueryDiff {
                    ack_id,
                    collection_name,
                    hash,
                    added,
                    removed,
                    count,
                } => {
                    let collection = state
                        .collections
                        .entry(collection_name.clone())
                        .or_insert_with(|| Collection::new(&collection_name));

                    let mut added_ids: Vec<String> = added.keys().cloned().collect();
                    added_ids.sort();
                    let mut records = Vec::new();
                    for (doc_id, doc_with_ops) in &added {
                        let doc = collection.get_or_attach(doc_id);
                        doc.merge_server_ops(&doc_with_ops.ops, doc_with_ops.version);
                        doc.emit_change();
                        records.push(doc.persist_record());
                    }

                    if let Some(query_state) =
                        state.queries.get_mut(&(collection_name.clone(), hash))
                    {
                        if query_state.apply_diff(&added_ids, &removed, count) {
                            query_state.emit_change();
                        }
                    }

                    if let Some(storage) = &inner.storage {
                        for record in records {
                            Self::persist(storage, &collection_name, record).await;
                        }
                    }
                    if let Some(ack_id) = ack_id {
                        Self::resolve(state, &ack_id, Ok(()));
                    }
                }

                Message::Ack {
                    ack_id,
                    collection_name,
                    doc_id,
                    error,
                } => match error {
                    Some(reason) => {
                        log::warn!("request {ack_id} rejected: {reason}");
                        // Optimistic rollback: remove exactly the rejected
                        // op and recompute; unrelated pending ops survive.
                        if let (Some(collection_name), Some(doc_id)) = (collection_name, doc_id) {
                            if let Some(collection) = state.collections.get_mut(&collection_name) {
                                let (rejected, record) = {
                                    match collection.get_doc_mut(&doc_id) {
                                        Some(doc) => {
                                            let rejected = doc.reject_op(&ack_id);
                                            if rejected.is_some() {
                                                doc.emit_change();
                                            }
                                            (rejected, Some(doc.persist_record()))
                                        }
                                        None => (None, None),
                                    }
                                };
                                if let Some(op) = rejected {
                                    collection.emit_change(&op);
                                    Self::refresh_local_queries(
                                        &state.collections,
                                        &mut state.queries,
                                        &op.collection_name,
                                    );
                                    if let (Some(storage), Some(record)) =
                                        (&inner.storage, record)
                                    {
                                        Self::persist(storage, &op.collection_name, record).await;
                                    }
                                }
                            }
                        }
                        Self::resolve(state, &ack_id, Err(reason));
                    }
                    None => {
                        if let (Some(collection_name), Some(doc_id)) = (collection_name, doc_id) {
                            if let Some(doc) = state
                                .collections
                                .get_mut(&collection_name)
                                .and_then(|collection| collection.get_doc_mut(&doc_id))
                            {
                                doc.acknowledge(&ack_id);
                            }
                        }
                        Self::resolve(state, &ack_id, Ok(()));
                    }
                },

                Message::HandshakeAck {
                    ack_id,
                    collection_names,
                    projection_hashes,
                    ..
                } => {
                    state.collection_names = collection_names;
                    state.projection_hashes = projection_hashes;
                    Self::resolve(state, &ack_id, Ok(()));
                }

                Message::SyncAck { ack_id } => {
                    Self::resolve(state, &ack_id, Ok(()));
                }

                other => {
                    log::debug!("model: unhandled message {other:?}");
                }
            }
        }

        for message in outgoing {
            if inner.tx.send(message).await.is_err() {
                break;
            }
        }
    }

    fn resolve(state: &mut ModelState, ack_id: &str, result: Result<(), String>) {
        if let Some(waiter) = state.ack_waiters.remove(ack_id) {
            let _ = waiter.send(result);
        }
    }
}

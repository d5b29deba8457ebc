//! The server orchestrator.
//!
//! One `Store` per server process: it owns the doc and query registries,
//! terminates the wire protocol for every accepted channel, applies pre/post
//! hooks, and bridges committed ops onto the cross-process bus.
//!
//! ```text
//! Model A ──┐                        ┌── ServerDoc (authority, persists)
//!            ├── Store::on_message ──┤
//! Model B ──┘        dispatch        └── ServerQuery (membership diffs)
//!                       │
//!                 commit_op ──► bus.publish ──► other Store processes
//!                       │                         (sent-op set drops
//!                       └── sent_ops[op.id]        our own echo)
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock, Weak};

use tessera_core::Op;

use crate::bus::PubSub;
use crate::channel::Channel;
use crate::client::Model;
use crate::protocol::{Message, SyncData};
use crate::storage::Storage;
use crate::util::now_millis;

use super::doc_set::DocSet;
use super::handle::{ClientHandle, HookParams};
use super::projection::Projection;
use super::query_set::QuerySet;

/// Per-collection options.
#[derive(Debug, Clone, Default)]
pub struct CollectionOptions {
    /// Whether clients may keep an offline replica of this collection
    /// (advertised in the handshake reply).
    pub client: bool,
}

/// Declares a projection: a read-only field subset of a target collection.
#[derive(Debug, Clone)]
pub struct ProjectionOptions {
    pub collection_name: String,
    pub fields: Vec<String>,
}

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub collections: HashMap<String, CollectionOptions>,
    pub projections: HashMap<String, ProjectionOptions>,
    /// Source tag for models created in-process.
    pub source: String,
    /// Version tag reported in the handshake reply.
    pub version: Option<String>,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            collections: HashMap::new(),
            projections: HashMap::new(),
            source: "server".to_string(),
            version: None,
        }
    }
}

/// Rejects a message before it reaches the dispatch table (authorization).
pub type PreHook = Box<dyn Fn(&Message, &HookParams) -> Result<(), String> + Send + Sync>;

/// Runs after a mutation's ack was sent; may only report failure, never roll
/// back an already-applied op.
pub type AfterHook = Box<dyn Fn(&Op, &HookParams) -> Result<(), String> + Send + Sync>;

/// The per-process server.
pub struct Store {
    storage: Arc<dyn Storage>,
    options: StoreOptions,
    doc_set: DocSet,
    query_set: QuerySet,
    projections: HashMap<String, Arc<Projection>>,
    projection_hashes: HashMap<String, String>,
    client_collection_names: Vec<String>,
    clients: StdRwLock<HashMap<u64, Arc<ClientHandle>>>,
    next_client_id: AtomicU64,
    next_model_id: AtomicU64,
    /// Ids of ops this process published; used to drop bus echoes.
    sent_ops: StdMutex<HashSet<String>>,
    bus: Option<Arc<dyn PubSub>>,
    pre_hook: StdMutex<Option<PreHook>>,
    after_hook: StdMutex<Option<AfterHook>>,
}

impl Store {
    pub fn new(storage: Arc<dyn Storage>, options: StoreOptions) -> Arc<Self> {
        Self::build(storage, None, options)
    }

    /// A store wired to a pub/sub bus: committed ops are published, and ops
    /// published by other processes are applied as if local clients sent
    /// them.
    pub fn with_bus(
        storage: Arc<dyn Storage>,
        bus: Arc<dyn PubSub>,
        options: StoreOptions,
    ) -> Arc<Self> {
        let mut receiver = bus.subscribe();
        let store = Self::build(storage, Some(bus), options);

        let weak: Weak<Store> = Arc::downgrade(&store);
        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(op) => {
                        let Some(store) = weak.upgrade() else { break };
                        store.on_bus_op(op).await;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("bus subscriber lagged by {n} ops");
                    }
                    Err(_) => break,
                }
            }
        });

        store
    }

    fn build(
        storage: Arc<dyn Storage>,
        bus: Option<Arc<dyn PubSub>>,
        options: StoreOptions,
    ) -> Arc<Self> {
        let mut projections = HashMap::new();
        let mut projection_hashes = HashMap::new();
        for (name, projection_options) in &options.projections {
            let projection = Arc::new(Projection::new(
                name.clone(),
                projection_options.collection_name.clone(),
                projection_options.fields.iter().cloned(),
            ));
            projection_hashes.insert(name.clone(), projection.hash().to_string());
            projections.insert(name.clone(), projection);
        }

        let client_collection_names = options
            .collections
            .iter()
            .filter(|(_, collection_options)| collection_options.client)
            .map(|(name, _)| name.clone())
            .collect();

        Arc::new(Self {
            doc_set: DocSet::new(storage.clone()),
            query_set: QuerySet::new(storage.clone()),
            storage,
            options,
            projections,
            projection_hashes,
            client_collection_names,
            clients: StdRwLock::new(HashMap::new()),
            next_client_id: AtomicU64::new(1),
            next_model_id: AtomicU64::new(1),
            sent_ops: StdMutex::new(HashSet::new()),
            bus,
            pre_hook: StdMutex::new(None),
            after_hook: StdMutex::new(None),
        })
    }

    pub fn set_pre_hook(
        &self,
        hook: impl Fn(&Message, &HookParams) -> Result<(), String> + Send + Sync + 'static,
    ) {
        *self.pre_hook.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn set_after_hook(
        &self,
        hook: impl Fn(&Op, &HookParams) -> Result<(), String> + Send + Sync + 'static,
    ) {
        *self.after_hook.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Accept a connection: register a client handle with a fresh session
    /// and pump its messages into the dispatch table until it closes.
    pub fn on_channel(self: &Arc<Self>, channel: Channel) -> Arc<ClientHandle> {
        self.on_channel_with_params(channel, HookParams { server: false })
    }

    fn on_channel_with_params(
        self: &Arc<Self>,
        mut channel: Channel,
        params: HookParams,
    ) -> Arc<ClientHandle> {
        let id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        let client = Arc::new(ClientHandle::new(id, channel.sender(), params));
        self.clients.write().unwrap().insert(id, client.clone());

        let Some(mut receiver) = channel.take_receiver() else {
            log::error!("channel without receiver handed to store");
            return client;
        };

        let store = self.clone();
        let pump_client = client.clone();
        tokio::spawn(async move {
            while let Some(message) = receiver.recv().await {
                store.handle_message(message, &pump_client).await;
            }
            log::debug!("client {} closed", pump_client.id);
            store.channel_close(&pump_client).await;
        });

        client
    }

    /// Create an in-process model wired to this store over a piped channel.
    pub fn create_model(self: &Arc<Self>) -> Model {
        let (model_end, store_end) = Channel::pipe();
        self.on_channel_with_params(store_end, HookParams { server: true });

        let model_id = self.next_model_id.fetch_add(1, Ordering::Relaxed);
        Model::with_source(model_end, format!("{}-model-{model_id}", self.options.source))
    }

    /// Resolve a client-addressed collection to the underlying collection
    /// and the projection it is viewed through, if any.
    fn resolve_collection(&self, name: &str) -> (String, Option<Arc<Projection>>) {
        match self.projections.get(name) {
            Some(projection) => (projection.collection_name.clone(), Some(projection.clone())),
            None => (name.to_string(), None),
        }
    }

    /// The dispatch table: one arm per message type, each acknowledged with
    /// an `ack_id`-correlated reply.
    pub async fn handle_message(&self, message: Message, client: &Arc<ClientHandle>) {
        {
            let pre_hook = self.pre_hook.lock().unwrap();
            if let Some(hook) = pre_hook.as_ref() {
                if let Err(reason) = hook(&message, &client.params) {
                    drop(pre_hook);
                    self.reject_message(&message, client, reason).await;
                    return;
                }
            }
        }

        match message {
            Message::Handshake { id } => {
                client
                    .send(Message::HandshakeAck {
                        ack_id: id,
                        collection_names: self.client_collection_names.clone(),
                        date: now_millis(),
                        projection_hashes: self.projection_hashes.clone(),
                        version: self.options.version.clone(),
                    })
                    .await;
            }

            Message::Sync { id, data } => {
                self.handle_sync(id, data, client).await;
            }

            Message::Fetch {
                id,
                collection_name,
                doc_id,
                version,
            } => {
                let (target, projection) = self.resolve_collection(&collection_name);
                match self.doc_set.get_or_create(&target, &doc_id).await {
                    Ok(doc) => {
                        doc.fetch(client.clone(), projection, version, id).await;
                        self.doc_set.maybe_unattach(&doc).await;
                    }
                    Err(err) => {
                        client
                            .send(Message::error_ack(
                                id,
                                Some(collection_name),
                                Some(doc_id),
                                err.to_string(),
                            ))
                            .await;
                    }
                }
            }

            Message::Sub {
                id,
                collection_name,
                doc_id,
                version,
            } => {
                let (target, projection) = self.resolve_collection(&collection_name);
                match self.doc_set.get_or_create(&target, &doc_id).await {
                    Ok(doc) => {
                        doc.subscribe(client.clone(), projection, version, Some(id)).await;
                    }
                    Err(err) => {
                        client
                            .send(Message::error_ack(
                                id,
                                Some(collection_name),
                                Some(doc_id),
                                err.to_string(),
                            ))
                            .await;
                    }
                }
            }

            Message::Unsub {
                collection_name,
                doc_id,
            } => {
                let (target, _) = self.resolve_collection(&collection_name);
                if let Some(doc) = self.doc_set.get(&target, &doc_id).await {
                    if doc.remove_channel(client.id).await == 0 {
                        self.doc_set.unattach(&target, &doc_id).await;
                    }
                }
                client
                    .session
                    .lock()
                    .await
                    .unsubscribe_doc(&collection_name, &doc_id);
            }

            Message::Qsub {
                id,
                collection_name,
                expression,
                doc_ids,
            } => {
                if self.projections.contains_key(&collection_name) {
                    client
                        .send(Message::error_ack(
                            id,
                            Some(collection_name),
                            None,
                            "queries over projections are not supported",
                        ))
                        .await;
                    return;
                }
                match self.query_set.get_or_create(&collection_name, expression).await {
                    Ok(query) => {
                        query.subscribe(client.clone(), doc_ids, Some(id)).await;
                    }
                    Err(err) => {
                        client
                            .send(Message::error_ack(
                                id,
                                Some(collection_name),
                                None,
                                err.to_string(),
                            ))
                            .await;
                    }
                }
            }

            Message::Qunsub {
                collection_name,
                hash,
            } => {
                if let Some(query) = self.query_set.get(&collection_name, &hash).await {
                    if query.remove_channel(client.id).await == 0 {
                        self.query_set.unattach(&collection_name, &hash).await;
                    }
                }
                client
                    .session
                    .lock()
                    .await
                    .unsubscribe_query(&collection_name, &hash);
            }

            Message::Qfetch {
                id,
                collection_name,
                expression,
                doc_ids,
            } => {
                match self.query_set.get_or_create(&collection_name, expression).await {
                    Ok(query) => {
                        query.fetch(client.clone(), doc_ids, id).await;
                        self.query_set.maybe_unattach(&query).await;
                    }
                    Err(err) => {
                        client
                            .send(Message::error_ack(
                                id,
                                Some(collection_name),
                                None,
                                err.to_string(),
                            ))
                            .await;
                    }
                }
            }

            Message::Op { op } => {
                self.handle_mutation(op, client).await;
            }

            other => {
                log::debug!("unhandled message: {other:?}");
            }
        }
    }

    /// Bulk reconnect: apply every pending op first, then re-subscribe docs
    /// and queries (so subscriptions observe post-replay state), then ack.
    async fn handle_sync(&self, id: String, data: SyncData, client: &Arc<ClientHandle>) {
        let mut resubscribes = Vec::new();

        for (collection_name, docs) in data.collections {
            let (target, projection) = self.resolve_collection(&collection_name);
            for (doc_id, doc_data) in docs {
                let doc = match self.doc_set.get_or_create(&target, &doc_id).await {
                    Ok(doc) => doc,
                    Err(err) => {
                        log::error!("sync load of {target}/{doc_id} failed: {err}");
                        continue;
                    }
                };
                for op in &doc_data.ops {
                    if projection.is_some() {
                        log::warn!("dropping sync op against projection {collection_name}");
                        continue;
                    }
                    match doc.on_op(op).await {
                        Ok(()) => self.commit_op(op).await,
                        Err(err) => {
                            client
                                .send(Message::error_ack(
                                    op.id.clone(),
                                    Some(op.collection_name.clone()),
                                    Some(op.doc_id.clone()),
                                    err.to_string(),
                                ))
                                .await;
                        }
                    }
                }
                if let Some(version) = doc_data.version {
                    resubscribes.push((doc, projection.clone(), version));
                }
            }
        }

        for (doc, projection, version) in resubscribes {
            doc.subscribe(client.clone(), projection, version, None).await;
        }

        for query_data in data.queries.into_values() {
            match self
                .query_set
                .get_or_create(&query_data.collection_name, query_data.expression)
                .await
            {
                Ok(query) => {
                    query.subscribe(client.clone(), query_data.doc_ids, None).await;
                }
                Err(err) => {
                    log::error!("sync query load failed: {err}");
                }
            }
        }

        client.send(Message::SyncAck { ack_id: id }).await;
    }

    /// The authoritative mutation path: apply + persist + broadcast, ack on
    /// success, error ack on rejection. The op is authoritative once acked.
    async fn handle_mutation(&self, op: Op, client: &Arc<ClientHandle>) {
        if self.projections.contains_key(&op.collection_name) {
            client
                .send(Message::error_ack(
                    op.id.clone(),
                    Some(op.collection_name.clone()),
                    Some(op.doc_id.clone()),
                    "projection is read-only",
                ))
                .await;
            return;
        }

        let doc = match self.doc_set.get_or_create(&op.collection_name, &op.doc_id).await {
            Ok(doc) => doc,
            Err(err) => {
                client
                    .send(Message::error_ack(
                        op.id.clone(),
                        Some(op.collection_name.clone()),
                        Some(op.doc_id.clone()),
                        err.to_string(),
                    ))
                    .await;
                return;
            }
        };

        match doc.on_op(&op).await {
            Ok(()) => {
                client
                    .send(Message::Ack {
                        ack_id: op.id.clone(),
                        collection_name: Some(op.collection_name.clone()),
                        doc_id: Some(op.doc_id.clone()),
                        error: None,
                    })
                    .await;
                self.commit_op(&op).await;

                let failure = {
                    let after_hook = self.after_hook.lock().unwrap();
                    after_hook.as_ref().and_then(|hook| hook(&op, &client.params).err())
                };
                if let Some(reason) = failure {
                    // Reported only: the op is already authoritative.
                    log::error!("after hook failed for op {}: {reason}", op.id);
                }
            }
            Err(err) => {
                client
                    .send(Message::error_ack(
                        op.id.clone(),
                        Some(op.collection_name.clone()),
                        Some(op.doc_id.clone()),
                        err.to_string(),
                    ))
                    .await;
            }
        }
    }

    /// Post-commit fan-out: refresh live queries, then publish to the bus
    /// (remembering the op id so our own echo is dropped).
    async fn commit_op(&self, op: &Op) {
        self.query_set.on_op(op).await;
        if let Some(bus) = &self.bus {
            self.sent_ops.lock().unwrap().insert(op.id.clone());
            bus.publish(op.clone());
        }
    }

    /// An op delivered by the bus. An op this process itself published must
    /// never be reapplied here; any other process' op is applied exactly as
    /// a locally-originated one would be.
    pub async fn on_bus_op(&self, op: Op) {
        if self.sent_ops.lock().unwrap().remove(&op.id) {
            return;
        }
        log::debug!("applying replicated op {} from {}", op.id, op.source);
        self.doc_set.on_op(&op).await;
        self.query_set.on_op(&op).await;
    }

    /// A connection closed: synchronously unregister it everywhere so
    /// eviction checks fire promptly.
    async fn channel_close(&self, client: &Arc<ClientHandle>) {
        self.clients.write().unwrap().remove(&client.id);
        self.doc_set.channel_close(client.id).await;
        self.query_set.channel_close(client.id).await;
    }

    /// Reply to a hook-rejected message with an error ack.
    async fn reject_message(&self, message: &Message, client: &Arc<ClientHandle>, reason: String) {
        let (collection_name, doc_id) = message.target();
        if let Some(ack_id) = message.request_id() {
            client
                .send(Message::error_ack(
                    ack_id,
                    collection_name.map(String::from),
                    doc_id.map(String::from),
                    reason,
                ))
                .await;
        } else {
            log::warn!("hook rejected {message:?}: {reason}");
        }
    }

    pub async fn doc_count(&self) -> usize {
        self.doc_set.len().await
    }

    /// Version of an attached doc, if present (introspection, mostly for
    /// tests and monitoring).
    pub async fn doc_version(&self, collection_name: &str, doc_id: &str) -> Option<u64> {
        let doc = self.doc_set.get(collection_name, doc_id).await?;
        Some(doc.version().await)
    }

    pub async fn query_count(&self) -> usize {
        self.query_set.len().await
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().unwrap().len()
    }
}

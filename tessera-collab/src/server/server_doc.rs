//! Server-side document authority.
//!
//! A `ServerDoc` is the single mutation path for its `(collection, doc)`:
//! every protocol handler funnels writes through [`ServerDoc::on_op`], which
//! applies the op, persists the log, and broadcasts the missed suffix to
//! every subscribed channel via that channel's session cursor.
//!
//! Persistence uses optimistic concurrency: `prev_version` is the token, and
//! a stale token makes the save reload from storage (merging in the
//! concurrent writer's log) and retry. The retry is a bounded explicit loop,
//! not recursion:
//!
//! ```text
//! Saving ──VersionConflict──► ReloadingAfterConflict ──► Saving (≤ 5×)
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};

use tessera_core::{Doc, Op};

use crate::protocol::Message;
use crate::storage::{Storage, StorageError};

use super::handle::ClientHandle;
use super::projection::Projection;

/// Bounded retry for conflicting saves; each retry reloads first.
const MAX_SAVE_RETRIES: u32 = 5;

/// One channel subscribed to a doc, with the projection it sees it through.
#[derive(Clone)]
pub struct ChannelSub {
    pub client: Arc<ClientHandle>,
    pub projection: Option<Arc<Projection>>,
}

impl ChannelSub {
    /// The collection name this subscriber addresses (and keys cursors by).
    fn collection_name(&self, doc: &ServerDoc) -> String {
        match &self.projection {
            Some(projection) => projection.name.clone(),
            None => doc.collection_name.clone(),
        }
    }
}

struct Inner {
    doc: Doc,
    /// Version last successfully persisted; the optimistic-concurrency token.
    prev_version: Option<u64>,
    loaded: bool,
    loading: bool,
    channels: Vec<ChannelSub>,
}

/// The server-side state machine for one document.
pub struct ServerDoc {
    pub collection_name: String,
    pub doc_id: String,
    storage: Arc<dyn Storage>,
    inner: Mutex<Inner>,
    loaded_tx: watch::Sender<bool>,
}

impl ServerDoc {
    pub fn new(
        collection_name: impl Into<String>,
        doc_id: impl Into<String>,
        storage: Arc<dyn Storage>,
    ) -> Arc<Self> {
        let collection_name = collection_name.into();
        let doc_id = doc_id.into();
        let (loaded_tx, _) = watch::channel(false);
        Arc::new(Self {
            collection_name,
            doc_id: doc_id.clone(),
            storage,
            inner: Mutex::new(Inner {
                doc: Doc::new(doc_id),
                prev_version: None,
                loaded: false,
                loading: false,
                channels: Vec::new(),
            }),
            loaded_tx,
        })
    }

    /// Lazy load from storage.
    ///
    /// The first caller becomes the loader; concurrent callers wait on the
    /// loaded signal instead of issuing duplicate reads. A failed load
    /// leaves the doc unloaded, and the next access re-attempts it.
    pub async fn ensure_loaded(&self) -> Result<(), StorageError> {
        loop {
            let mut loaded_rx = self.loaded_tx.subscribe();
            {
                let mut inner = self.inner.lock().await;
                if inner.loaded {
                    return Ok(());
                }
                if !inner.loading {
                    inner.loading = true;
                    break;
                }
            }
            // Another task is loading; wake on its outcome and re-check.
            let _ = loaded_rx.changed().await;
        }

        match self
            .storage
            .get_doc_by_id(&self.collection_name, &self.doc_id)
            .await
        {
            Ok(record) => {
                let mut inner = self.inner.lock().await;
                if let Some(record) = record {
                    inner.doc.replace_log(record.ops);
                    inner.prev_version = Some(record.version);
                }
                inner.loading = false;
                inner.loaded = true;
                drop(inner);
                log::debug!("loaded {}/{}", self.collection_name, self.doc_id);
                let _ = self.loaded_tx.send(true);
                Ok(())
            }
            Err(err) => {
                log::error!(
                    "load of {}/{} failed: {err}",
                    self.collection_name,
                    self.doc_id
                );
                let mut inner = self.inner.lock().await;
                inner.loading = false;
                drop(inner);
                let _ = self.loaded_tx.send(false);
                Err(err)
            }
        }
    }

    /// Apply, persist, and broadcast one op: the single authoritative
    /// mutation path.
    pub async fn on_op(&self, op: &Op) -> Result<(), StorageError> {
        {
            let mut inner = self.inner.lock().await;
            inner.doc.apply_op(op);
        }
        self.save().await?;
        self.broadcast().await;
        Ok(())
    }

    /// Apply an op replicated from another process: no save (the publisher
    /// already persisted it), but broadcast to local subscribers.
    ///
    /// `prev_version` deliberately stays stale; if this process later writes,
    /// the conflict-reload path reconciles against storage.
    pub async fn on_replicated_op(&self, op: &Op) {
        {
            let mut inner = self.inner.lock().await;
            inner.doc.apply_op(op);
        }
        self.broadcast().await;
    }

    /// Persist the full log and state under the optimistic-concurrency
    /// check; no-op when unloaded or when nothing new needs persisting.
    pub async fn save(&self) -> Result<(), StorageError> {
        let mut attempts = 0;
        loop {
            let (prev_version, version, state, ops) = {
                let inner = self.inner.lock().await;
                if !inner.loaded {
                    return Ok(());
                }
                let version = inner.doc.version();
                if version == 0 || inner.prev_version == Some(version) {
                    return Ok(());
                }
                (
                    inner.prev_version,
                    version,
                    inner.doc.state().cloned(),
                    inner.doc.ops().to_vec(),
                )
            };

            match self
                .storage
                .save_doc(
                    &self.collection_name,
                    &self.doc_id,
                    prev_version,
                    version,
                    state,
                    ops,
                )
                .await
            {
                Ok(()) => {
                    let mut inner = self.inner.lock().await;
                    inner.prev_version = Some(version);
                    log::debug!(
                        "saved {}/{} at version {version}",
                        self.collection_name,
                        self.doc_id
                    );
                    return Ok(());
                }
                Err(err) if err.is_version_conflict() => {
                    attempts += 1;
                    if attempts > MAX_SAVE_RETRIES {
                        log::error!(
                            "save of {}/{} still conflicting after {MAX_SAVE_RETRIES} retries",
                            self.collection_name,
                            self.doc_id
                        );
                        return Err(err);
                    }
                    log::debug!(
                        "version conflict on {}/{}, reloading (attempt {attempts})",
                        self.collection_name,
                        self.doc_id
                    );
                    self.reload().await?;
                    if attempts > 1 {
                        tokio::time::sleep(Duration::from_millis(10 * attempts as u64)).await;
                    }
                }
                Err(err) => {
                    log::error!(
                        "save of {}/{} failed: {err}",
                        self.collection_name,
                        self.doc_id
                    );
                    return Err(err);
                }
            }
        }
    }

    /// Re-read storage after a conflict: the stored log becomes the base and
    /// local ops the concurrent writer did not persist are re-appended.
    async fn reload(&self) -> Result<(), StorageError> {
        let record = self
            .storage
            .get_doc_by_id(&self.collection_name, &self.doc_id)
            .await?;

        let mut inner = self.inner.lock().await;
        match record {
            Some(record) => {
                let mut merged = record.ops;
                let unpersisted: Vec<Op> = inner
                    .doc
                    .ops()
                    .iter()
                    .filter(|op| !merged.iter().any(|stored| stored.id == op.id))
                    .cloned()
                    .collect();
                merged.extend(unpersisted);
                inner.doc.replace_log(merged);
                inner.prev_version = Some(record.version);
            }
            None => {
                inner.prev_version = None;
            }
        }
        Ok(())
    }

    /// Send every subscribed channel the op suffix after its cursor.
    pub async fn broadcast(&self) {
        let subs = {
            let inner = self.inner.lock().await;
            inner.channels.clone()
        };
        log::debug!(
            "broadcast {}/{} to {} channels",
            self.collection_name,
            self.doc_id,
            subs.len()
        );
        for sub in subs {
            self.send_ops_to_channel(&sub).await;
        }
    }

    /// Catch one channel up from its session cursor.
    ///
    /// Holds the session lock across the send so cursor updates stay atomic
    /// with delivery order; the doc lock is only taken for the snapshot.
    async fn send_ops_to_channel(&self, sub: &ChannelSub) {
        let cursor_collection = sub.collection_name(self);
        let mut session = sub.client.session.lock().await;
        let cursor = session.get_doc_version(&cursor_collection, &self.doc_id);

        let (ops, version) = {
            let inner = self.inner.lock().await;
            (
                inner.doc.get_ops_to_send(cursor).to_vec(),
                inner.doc.version(),
            )
        };

        for op in ops {
            let op = match &sub.projection {
                Some(projection) => match projection.project_op(&op) {
                    Some(op) => op,
                    None => continue,
                },
                None => op,
            };
            if !sub.client.send(Message::Op { op }).await {
                return;
            }
        }
        session.set_doc_version(&cursor_collection, &self.doc_id, version);
    }

    /// Register a subscriber at its version, catch it up, and acknowledge
    /// with the doc's current version so the client knows what to replay.
    pub async fn subscribe(
        &self,
        client: Arc<ClientHandle>,
        projection: Option<Arc<Projection>>,
        version: u64,
        ack_id: Option<String>,
    ) {
        let sub = ChannelSub {
            client,
            projection,
        };
        let cursor_collection = sub.collection_name(self);
        sub.client
            .session
            .lock()
            .await
            .subscribe_doc(&cursor_collection, &self.doc_id, version);
        {
            let mut inner = self.inner.lock().await;
            if !inner.channels.iter().any(|c| c.client.id == sub.client.id) {
                inner.channels.push(sub.clone());
            }
        }

        self.send_ops_to_channel(&sub).await;

        let current_version = self.version().await;
        sub.client
            .send(Message::SubAck {
                ack_id,
                collection_name: cursor_collection,
                doc_id: self.doc_id.clone(),
                version: current_version,
            })
            .await;
    }

    /// One-shot catch-up without a standing subscription.
    pub async fn fetch(
        &self,
        client: Arc<ClientHandle>,
        projection: Option<Arc<Projection>>,
        version: u64,
        ack_id: String,
    ) {
        let sub = ChannelSub {
            client,
            projection,
        };
        let (ops, _) = {
            let inner = self.inner.lock().await;
            (
                inner.doc.get_ops_to_send(version).to_vec(),
                inner.doc.version(),
            )
        };
        for op in ops {
            let op = match &sub.projection {
                Some(projection) => match projection.project_op(&op) {
                    Some(op) => op,
                    None => continue,
                },
                None => op,
            };
            if !sub.client.send(Message::Op { op }).await {
                return;
            }
        }
        sub.client.send(Message::ack(ack_id)).await;
    }

    /// Deregister a channel; returns how many remain subscribed.
    pub async fn remove_channel(&self, client_id: u64) -> usize {
        let mut inner = self.inner.lock().await;
        inner.channels.retain(|sub| sub.client.id != client_id);
        inner.channels.len()
    }

    pub async fn channel_count(&self) -> usize {
        self.inner.lock().await.channels.len()
    }

    pub async fn version(&self) -> u64 {
        self.inner.lock().await.doc.version()
    }

    pub async fn state(&self) -> Option<serde_json::Value> {
        self.inner.lock().await.doc.state().cloned()
    }

    #[cfg(test)]
    pub(crate) async fn prev_version(&self) -> Option<u64> {
        self.inner.lock().await.prev_version
    }
}

//! Server-side live queries.
//!
//! A `ServerQuery` materializes its result set from storage, re-evaluates
//! the touched document on every committed op for its collection, and sends
//! each subscribing channel only the membership diff against that channel's
//! last-sent id set. Added docs travel with their op logs so the client can
//! attach full replicas; removed docs travel as bare ids.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{watch, Mutex};

use tessera_core::{query, Expression, Op, QueryResult};

use crate::protocol::{DocWithOps, Message};
use crate::storage::{DocRecord, Storage, StorageError};

use super::handle::ClientHandle;

struct Inner {
    loaded: bool,
    loading: bool,
    /// Currently-matching documents, by id.
    records: HashMap<String, DocRecord>,
    result: QueryResult,
    channels: Vec<Arc<ClientHandle>>,
}

/// One live query, identified by `(collection, expression hash)`.
pub struct ServerQuery {
    pub collection_name: String,
    pub expression: Expression,
    pub hash: String,
    storage: Arc<dyn Storage>,
    inner: Mutex<Inner>,
    loaded_tx: watch::Sender<bool>,
}

impl ServerQuery {
    pub fn new(
        collection_name: impl Into<String>,
        expression: Expression,
        storage: Arc<dyn Storage>,
    ) -> Arc<Self> {
        let hash = expression.hash();
        let (loaded_tx, _) = watch::channel(false);
        Arc::new(Self {
            collection_name: collection_name.into(),
            expression,
            hash,
            storage,
            inner: Mutex::new(Inner {
                loaded: false,
                loading: false,
                records: HashMap::new(),
                result: QueryResult::Ids(Vec::new()),
                channels: Vec::new(),
            }),
            loaded_tx,
        })
    }

    /// Load the initial result set from storage; duplicate loads are
    /// suppressed the same way as for docs.
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
            let _ = loaded_rx.changed().await;
        }

        match self
            .storage
            .get_docs_by_query(&self.collection_name, self.expression.raw())
            .await
        {
            Ok(records) => {
                let mut inner = self.inner.lock().await;
                inner.records = records
                    .into_iter()
                    .map(|record| (record.id.clone(), record))
                    .collect();
                inner.result = self.evaluate(&inner.records);
                inner.loading = false;
                inner.loaded = true;
                drop(inner);
                let _ = self.loaded_tx.send(true);
                Ok(())
            }
            Err(err) => {
                log::error!(
                    "query load for {}#{} failed: {err}",
                    self.collection_name,
                    self.hash
                );
                let mut inner = self.inner.lock().await;
                inner.loading = false;
                drop(inner);
                let _ = self.loaded_tx.send(false);
                Err(err)
            }
        }
    }

    fn evaluate(&self, records: &HashMap<String, DocRecord>) -> QueryResult {
        self.expression
            .evaluate(records.values().filter_map(|record| record.state.as_ref()))
    }

    /// Re-evaluate the document an op touched and fan the diff out.
    ///
    /// Called after the op was persisted, so the storage read observes the
    /// committed state (including ops replicated from other processes).
    pub async fn on_op(&self, op: &Op) {
        {
            let inner = self.inner.lock().await;
            if !inner.loaded {
                return;
            }
        }

        let record = match self
            .storage
            .get_doc_by_id(&self.collection_name, &op.doc_id)
            .await
        {
            Ok(record) => record,
            Err(err) => {
                log::error!(
                    "query refresh read for {}/{} failed: {err}",
                    self.collection_name,
                    op.doc_id
                );
                return;
            }
        };

        let (changed, channels) = {
            let mut inner = self.inner.lock().await;
            let matches = record.as_ref().is_some_and(|record| {
                record
                    .state
                    .as_ref()
                    .is_some_and(|state| self.expression.matches(state))
            });
            if matches {
                // unwrap is safe: matches implies the record exists
                inner.records.insert(op.doc_id.clone(), record.unwrap());
            } else {
                inner.records.remove(&op.doc_id);
            }
            let result = self.evaluate(&inner.records);
            let changed = result != inner.result;
            inner.result = result;
            (changed, inner.channels.clone())
        };

        if !changed {
            return;
        }
        for client in channels {
            self.send_diff(&client, None).await;
        }
    }

    /// Send one channel the diff between its last-sent id set and the
    /// current result, and advance its session to the current set.
    async fn send_diff(&self, client: &Arc<ClientHandle>, ack_id: Option<String>) {
        let mut session = client.session.lock().await;
        let known = session
            .get_query_ids(&self.collection_name, &self.hash)
            .cloned()
            .unwrap_or_default();

        let (ids, count, added) = {
            let inner = self.inner.lock().await;
            let (ids, count) = match &inner.result {
                QueryResult::Ids(ids) => (ids.clone(), None),
                QueryResult::Count(count) => (Vec::new(), Some(*count)),
            };
            let (added_ids, _) = query::diff_ids(&known, &ids);
            let added: HashMap<String, DocWithOps> = added_ids
                .iter()
                .filter_map(|id| {
                    inner.records.get(id).map(|record| {
                        (
                            id.clone(),
                            DocWithOps {
                                ops: record.ops.clone(),
                                version: record.version,
                            },
                        )
                    })
                })
                .collect();
            (ids, count, added)
        };
        let (_, removed) = query::diff_ids(&known, &ids);

        if ack_id.is_none() && added.is_empty() && removed.is_empty() && count.is_none() {
            return;
        }

        client
            .send(Message::QueryDiff {
                ack_id,
                collection_name: self.collection_name.clone(),
                hash: self.hash.clone(),
                added,
                removed,
                count,
            })
            .await;
        session.set_query_ids(&self.collection_name, &self.hash, ids);
    }

    /// Register a subscriber that already knows `known_ids`, then send the
    /// catch-up diff with the acknowledgment.
    pub async fn subscribe(
        &self,
        client: Arc<ClientHandle>,
        known_ids: Vec<String>,
        ack_id: Option<String>,
    ) {
        client.session.lock().await.set_query_ids(
            &self.collection_name,
            &self.hash,
            known_ids,
        );
        {
            let mut inner = self.inner.lock().await;
            if !inner.channels.iter().any(|c| c.id == client.id) {
                inner.channels.push(client.clone());
            }
        }
        self.send_diff(&client, ack_id).await;
    }

    /// One-shot diff against the caller-provided id set; no registration.
    pub async fn fetch(&self, client: Arc<ClientHandle>, known_ids: Vec<String>, ack_id: String) {
        let (ids, count, added) = {
            let inner = self.inner.lock().await;
            let (ids, count) = match &inner.result {
                QueryResult::Ids(ids) => (ids.clone(), None),
                QueryResult::Count(count) => (Vec::new(), Some(*count)),
            };
            let (added_ids, _) = query::diff_ids(&known_ids, &ids);
            let added: HashMap<String, DocWithOps> = added_ids
                .iter()
                .filter_map(|id| {
                    inner.records.get(id).map(|record| {
                        (
                            id.clone(),
                            DocWithOps {
                                ops: record.ops.clone(),
                                version: record.version,
                            },
                        )
                    })
                })
                .collect();
            (ids, count, added)
        };
        let (_, removed) = query::diff_ids(&known_ids, &ids);

        client
            .send(Message::QueryDiff {
                ack_id: Some(ack_id),
                collection_name: self.collection_name.clone(),
                hash: self.hash.clone(),
                added,
                removed,
                count,
            })
            .await;
    }

    pub async fn remove_channel(&self, client_id: u64) -> usize {
        let mut inner = self.inner.lock().await;
        inner.channels.retain(|client| client.id != client_id);
        inner.channels.len()
    }

    pub async fn channel_count(&self) -> usize {
        self.inner.lock().await.channels.len()
    }

    pub async fn result(&self) -> QueryResult {
        self.inner.lock().await.result.clone()
    }
}

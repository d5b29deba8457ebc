//! Client-side document replica.
//!
//! A `RemoteDoc` applies local mutations optimistically and tracks which ops
//! the server has acknowledged: `server_version` is the server's cursor, and
//! the op ids in `pending` are local mutations the server has not confirmed.
//! On (re)subscribe the doc retransmits the log suffix after the server's
//! cursor plus anything still pending, and `distill_ops` compacts fully
//! acknowledged ops into the base state to bound log growth.

use std::collections::HashSet;

use serde_json::Value;
use tokio::sync::broadcast;

use tessera_core::{Doc, Op};

use crate::protocol::DocSyncData;
use crate::storage::DocRecord;

/// Buffered change events per subscriber.
const CHANGE_CAPACITY: usize = 64;

pub struct RemoteDoc {
    pub collection_name: String,
    doc: Doc,
    /// The version cursor the server has acknowledged.
    pub server_version: u64,
    /// Ids of local ops not yet confirmed by the server.
    pending: HashSet<String>,
    /// Reference count of active subscriptions, not a boolean.
    subscribed: u32,
    changes: broadcast::Sender<()>,
}

impl RemoteDoc {
    pub fn new(collection_name: impl Into<String>, doc_id: impl Into<String>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            collection_name: collection_name.into(),
            doc: Doc::new(doc_id),
            server_version: 0,
            pending: HashSet::new(),
            subscribed: 0,
            changes,
        }
    }

    /// Rebuild from a locally-persisted record: base state + pending suffix.
    pub fn from_record(collection_name: impl Into<String>, record: DocRecord) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        let pending = record.ops.iter().map(|op| op.id.clone()).collect();
        Self {
            collection_name: collection_name.into(),
            doc: Doc::from_snapshot(record.id, record.state, record.version, record.ops),
            server_version: record.version,
            pending,
            subscribed: 0,
            changes,
        }
    }

    pub fn doc_id(&self) -> &str {
        self.doc.doc_id()
    }

    pub fn state(&self) -> Option<&Value> {
        self.doc.state()
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.doc.get(field)
    }

    pub fn version(&self) -> u64 {
        self.doc.version()
    }

    pub fn subscribed(&self) -> u32 {
        self.subscribed
    }

    /// Apply a local mutation optimistically; the op becomes pending until
    /// the server acknowledges it.
    pub fn apply_local_op(&mut self, op: &Op) -> Option<Value> {
        let prev = self.doc.apply_op(op);
        self.pending.insert(op.id.clone());
        prev
    }

    /// Apply an op that originated elsewhere (another client, or a server
    /// push). Returns whether the observable state actually changed, so a
    /// semantic no-op does not spuriously notify.
    pub fn receive_op(&mut self, op: &Op) -> bool {
        // Every push advances the server's cursor for this channel, even
        // when it echoes an op we already hold.
        self.server_version += 1;
        self.pending.remove(&op.id);
        if self.doc.contains_op(&op.id) {
            return false;
        }
        let before = self.doc.state().cloned();
        self.doc.apply_op(op);
        self.doc.state() != before.as_ref()
    }

    /// Merge a server-provided replica (full log + version), as delivered in
    /// query diffs. Duplicate ops are skipped; pending ops the server turns
    /// out to hold are confirmed.
    pub fn merge_server_ops(&mut self, ops: &[Op], version: u64) {
        for op in ops {
            self.pending.remove(&op.id);
            self.doc.apply_op(op);
        }
        self.server_version = self.server_version.max(version);
    }

    /// Handle a subscribe acknowledgment: adopt the server's cursor, compact
    /// acknowledged ops, and return what must be retransmitted.
    pub fn on_subscribed(&mut self, server_version: u64) -> Vec<Op> {
        self.server_version = server_version;
        self.distill_ops();
        self.ops_to_resend()
    }

    /// The ops the server still needs: the log suffix after its cursor plus
    /// any op still pending, in log order.
    pub fn ops_to_resend(&self) -> Vec<Op> {
        let distilled = self.doc.distilled();
        self.doc
            .ops()
            .iter()
            .enumerate()
            .filter(|(index, op)| {
                distilled + *index as u64 >= self.server_version || self.pending.contains(&op.id)
            })
            .map(|(_, op)| op.clone())
            .collect()
    }

    /// Compact the longest acknowledged, non-pending prefix into the base
    /// state.
    pub fn distill_ops(&mut self) {
        let mut boundary = self.doc.distilled();
        for op in self.doc.ops() {
            if boundary >= self.server_version || self.pending.contains(&op.id) {
                break;
            }
            boundary += 1;
        }
        self.doc.distill_to(boundary);
    }

    /// Confirm one op (a mutation ack arrived).
    pub fn acknowledge(&mut self, op_id: &str) {
        self.pending.remove(op_id);
    }

    /// Roll back exactly one rejected op (searched by id, not position) and
    /// recompute the state; unrelated pending ops stay intact.
    pub fn reject_op(&mut self, op_id: &str) -> Option<Op> {
        self.pending.remove(op_id);
        self.doc.reject_op(op_id)
    }

    /// Payload for the bulk reconnect message.
    pub fn sync_data(&self) -> DocSyncData {
        DocSyncData {
            ops: self.ops_to_resend(),
            version: (self.subscribed > 0).then(|| self.doc.version()),
        }
    }

    /// What the local store should persist: the server cursor, the current
    /// state, and the unacknowledged suffix.
    pub fn persist_record(&self) -> DocRecord {
        DocRecord {
            id: self.doc.doc_id().to_string(),
            version: self.server_version,
            state: self.doc.state().cloned(),
            ops: self.ops_to_resend(),
        }
    }

    /// 0 to 1 transitions subscribe; returns whether this call crossed it.
    pub fn subscribe_ref(&mut self) -> bool {
        self.subscribed += 1;
        self.subscribed == 1
    }

    /// 1 to 0 transitions unsubscribe; returns whether this call crossed it.
    pub fn unsubscribe_ref(&mut self) -> bool {
        if self.subscribed == 0 {
            return false;
        }
        self.subscribed -= 1;
        self.subscribed == 0
    }

    pub fn changes(&self) -> broadcast::Receiver<()> {
        self.changes.subscribe()
    }

    pub fn emit_change(&self) {
        let _ = self.changes.send(());
    }
}

//! The document state machine: an ordered op log plus a materialized state.
//!
//! Invariants:
//! - `state` always equals the left fold of add/set/del semantics over the
//!   log (after `base_state`, which holds ops compacted away by
//!   [`Doc::distill_to`]); replay is deterministic.
//! - `version()` is a cursor, not a content hash: it counts ops, so
//!   [`Doc::get_ops_to_send`] can hand any subscriber the exact contiguous
//!   suffix it has not yet seen.
//! - Applying an op appends it to the log even when it is a semantic no-op;
//!   the log, not the state, is the unit of transfer and persistence.
//! - An op whose id is already in the log is skipped entirely, so replicated
//!   redelivery and subscribe catch-up overlaps are harmless.

use serde_json::{Map, Value};

use crate::op::{Op, OpKind};
use crate::path;

/// Apply one op to a materialized state, returning the previous value.
///
/// `add` on an existing document is a silent no-op; `set`/`del` against a
/// missing document materialize an `{_id}` shell first so that replay of any
/// log is total.
pub fn apply_to_state(state: &mut Option<Value>, doc_id: &str, op: &Op) -> Option<Value> {
    match &op.kind {
        OpKind::Add { value } => {
            if state.is_some() {
                return None;
            }
            let mut object = match value {
                Value::Object(map) => map.clone(),
                _ => Map::new(),
            };
            object.insert("_id".to_string(), Value::String(doc_id.to_string()));
            *state = Some(Value::Object(object));
            None
        }
        OpKind::Set { field, value } => {
            let current = state.get_or_insert_with(|| {
                let mut object = Map::new();
                object.insert("_id".to_string(), Value::String(doc_id.to_string()));
                Value::Object(object)
            });
            path::set_path(current, field, value.clone())
        }
        OpKind::Del { field: Some(field) } => match state {
            Some(current) => path::remove_path(current, field),
            None => None,
        },
        OpKind::Del { field: None } => state.take(),
    }
}

/// An ordered op log with its materialized state.
#[derive(Debug, Clone, Default)]
pub struct Doc {
    doc_id: String,
    ops: Vec<Op>,
    /// Number of ops compacted into `base_state`; always 0 on the server.
    distilled: u64,
    base_state: Option<Value>,
    state: Option<Value>,
}

impl Doc {
    pub fn new(doc_id: impl Into<String>) -> Self {
        Self {
            doc_id: doc_id.into(),
            ..Self::default()
        }
    }

    /// Build a doc by replaying an existing log.
    pub fn from_ops(doc_id: impl Into<String>, ops: Vec<Op>) -> Self {
        let mut doc = Self::new(doc_id);
        doc.apply_ops(ops.iter());
        doc
    }

    /// Rebuild a doc from a persisted snapshot: a base state standing in for
    /// `distilled` compacted ops, plus the retained log suffix.
    ///
    /// Replaying the suffix over a base that may already include its effects
    /// is safe: add/set/del application is idempotent in effect.
    pub fn from_snapshot(
        doc_id: impl Into<String>,
        base_state: Option<Value>,
        distilled: u64,
        ops: Vec<Op>,
    ) -> Self {
        let mut doc = Self {
            doc_id: doc_id.into(),
            ops,
            distilled,
            base_state,
            state: None,
        };
        doc.refresh_state();
        doc
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    /// The in-memory log (ops after the distilled prefix).
    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    pub fn state(&self) -> Option<&Value> {
        self.state.as_ref()
    }

    /// Read a field of the current state by dot path.
    pub fn get(&self, field: &str) -> Option<&Value> {
        path::get_path(self.state.as_ref()?, field)
    }

    /// The version cursor: total ops this doc has seen.
    pub fn version(&self) -> u64 {
        self.distilled + self.ops.len() as u64
    }

    /// How many ops have been compacted into `base_state`.
    pub fn distilled(&self) -> u64 {
        self.distilled
    }

    pub fn contains_op(&self, op_id: &str) -> bool {
        self.ops.iter().any(|op| op.id == op_id)
    }

    /// Apply an op: append it to the log and fold it into the state.
    ///
    /// Returns the previous value at the op's target, or `None` when the op
    /// was a duplicate and was skipped.
    pub fn apply_op(&mut self, op: &Op) -> Option<Value> {
        if self.contains_op(&op.id) {
            return None;
        }
        self.ops.push(op.clone());
        apply_to_state(&mut self.state, &self.doc_id, op)
    }

    pub fn apply_ops<'a>(&mut self, ops: impl IntoIterator<Item = &'a Op>) {
        for op in ops {
            self.apply_op(op);
        }
    }

    /// The contiguous log suffix strictly after `version`.
    ///
    /// This is the resumable-cursor contract: a subscriber holding the first
    /// `version` ops applies exactly this suffix to catch up.
    pub fn get_ops_to_send(&self, version: u64) -> &[Op] {
        let start = version.saturating_sub(self.distilled) as usize;
        &self.ops[start.min(self.ops.len())..]
    }

    /// Recompute `state` from scratch (`base_state` + the log).
    ///
    /// Required after a rejection removes an op from the middle of the
    /// pending suffix.
    pub fn refresh_state(&mut self) {
        self.state = self.base_state.clone();
        let ops = std::mem::take(&mut self.ops);
        for op in &ops {
            apply_to_state(&mut self.state, &self.doc_id, op);
        }
        self.ops = ops;
    }

    /// Compact every op below `version` into `base_state`, bounding log
    /// growth once the server has acknowledged that cursor.
    pub fn distill_to(&mut self, version: u64) {
        if version <= self.distilled {
            return;
        }
        let count = ((version - self.distilled) as usize).min(self.ops.len());
        for op in self.ops.drain(..count) {
            apply_to_state(&mut self.base_state, &self.doc_id, &op);
        }
        self.distilled += count as u64;
    }

    /// Remove the op with the given id from the log and rebuild the state.
    ///
    /// Returns the removed op. Unrelated ops are left intact; this is the
    /// optimistic-rollback path.
    pub fn reject_op(&mut self, op_id: &str) -> Option<Op> {
        let index = self.ops.iter().position(|op| op.id == op_id)?;
        let removed = self.ops.remove(index);
        self.refresh_state();
        Some(removed)
    }

    /// Replace the whole log (used when the server reloads after a version
    /// conflict: the stored log becomes the base, unpersisted local ops are
    /// re-appended by the caller). Resets any distilled prefix.
    pub fn replace_log(&mut self, ops: Vec<Op>) {
        self.distilled = 0;
        self.base_state = None;
        self.ops = ops;
        self.refresh_state();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::Op;
    use serde_json::json;

    fn add(value: Value) -> Op {
        Op::add("test", 1, "users", "d1", value)
    }

    fn set(field: &str, value: Value) -> Op {
        Op::set("test", 2, "users", "d1", field, value)
    }

    fn del(field: Option<&str>) -> Op {
        Op::del("test", 3, "users", "d1", field.map(String::from))
    }

    #[test]
    fn test_add_merges_id() {
        let mut doc = Doc::new("d1");
        doc.apply_op(&add(json!({"name": "x"})));
        assert_eq!(doc.state(), Some(&json!({"_id": "d1", "name": "x"})));
        assert_eq!(doc.version(), 1);
    }

    #[test]
    fn test_add_on_existing_is_noop_but_logged() {
        let mut doc = Doc::new("d1");
        doc.apply_op(&add(json!({"name": "x"})));
        doc.apply_op(&add(json!({"name": "y"})));
        assert_eq!(doc.get("name"), Some(&json!("x")));
        // The log still grew: ops are the unit of transfer.
        assert_eq!(doc.version(), 2);
    }

    #[test]
    fn test_set_returns_previous() {
        let mut doc = Doc::new("d1");
        doc.apply_op(&add(json!({"name": "x"})));
        let prev = doc.apply_op(&set("name", json!("y")));
        assert_eq!(prev, Some(json!("x")));
        assert_eq!(doc.get("name"), Some(&json!("y")));
    }

    #[test]
    fn test_set_nested_path() {
        let mut doc = Doc::new("d1");
        doc.apply_op(&add(json!({})));
        doc.apply_op(&set("profile.address.city", json!("Berlin")));
        assert_eq!(doc.get("profile.address.city"), Some(&json!("Berlin")));
    }

    #[test]
    fn test_del_field_and_doc() {
        let mut doc = Doc::new("d1");
        doc.apply_op(&add(json!({"name": "x", "age": 7})));
        let prev = doc.apply_op(&del(Some("name")));
        assert_eq!(prev, Some(json!("x")));
        assert_eq!(doc.get("name"), None);

        let prev = doc.apply_op(&del(None));
        assert_eq!(prev, Some(json!({"_id": "d1", "age": 7})));
        assert!(doc.state().is_none());
        assert_eq!(doc.version(), 3);
    }

    #[test]
    fn test_add_after_del_recreates() {
        let mut doc = Doc::new("d1");
        doc.apply_op(&add(json!({"name": "x"})));
        doc.apply_op(&del(None));
        doc.apply_op(&add(json!({"name": "z"})));
        assert_eq!(doc.get("name"), Some(&json!("z")));
    }

    #[test]
    fn test_duplicate_op_skipped() {
        let mut doc = Doc::new("d1");
        let op = set("n", json!(1));
        doc.apply_op(&add(json!({})));
        doc.apply_op(&op);
        doc.apply_op(&op);
        assert_eq!(doc.version(), 2);
    }

    #[test]
    fn test_replay_determinism() {
        let ops = vec![
            add(json!({"name": "x"})),
            set("name", json!("y")),
            set("age", json!(30)),
            del(Some("name")),
        ];
        let a = Doc::from_ops("d1", ops.clone());
        let b = Doc::from_ops("d1", ops);
        assert_eq!(a.state(), b.state());
        assert_eq!(a.state(), Some(&json!({"_id": "d1", "age": 30})));
    }

    #[test]
    fn test_cursor_completeness() {
        let ops = vec![
            add(json!({"n": 0})),
            set("n", json!(1)),
            set("n", json!(2)),
            set("m", json!(3)),
        ];
        let full = Doc::from_ops("d1", ops.clone());

        for v in 0..=ops.len() {
            let mut replica = Doc::from_ops("d1", ops[..v].to_vec());
            replica.apply_ops(full.get_ops_to_send(v as u64));
            assert_eq!(replica.state(), full.state(), "diverged at cursor {v}");
            assert_eq!(replica.version(), full.version());
        }
    }

    #[test]
    fn test_rejection_isolation() {
        let a = add(json!({"n": 1}));
        let b = set("n", json!(2));
        let c = set("m", json!(3));
        let mut doc = Doc::from_ops("d1", vec![a.clone(), b.clone(), c.clone()]);

        doc.reject_op(&b.id);

        let expected = Doc::from_ops("d1", vec![a, c]);
        assert_eq!(doc.state(), expected.state());
        assert_eq!(doc.version(), 2);
    }

    #[test]
    fn test_reject_unknown_op() {
        let mut doc = Doc::from_ops("d1", vec![add(json!({}))]);
        assert!(doc.reject_op("no-such-id").is_none());
        assert_eq!(doc.version(), 1);
    }

    #[test]
    fn test_distill_keeps_cursor_stable() {
        let ops = vec![
            add(json!({"n": 0})),
            set("n", json!(1)),
            set("n", json!(2)),
        ];
        let mut doc = Doc::from_ops("d1", ops);
        let state_before = doc.state().cloned();

        doc.distill_to(2);

        assert_eq!(doc.version(), 3);
        assert_eq!(doc.ops().len(), 1);
        assert_eq!(doc.state().cloned(), state_before);
        // Cursor math still works across the distilled boundary.
        assert_eq!(doc.get_ops_to_send(2).len(), 1);
        assert!(doc.get_ops_to_send(3).is_empty());

        doc.refresh_state();
        assert_eq!(doc.state().cloned(), state_before);
    }

    #[test]
    fn test_from_snapshot_idempotent_reapply() {
        // Base state already includes the suffix's effects, as a persisted
        // client snapshot would.
        let pending = set("n", json!(2));
        let base = json!({"_id": "d1", "n": 2});
        let doc = Doc::from_snapshot("d1", Some(base.clone()), 3, vec![pending]);

        assert_eq!(doc.state(), Some(&base));
        assert_eq!(doc.version(), 4);
        assert_eq!(doc.distilled(), 3);
        assert_eq!(doc.get_ops_to_send(3).len(), 1);
    }

    #[test]
    fn test_replace_log() {
        let mut doc = Doc::from_ops("d1", vec![add(json!({"n": 1}))]);
        let other = vec![add(json!({"n": 5})), set("n", json!(6))];
        doc.replace_log(other);
        assert_eq!(doc.get("n"), Some(&json!(6)));
        assert_eq!(doc.version(), 2);
    }
}

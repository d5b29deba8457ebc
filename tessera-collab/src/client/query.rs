//! Client-side live queries.
//!
//! Remote queries are server-authoritative: the subscription's membership is
//! maintained from the server's incremental diffs, and matching docs live as
//! full replicas in the collection. Local queries (over `_`/`$` collections)
//! recompute synchronously on every collection change and never talk to a
//! store.

use serde_json::Value;
use tokio::sync::broadcast;

use tessera_core::{path, Expression, QueryResult};

use super::model::{Model, ModelError};

/// Buffered query change events per subscriber.
const CHANGE_CAPACITY: usize = 64;

/// The model-held state of one query.
pub struct QueryState {
    pub collection_name: String,
    pub expression: Expression,
    pub hash: String,
    pub local: bool,
    subscribed: u32,
    result: QueryResult,
    changes: broadcast::Sender<()>,
}

impl QueryState {
    pub fn new(collection_name: impl Into<String>, expression: Expression) -> Self {
        let collection_name = collection_name.into();
        let hash = expression.hash();
        let result = if expression.is_count() {
            QueryResult::Count(0)
        } else {
            QueryResult::Ids(Vec::new())
        };
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            local: path::is_local_collection(&collection_name),
            collection_name,
            expression,
            hash,
            subscribed: 0,
            result,
            changes,
        }
    }

    pub fn result(&self) -> &QueryResult {
        &self.result
    }

    pub fn ids(&self) -> Vec<String> {
        match &self.result {
            QueryResult::Ids(ids) => ids.clone(),
            QueryResult::Count(_) => Vec::new(),
        }
    }

    /// Recompute from local document states (the local-query path).
    pub fn refresh_from(&mut self, states: &[Value]) -> bool {
        let result = self.expression.evaluate(states.iter());
        let changed = result != self.result;
        self.result = result;
        changed
    }

    /// Apply a server membership diff: removed ids drop out, added ids
    /// append in server order.
    pub fn apply_diff(
        &mut self,
        added: &[String],
        removed: &[String],
        count: Option<u64>,
    ) -> bool {
        let result = match (count, &self.result) {
            (Some(count), _) => QueryResult::Count(count),
            (None, QueryResult::Ids(ids)) => {
                let mut ids: Vec<String> = ids
                    .iter()
                    .filter(|id| !removed.contains(*id))
                    .cloned()
                    .collect();
                for id in added {
                    if !ids.contains(id) {
                        ids.push(id.clone());
                    }
                }
                QueryResult::Ids(ids)
            }
            (None, QueryResult::Count(_)) => self.result.clone(),
        };
        let changed = result != self.result;
        self.result = result;
        changed
    }

    pub fn subscribe_ref(&mut self) -> bool {
        self.subscribed += 1;
        self.subscribed == 1
    }

    pub fn unsubscribe_ref(&mut self) -> bool {
        if self.subscribed == 0 {
            return false;
        }
        self.subscribed -= 1;
        self.subscribed == 0
    }

    pub fn subscribed(&self) -> u32 {
        self.subscribed
    }

    pub fn changes(&self) -> broadcast::Receiver<()> {
        self.changes.subscribe()
    }

    pub fn emit_change(&self) {
        let _ = self.changes.send(());
    }
}

/// A handle to a query on a model.
///
/// Cheap to clone; subscription state lives in the model and is
/// reference-counted, so redundant subscribe/unsubscribe pairs produce no
/// protocol chatter.
#[derive(Clone)]
pub struct ClientQuery {
    pub(crate) model: Model,
    pub collection_name: String,
    pub expression: Value,
    pub hash: String,
    pub local: bool,
}

impl ClientQuery {
    pub(crate) fn new(model: Model, collection_name: impl Into<String>, expression: Value) -> Self {
        let collection_name = collection_name.into();
        let hash = Expression::new(expression.clone()).hash();
        Self {
            local: path::is_local_collection(&collection_name),
            model,
            collection_name,
            expression,
            hash,
        }
    }

    pub async fn subscribe(&self) -> Result<(), ModelError> {
        self.model.subscribe_query(self).await
    }

    pub async fn unsubscribe(&self) -> Result<(), ModelError> {
        self.model.unsubscribe_query(self).await
    }

    /// One-shot refresh from the server without a standing subscription.
    pub async fn fetch(&self) -> Result<(), ModelError> {
        self.model.fetch_query(self).await
    }

    /// Matching document states, in result order.
    pub async fn get(&self) -> Vec<Value> {
        self.model.query_states(self).await
    }

    /// The aggregate for `$count` queries.
    pub async fn count(&self) -> Option<u64> {
        self.model.query_count(self).await
    }

    /// Change notifications for this query's result.
    pub async fn changes(&self) -> broadcast::Receiver<()> {
        self.model.query_changes(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_refresh_from_detects_change() {
        let mut query = QueryState::new("_page", Expression::new(json!({"name": "x"})));

        let states = vec![json!({"_id": "a", "name": "x"})];
        assert!(query.refresh_from(&states));
        assert_eq!(query.ids(), vec!["a".to_string()]);

        // Same input: no change, no notification needed.
        assert!(!query.refresh_from(&states));
    }

    #[test]
    fn test_apply_diff_membership() {
        let mut query = QueryState::new("users", Expression::new(json!({"name": "x"})));

        assert!(query.apply_diff(&["a".into(), "b".into()], &[], None));
        assert_eq!(query.ids(), vec!["a".to_string(), "b".to_string()]);

        assert!(query.apply_diff(&["c".into()], &["a".into()], None));
        assert_eq!(query.ids(), vec!["b".to_string(), "c".to_string()]);

        // Empty diff changes nothing.
        assert!(!query.apply_diff(&[], &[], None));
    }

    #[test]
    fn test_apply_diff_count() {
        let mut query = QueryState::new(
            "users",
            Expression::new(json!({"name": "x", "$count": true})),
        );
        assert!(!query.apply_diff(&[], &[], Some(0)));
        assert!(query.apply_diff(&[], &[], Some(3)));
        assert_eq!(query.result(), &QueryResult::Count(3));
    }

    #[test]
    fn test_reference_counting() {
        let mut query = QueryState::new("users", Expression::new(json!({})));
        assert!(query.subscribe_ref());
        assert!(!query.subscribe_ref());
        assert!(!query.unsubscribe_ref());
        assert!(query.unsubscribe_ref());
    }
}

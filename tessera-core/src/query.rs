//! Query expressions: Mongo-lite filters over materialized document states.
//!
//! An expression is a JSON object. Non-`$` keys are dot-path equality or
//! operator conditions (`$ne`, `$gt`, `$gte`, `$lt`, `$lte`, `$in`); the
//! `$orderby`, `$skip`, `$limit`, and `$count` keys shape the result.
//!
//! Queries are identified by `(collection, expression hash)`; the hash is
//! stable across processes because expressions serialize with sorted keys
//! and the hasher uses fixed keys.

use std::cmp::Ordering;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use serde_json::Value;

use crate::path;

/// A parsed query expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    raw: Value,
}

/// The materialized result of a query.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryResult {
    /// Ids of matching documents, in result order.
    Ids(Vec<String>),
    /// Aggregate count of matching documents.
    Count(u64),
}

impl Expression {
    pub fn new(raw: Value) -> Self {
        Self { raw }
    }

    pub fn raw(&self) -> &Value {
        &self.raw
    }

    /// Stable identity hash of this expression.
    pub fn hash(&self) -> String {
        // serde_json maps serialize with sorted keys, so the canonical string
        // is independent of construction order; DefaultHasher::new() uses
        // fixed keys, so the hash is stable across processes.
        let canonical = self.raw.to_string();
        let mut hasher = DefaultHasher::new();
        canonical.hash(&mut hasher);
        format!("{:016x}", hasher.finish())
    }

    /// Whether this is a `$count` aggregate rather than a docs query.
    pub fn is_count(&self) -> bool {
        self.raw.get("$count").and_then(Value::as_bool).unwrap_or(false)
    }

    /// Whether a document state satisfies the filter conditions.
    pub fn matches(&self, state: &Value) -> bool {
        let Some(conditions) = self.raw.as_object() else {
            return false;
        };
        conditions
            .iter()
            .filter(|(key, _)| !key.starts_with('$'))
            .all(|(field, condition)| match_condition(path::get_path(state, field), condition))
    }

    /// Filter, order, and window a set of document states.
    pub fn matching_states<'a>(&self, states: impl IntoIterator<Item = &'a Value>) -> Vec<&'a Value> {
        let mut matching: Vec<&Value> = states.into_iter().filter(|s| self.matches(s)).collect();

        if let Some(orderby) = self.raw.get("$orderby").and_then(Value::as_object) {
            matching.sort_by(|a, b| {
                for (field, direction) in orderby {
                    let ord = compare_values(path::get_path(a, field), path::get_path(b, field));
                    let ord = if direction.as_i64() == Some(-1) {
                        ord.reverse()
                    } else {
                        ord
                    };
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                Ordering::Equal
            });
        }

        let skip = self.raw.get("$skip").and_then(Value::as_u64).unwrap_or(0) as usize;
        let limit = self
            .raw
            .get("$limit")
            .and_then(Value::as_u64)
            .map(|l| l as usize)
            .unwrap_or(usize::MAX);

        matching.into_iter().skip(skip).take(limit).collect()
    }

    /// Evaluate the full query against a set of document states.
    pub fn evaluate<'a>(&self, states: impl IntoIterator<Item = &'a Value>) -> QueryResult {
        let matching = self.matching_states(states);
        if self.is_count() {
            QueryResult::Count(matching.len() as u64)
        } else {
            QueryResult::Ids(
                matching
                    .iter()
                    .filter_map(|s| s.get("_id").and_then(Value::as_str))
                    .map(String::from)
                    .collect(),
            )
        }
    }
}

fn match_condition(actual: Option<&Value>, condition: &Value) -> bool {
    if let Some(operators) = condition.as_object() {
        if !operators.is_empty() && operators.keys().all(|k| k.starts_with('$')) {
            return operators.iter().all(|(op, operand)| match op.as_str() {
                "$ne" => actual != Some(operand),
                "$gt" => compare_defined(actual, operand) == Some(Ordering::Greater),
                "$gte" => matches!(
                    compare_defined(actual, operand),
                    Some(Ordering::Greater) | Some(Ordering::Equal)
                ),
                "$lt" => compare_defined(actual, operand) == Some(Ordering::Less),
                "$lte" => matches!(
                    compare_defined(actual, operand),
                    Some(Ordering::Less) | Some(Ordering::Equal)
                ),
                "$in" => operand
                    .as_array()
                    .map(|candidates| actual.is_some_and(|a| candidates.contains(a)))
                    .unwrap_or(false),
                // Unknown operators never match.
                _ => false,
            });
        }
    }
    actual == Some(condition)
}

/// Ordering for comparable leaves; incomparable pairs yield `None`.
fn compare_defined(actual: Option<&Value>, operand: &Value) -> Option<Ordering> {
    let actual = actual?;
    match (actual, operand) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// Total ordering for sort purposes: missing values sort first, incomparable
/// types sort by type name to keep the order deterministic.
fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => compare_defined(Some(a), b).unwrap_or_else(|| {
            let rank = |v: &Value| match v {
                Value::Null => 0,
                Value::Bool(_) => 1,
                Value::Number(_) => 2,
                Value::String(_) => 3,
                Value::Array(_) => 4,
                Value::Object(_) => 5,
            };
            rank(a).cmp(&rank(b))
        }),
    }
}

/// Diff two ordered id sets into (added, removed).
pub fn diff_ids(old: &[String], new: &[String]) -> (Vec<String>, Vec<String>) {
    let added = new.iter().filter(|id| !old.contains(id)).cloned().collect();
    let removed = old.iter().filter(|id| !new.contains(id)).cloned().collect();
    (added, removed)
}

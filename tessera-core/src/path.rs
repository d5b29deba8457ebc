//! Dot-delimited field paths over JSON document states.
//!
//! `set` creates intermediate objects as needed; a non-object intermediate is
//! replaced, which keeps replay total under last-writer-wins.

use serde_json::{Map, Value};

/// Split a dot-delimited path into segments.
pub fn parse_path(path: &str) -> Vec<&str> {
    path.split('.').collect()
}

/// Read the value at `path`, if present.
pub fn get_path<'a>(state: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = state;
    for segment in parse_path(path) {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Write `value` at `path`, creating intermediate objects as needed.
///
/// Returns the previous value at the path, if any.
pub fn set_path(state: &mut Value, path: &str, value: Value) -> Option<Value> {
    let segments = parse_path(path);
    let (last, parents) = segments.split_last()?;

    let mut current = state;
    for segment in parents {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        let object = current.as_object_mut().unwrap();
        current = object
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }

    if !current.is_object() {
        *current = Value::Object(Map::new());
    }
    current.as_object_mut().unwrap().insert(last.to_string(), value)
}

/// Remove the value at `path`. Returns the removed value, if any.
pub fn remove_path(state: &mut Value, path: &str) -> Option<Value> {
    let segments = parse_path(path);
    let (last, parents) = segments.split_last()?;

    let mut current = state;
    for segment in parents {
        current = current.as_object_mut()?.get_mut(*segment)?;
    }
    current.as_object_mut()?.remove(*last)
}

/// Collections whose name starts with `_` or `$` are local-only: they are
/// never synchronized with a server.
pub fn is_local_collection(collection_name: &str) -> bool {
    matches!(collection_name.chars().next(), Some('_') | Some('$'))
}

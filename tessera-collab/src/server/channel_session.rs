//! Per-connection cursor table.
//!
//! For every subscribed `(collection, doc)` the session remembers the last
//! version sent over that connection, and for every `(collection, query
//! hash)` the doc-id set last sent. Broadcasts read these cursors to send
//! exactly the missed suffix or the membership diff, never a snapshot.
//!
//! A session lives and dies with its connection; it is never persisted.

use std::collections::HashMap;

/// Cursor state for one connection.
#[derive(Debug, Default)]
pub struct ChannelSession {
    doc_versions: HashMap<(String, String), u64>,
    query_ids: HashMap<(String, String), Vec<String>>,
}

impl ChannelSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// The last version sent for a doc over this connection (0 when the doc
    /// was never sent).
    pub fn get_doc_version(&self, collection_name: &str, doc_id: &str) -> u64 {
        self.doc_versions
            .get(&(collection_name.to_string(), doc_id.to_string()))
            .copied()
            .unwrap_or(0)
    }

    pub fn set_doc_version(&mut self, collection_name: &str, doc_id: &str, version: u64) {
        self.doc_versions
            .insert((collection_name.to_string(), doc_id.to_string()), version);
    }

    /// Register a doc subscription starting at the subscriber's version.
    pub fn subscribe_doc(&mut self, collection_name: &str, doc_id: &str, version: u64) {
        self.set_doc_version(collection_name, doc_id, version);
    }

    pub fn unsubscribe_doc(&mut self, collection_name: &str, doc_id: &str) {
        self.doc_versions
            .remove(&(collection_name.to_string(), doc_id.to_string()));
    }

    /// The doc-id set last sent for a query over this connection.
    pub fn get_query_ids(&self, collection_name: &str, hash: &str) -> Option<&Vec<String>> {
        self.query_ids
            .get(&(collection_name.to_string(), hash.to_string()))
    }

    pub fn set_query_ids(&mut self, collection_name: &str, hash: &str, ids: Vec<String>) {
        self.query_ids
            .insert((collection_name.to_string(), hash.to_string()), ids);
    }

    pub fn unsubscribe_query(&mut self, collection_name: &str, hash: &str) {
        self.query_ids
            .remove(&(collection_name.to_string(), hash.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doc_cursor_defaults_to_zero() {
        let mut session = ChannelSession::new();
        assert_eq!(session.get_doc_version("users", "d1"), 0);

        session.subscribe_doc("users", "d1", 3);
        assert_eq!(session.get_doc_version("users", "d1"), 3);

        session.set_doc_version("users", "d1", 5);
        assert_eq!(session.get_doc_version("users", "d1"), 5);

        session.unsubscribe_doc("users", "d1");
        assert_eq!(session.get_doc_version("users", "d1"), 0);
    }

    #[test]
    fn test_query_ids() {
        let mut session = ChannelSession::new();
        assert!(session.get_query_ids("users", "h1").is_none());

        session.set_query_ids("users", "h1", vec!["a".into(), "b".into()]);
        assert_eq!(
            session.get_query_ids("users", "h1").unwrap(),
            &vec!["a".to_string(), "b".to_string()]
        );

        session.unsubscribe_query("users", "h1");
        assert!(session.get_query_ids("users", "h1").is_none());
    }

    #[test]
    fn test_cursors_keyed_per_collection() {
        let mut session = ChannelSession::new();
        session.set_doc_version("users", "d1", 2);
        session.set_doc_version("posts", "d1", 7);
        assert_eq!(session.get_doc_version("users", "d1"), 2);
        assert_eq!(session.get_doc_version("posts", "d1"), 7);
    }
}

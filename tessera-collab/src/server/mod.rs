//! Server side: document authority, live queries, and protocol dispatch.
//!
//! ```text
//! Channel ──► Store::on_message ──► DocSet ──► ServerDoc ── save ──► Storage
//!                  │                               │ broadcast
//!                  │                               ▼
//!                  └────────► QuerySet ──►  per-channel cursors
//!                                          (ChannelSession)
//! ```

pub mod channel_session;
pub mod doc_set;
pub mod handle;
pub mod projection;
pub mod query;
pub mod query_set;
pub mod server_doc;
pub mod store;

pub use channel_session::ChannelSession;
pub use doc_set::DocSet;
pub use handle::{ClientHandle, HookParams};
pub use projection::Projection;
pub use query::ServerQuery;
pub use query_set::QuerySet;
pub use server_doc::ServerDoc;
pub use store::{AfterHook, CollectionOptions, PreHook, ProjectionOptions, Store, StoreOptions};

//! Client side: optimistic local replicas over one channel.
//!
//! ```text
//! Model ──► Collection ──► RemoteDoc (op log + pending suffix)
//!   │            │
//!   │            └── change feeds (doc / collection / query)
//!   └── one Channel to a Store; acks correlate by op id
//! ```

pub mod collection;
pub mod model;
pub mod query;
pub mod remote_doc;

pub use collection::Collection;
pub use model::{Model, ModelError};
pub use query::{ClientQuery, QueryState};
pub use remote_doc::RemoteDoc;

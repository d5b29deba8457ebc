//! # tessera-core — the pure data layer of the Tessera sync engine
//!
//! No I/O lives here: just the op data model, the document state machine,
//! JSON field-path utilities, and query-expression matching. Both the client
//! and the server sides of `tessera-collab` are built on these types.
//!
//! ```text
//! ┌────────────┐   apply_op    ┌──────────────────┐
//! │ Op (log)   │ ────────────► │ Doc              │
//! │ add/set/del│               │ ops + state      │
//! └────────────┘               │ version() cursor │
//!                              └──────────────────┘
//!         getOpsToSend(v) = contiguous suffix after cursor v
//! ```

pub mod doc;
pub mod op;
pub mod path;
pub mod query;

// Re-exports for convenience
pub use doc::Doc;
pub use op::{Op, OpKind};
pub use query::{Expression, QueryResult};

//! # tessera-collab — real-time multi-client document synchronization
//!
//! Clients hold mutable replicas of server-owned collections, mutate them
//! optimistically, and the server reconciles, persists, and fans changes out
//! to every other subscriber, including subscribers on other server
//! processes via a shared pub/sub bus.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────┐   Channel (pipe / WebSocket)   ┌─────────────────────┐
//! │ Model   │ ◄────────────────────────────► │ Store               │
//! │ (client)│    ops + acks + query diffs    │ DocSet / QuerySet   │
//! └────┬────┘                                └────┬───────────┬────┘
//!      │ optimistic apply                         │ save      │ publish
//!      ▼                                          ▼           ▼
//! ┌─────────┐                               ┌─────────┐  ┌─────────┐
//! │RemoteDoc│                               │ Storage │  │ PubSub  │
//! │ pending │                               │ (shared)│  │  bus    │
//! └─────────┘                               └─────────┘  └────┬────┘
//!                                                             │
//!                                              other Store processes
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire protocol (requests carry `id`, replies `ack_id`)
//! - [`channel`] — bidirectional endpoints; in-process pipe pairing
//! - [`client`] — `Model`, collections, optimistic replicas, live queries
//! - [`server`] — `Store`, document authority, query fan-out, projections
//! - [`storage`] — durable store interface; memory and RocksDB adapters
//! - [`bus`] — cross-process op replication with loop prevention
//! - [`ws`] — WebSocket transport
//!
//! ## Guarantees
//!
//! Per-document ops reach each subscriber in version-cursor order; bandwidth
//! is proportional to missed ops, never document size. Persistence conflicts
//! between processes resolve by reload-and-retry on the `prev_version`
//! token. Delivery across process restarts is at-least-once; convergence is
//! idempotent given the persistent op log and version cursors.

pub mod bus;
pub mod channel;
pub mod client;
pub mod protocol;
pub mod server;
pub mod storage;
pub mod util;
pub mod ws;

// Re-exports for convenience
pub use bus::{MemoryBus, PubSub};
pub use channel::{Channel, ChannelError};
pub use client::{ClientQuery, Collection, Model, ModelError, RemoteDoc};
pub use protocol::{DocSyncData, DocWithOps, Message, ProtocolError, QuerySyncData, SyncData};
pub use server::{
    ChannelSession, ClientHandle, CollectionOptions, DocSet, HookParams, Projection,
    ProjectionOptions, QuerySet, ServerDoc, ServerQuery, Store, StoreOptions,
};
pub use storage::{DocRecord, MemoryStorage, RocksStorage, Storage, StorageConfig, StorageError};
pub use tessera_core::{Doc, Expression, Op, OpKind, QueryResult};

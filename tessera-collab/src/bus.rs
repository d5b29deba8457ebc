//! Cross-process pub/sub bus for committed ops.
//!
//! Every store publishes each locally-committed op to the bus; every other
//! store's subscriber applies it as if a local client had sent it. The
//! publisher is also a subscriber, so the store keeps a short-lived sent-op
//! set to drop its own echoes (loop prevention lives in
//! `server::Store::on_bus_op`).

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::broadcast;

use tessera_core::Op;

/// A publish/subscribe bus carrying committed ops between server processes.
///
/// Delivery is at-least-once to every subscriber with no cross-process total
/// order; convergence relies on idempotent op application plus version
/// cursors, not on the bus.
pub trait PubSub: Send + Sync + 'static {
    /// Publish a committed op. Returns the number of live subscribers.
    fn publish(&self, op: Op) -> usize;

    /// Subscribe to every op published on this bus (including one's own).
    fn subscribe(&self) -> broadcast::Receiver<Op>;
}

/// In-process bus on a tokio broadcast channel.
///
/// Lets multiple stores in one process share a logical document space; a
/// networked bus (e.g. Redis pub/sub) implements the same trait by pumping
/// its wire messages into a local broadcast channel.
pub struct MemoryBus {
    sender: broadcast::Sender<Op>,
    published: AtomicU64,
}

impl MemoryBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            published: AtomicU64::new(0),
        }
    }

    /// Total ops published so far.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl PubSub for MemoryBus {
    fn publish(&self, op: Op) -> usize {
        self.published.fetch_add(1, Ordering::Relaxed);
        self.sender.send(op).unwrap_or(0)
    }

    fn subscribe(&self) -> broadcast::Receiver<Op> {
        self.sender.subscribe()
    }
}

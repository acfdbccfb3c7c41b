//! Per-node critical sections.
//!
//! Admission, modification, cancellation, operator port actions, fault
//! firing and lifecycle transitions for a node all run while holding that
//! node's guard, so two writers can never both pass a capacity check and
//! jointly over-commit, and a port's status is never read mid-mutation.
//! Guards are not reentrant: code running inside one must not call another
//! locking entry point for the same node.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::types::NodeId;

#[derive(Default)]
pub struct NodeLocks {
    locks: DashMap<NodeId, Arc<Mutex<()>>>,
}

impl NodeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` while holding the guard for `node`.
    pub fn with_node<R>(&self, node: &NodeId, f: impl FnOnce() -> R) -> R {
        // Clone the Arc out so the DashMap shard lock is released before blocking.
        let lock = self
            .locks
            .entry(node.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock();
        f()
    }
}

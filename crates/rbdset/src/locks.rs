//! Per-device mutual exclusion
//!
//! Each layer id gets its own mutex, created on first use. Operations on
//! different ids never contend on the same lock.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

/// Lock table keyed by layer id
#[derive(Default)]
pub struct DeviceLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl DeviceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// The lock for `id`, created on demand
    pub fn get(&self, id: &str) -> Arc<Mutex<()>> {
        if let Some(lock) = self.locks.get(id) {
            return Arc::clone(&lock);
        }
        Arc::clone(&self.locks.entry(id.to_string()).or_default())
    }

    /// Locks for two ids in a consistent order, so that callers locking
    /// overlapping pairs cannot deadlock. Returns `None` for the second
    /// lock when both ids are equal.
    pub fn get_pair(&self, a: &str, b: &str) -> (Arc<Mutex<()>>, Option<Arc<Mutex<()>>>) {
        if a == b {
            return (self.get(a), None);
        }
        let (first, second) = if a < b { (a, b) } else { (b, a) };
        (self.get(first), Some(self.get(second)))
    }

    /// Drop the lock entry for `id` when nobody else holds a reference.
    ///
    /// Must be called while holding the lock obtained from [`Self::get`],
    /// which accounts for one of the two expected references.
    pub fn prune(&self, id: &str) {
        self.locks
            .remove_if(id, |_, lock| Arc::strong_count(lock) <= 2);
    }

    /// Ids that currently have a lock entry, including ones still being
    /// created
    pub fn ids(&self) -> Vec<String> {
        self.locks.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Number of lock entries
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Check if there are no lock entries
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

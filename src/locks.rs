//! Keyed mutex table
//!
//! Lock objects are created on demand per key and only dropped by
//! [`KeyedLocks::prune`] once nobody else holds a reference.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Default)]
pub struct KeyedLocks {
    table: DashMap<String, Arc<Mutex<()>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock object for `key`, created if missing.
    ///
    /// Callers keep the returned `Arc` alive for as long as they hold the
    /// guard, which keeps `prune` from discarding it.
    pub fn handle(&self, key: &str) -> Arc<Mutex<()>> {
        if let Some(lock) = self.table.get(key) {
            return lock.clone();
        }
        self.table
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop lock objects that are not referenced outside the table.
    pub fn prune(&self) -> usize {
        let before = self.table.len();
        self.table.retain(|_, lock| Arc::strong_count(lock) > 1);
        before - self.table.len()
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

//! Transaction scoped cache of managed instances.
//!
//! The cache records which instances have state to reconcile with the
//! datastore at the end of the current transaction. Entries keep insertion
//! order so that synchronizations flush deterministically.
//!
//! # Invariants
//!
//! - At most one entry per record id.
//! - `after_completion` leaves the cache empty, whatever the outcome.

use std::collections::HashMap;

use xo_api::RecordId;

/// Record id to instance map, scoped to one transaction.
///
/// Used from the thread owning the session only.
#[derive(Debug)]
pub struct TransactionalCache<V> {
    entries: HashMap<RecordId, V>,
    order: Vec<RecordId>,
}

impl<V: Clone> TransactionalCache<V> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// Register `value` for `id`. An existing entry is kept.
    ///
    /// Returns `true` if the entry was inserted.
    pub fn put(&mut self, id: RecordId, value: V) -> bool {
        if self.entries.contains_key(&id) {
            return false;
        }
        self.order.push(id.clone());
        self.entries.insert(id, value);
        true
    }

    pub fn get(&self, id: &RecordId) -> Option<&V> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: &RecordId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn remove(&mut self, id: &RecordId) -> Option<V> {
        let removed = self.entries.remove(id)?;
        self.order.retain(|entry| entry != id);
        Some(removed)
    }

    /// Snapshot of all cached values in insertion order.
    pub fn values(&self) -> Vec<V> {
        self.order
            .iter()
            .filter_map(|id| self.entries.get(id).cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Reset after the transaction completed.
    ///
    /// Committed entries were flushed already and rolled back ones were
    /// undone by the datastore, so both paths simply clear.
    pub fn after_completion(&mut self, _committed: bool) {
        self.entries.clear();
        self.order.clear();
    }
}

impl<V: Clone> Default for TransactionalCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

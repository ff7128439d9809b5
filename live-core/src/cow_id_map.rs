//! Copy-on-write layer over an [`IdMap`].
//!
//! A [`CowIdMap`] borrows an original snapshot immutably and records only the
//! entries that differ from it. Deletions are recorded as [`Slot::Tombstone`].
//! Many observers can stage changes against the same published snapshot and
//! compute their add/change/remove deltas without copying it.

use std::ops::ControlFlow;

use crate::id_map::{IdKey, IdMap};

/// An entry in the change layer.
#[derive(Debug, Clone, PartialEq)]
pub enum Slot<V> {
    /// The id maps to this value.
    Present(V),
    /// The id is logically absent, whatever the original holds.
    Tombstone,
}

/// One entry of the delta between the original and the layered view.
#[derive(Debug, PartialEq)]
pub enum CowChange<'v, K, V> {
    /// Present in the layer, absent from the original.
    Added {
        /// Document id.
        id: K,
        /// New value.
        value: &'v V,
    },
    /// Present in both.
    Changed {
        /// Document id.
        id: K,
        /// New value.
        value: &'v V,
        /// Value in the original.
        old: &'v V,
    },
    /// Tombstoned in the layer, present in the original.
    Removed {
        /// Document id.
        id: K,
        /// Value in the original.
        old: &'v V,
    },
}

/// A layered view: `changes` on top of a borrowed `original`.
pub struct CowIdMap<'a, K: IdKey, V> {
    original: &'a IdMap<K, V>,
    changes: IdMap<K, Slot<V>>,
}

impl<'a, K: IdKey, V> CowIdMap<'a, K, V> {
    /// Start an empty change layer over `original`.
    pub fn new(original: &'a IdMap<K, V>) -> Self {
        Self {
            original,
            changes: IdMap::new(),
        }
    }

    /// Resolve `id` through the change layer, then the original.
    pub fn get(&self, id: &K) -> Option<&V> {
        match self.changes.get(id) {
            Some(Slot::Present(value)) => Some(value),
            Some(Slot::Tombstone) => None,
            None => self.original.get(id),
        }
    }

    /// Check whether `id` is logically present.
    pub fn has(&self, id: &K) -> bool {
        self.get(id).is_some()
    }

    /// Record a new value for `id`.
    pub fn set(&mut self, id: K, value: V) {
        self.changes.set(id, Slot::Present(value));
    }

    /// Record that `id` is deleted.
    pub fn remove(&mut self, id: K) {
        self.changes.set(id, Slot::Tombstone);
    }

    /// The recorded changes.
    pub fn changes(&self) -> &IdMap<K, Slot<V>> {
        &self.changes
    }

    /// Check whether anything has been recorded.
    pub fn is_unchanged(&self) -> bool {
        self.changes.is_empty()
    }

    /// Visit every logically present entry until the visitor breaks.
    ///
    /// Changed entries are visited first; original entries shadowed by the
    /// change layer are skipped.
    pub fn for_each<F>(&self, mut visit: F)
    where
        F: FnMut(K, &V) -> ControlFlow<()>,
    {
        for (id, slot) in self.changes.iter() {
            if let Slot::Present(value) = slot {
                if visit(id, value).is_break() {
                    return;
                }
            }
        }
        for (id, value) in self.original.iter() {
            if self.changes.has(&id) {
                continue;
            }
            if visit(id, value).is_break() {
                return;
            }
        }
    }

    /// Report the delta between the original and the layered view.
    ///
    /// A tombstone for an id the original never held produces nothing.
    pub fn diff_query_changes<F>(&self, mut emit: F)
    where
        F: FnMut(CowChange<'_, K, V>),
    {
        for (id, slot) in self.changes.iter() {
            let old = self.original.get(&id);
            match (slot, old) {
                (Slot::Present(value), None) => emit(CowChange::Added { id, value }),
                (Slot::Present(value), Some(old)) => emit(CowChange::Changed { id, value, old }),
                (Slot::Tombstone, Some(old)) => emit(CowChange::Removed { id, old }),
                (Slot::Tombstone, None) => {}
            }
        }
    }
}

impl<'a, K: IdKey, V: Clone> CowIdMap<'a, K, V> {
    /// Materialise the layered view as a plain map.
    pub fn flatten(&self) -> IdMap<K, V> {
        let mut flat = self.original.clone();
        for (id, slot) in self.changes.iter() {
            match slot {
                Slot::Present(value) => {
                    flat.set(id, value.clone());
                }
                Slot::Tombstone => {
                    flat.remove(&id);
                }
            }
        }
        flat
    }
}

//! Id-keyed associative container.
//!
//! An [`IdMap`] stores values under a canonical key derived from the id, so
//! ids that are structurally equal but were built separately (two parses of
//! the same object id, say) land on the same entry. The id type decides its
//! own normalisation through [`IdKey`].

use std::collections::hash_map::{self, HashMap};
use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;
use std::ops::ControlFlow;

use live_types::DocId;

/// Normalisation of an id into a hashable canonical key and back.
pub trait IdKey: Clone {
    /// Canonical key type.
    type Key: Hash + Eq + Clone;

    /// Map the id to its canonical key.
    fn id_key(&self) -> Self::Key;

    /// Rebuild an id from a canonical key.
    fn from_id_key(key: &Self::Key) -> Self;
}

impl IdKey for DocId {
    type Key = String;

    fn id_key(&self) -> String {
        self.stringify()
    }

    fn from_id_key(key: &String) -> Self {
        DocId::parse(key)
    }
}

macro_rules! identity_id_key {
    ($($ty:ty),*) => {
        $(
            impl IdKey for $ty {
                type Key = $ty;

                fn id_key(&self) -> $ty {
                    self.clone()
                }

                fn from_id_key(key: &$ty) -> Self {
                    key.clone()
                }
            }
        )*
    };
}

identity_id_key!(String, u32, u64, i64);

/// Unordered map from ids to values.
pub struct IdMap<K: IdKey, V> {
    map: HashMap<K::Key, V>,
    _id: PhantomData<fn() -> K>,
}

impl<K: IdKey, V> IdMap<K, V> {
    /// Create an empty map.
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
            _id: PhantomData,
        }
    }

    /// Look up a value.
    pub fn get(&self, id: &K) -> Option<&V> {
        self.map.get(&id.id_key())
    }

    /// Look up a value for mutation.
    pub fn get_mut(&mut self, id: &K) -> Option<&mut V> {
        self.map.get_mut(&id.id_key())
    }

    /// Insert or replace a value, returning the previous one.
    pub fn set(&mut self, id: K, value: V) -> Option<V> {
        self.map.insert(id.id_key(), value)
    }

    /// Remove a value, returning it.
    pub fn remove(&mut self, id: &K) -> Option<V> {
        self.map.remove(&id.id_key())
    }

    /// Check whether an id is present.
    pub fn has(&self, id: &K) -> bool {
        self.map.contains_key(&id.id_key())
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Check if the map is empty.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Remove every entry.
    pub fn clear(&mut self) {
        self.map.clear();
    }

    /// Return the value for `id`, inserting `default` first if absent.
    pub fn set_default(&mut self, id: K, default: V) -> &mut V {
        self.map.entry(id.id_key()).or_insert(default)
    }

    /// Visit every entry until the visitor breaks.
    ///
    /// Iteration order is unspecified.
    pub fn for_each<F>(&self, mut visit: F)
    where
        F: FnMut(K, &V) -> ControlFlow<()>,
    {
        for (key, value) in &self.map {
            if visit(K::from_id_key(key), value).is_break() {
                return;
            }
        }
    }

    /// Iterate over `(id, value)` pairs in unspecified order.
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            inner: self.map.iter(),
            _id: PhantomData,
        }
    }

    /// All ids in unspecified order.
    pub fn ids(&self) -> Vec<K> {
        self.map.keys().map(K::from_id_key).collect()
    }
}

/// Iterator returned by [`IdMap::iter`].
pub struct Iter<'a, K: IdKey, V> {
    inner: hash_map::Iter<'a, K::Key, V>,
    _id: PhantomData<fn() -> K>,
}

impl<'a, K: IdKey, V> Iterator for Iter<'a, K, V> {
    type Item = (K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        self.inner
            .next()
            .map(|(key, value)| (K::from_id_key(key), value))
    }
}

impl<K: IdKey, V> Default for IdMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Deep clone: every value is cloned independently.
impl<K: IdKey, V: Clone> Clone for IdMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            map: self.map.clone(),
            _id: PhantomData,
        }
    }
}

impl<K: IdKey, V: PartialEq> PartialEq for IdMap<K, V> {
    fn eq(&self, other: &Self) -> bool {
        self.map == other.map
    }
}

impl<K: IdKey + fmt::Debug, V: fmt::Debug> fmt::Debug for IdMap<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl<K: IdKey, V> FromIterator<(K, V)> for IdMap<K, V> {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = Self::new();
        for (id, value) in iter {
            map.set(id, value);
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use live_types::ObjectId;

    #[test]
    fn basic_map_operations() {
        let mut map: IdMap<DocId, i32> = IdMap::new();
        assert!(map.is_empty());

        map.set("a".into(), 1);
        map.set("b".into(), 2);
        assert_eq!(map.len(), 2);
        assert_eq!(map.get(&"a".into()), Some(&1));
        assert!(map.has(&"b".into()));

        assert_eq!(map.set("a".into(), 10), Some(1));
        assert_eq!(map.remove(&"b".into()), Some(2));
        assert!(!map.has(&"b".into()));
        assert_eq!(map.remove(&"b".into()), None);

        map.clear();
        assert!(map.is_empty());
    }

    #[test]
    fn structurally_equal_ids_share_an_entry() {
        let hex = "5f2b6d1e9a3c4b7d8e0f1a2b";
        let first = DocId::ObjectId(hex.parse::<ObjectId>().unwrap());
        let second = DocId::ObjectId(hex.parse::<ObjectId>().unwrap());

        let mut map = IdMap::new();
        map.set(first, "one");
        map.set(second.clone(), "two");

        assert_eq!(map.len(), 1);
        assert_eq!(map.get(&second), Some(&"two"));
    }

    #[test]
    fn string_and_number_ids_do_not_collide() {
        let mut map = IdMap::new();
        map.set(DocId::Num(1), "num");
        map.set(DocId::from("~1"), "str");
        map.set(DocId::from("1"), "plain");
        assert_eq!(map.len(), 3);
    }

    #[test]
    fn for_each_stops_on_break() {
        let map: IdMap<u64, u64> = (0..10).map(|i| (i, i)).collect();
        let mut visited = 0;
        map.for_each(|_, _| {
            visited += 1;
            if visited == 3 {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        });
        assert_eq!(visited, 3);
    }

    #[test]
    fn for_each_yields_parsed_ids() {
        let mut map = IdMap::new();
        map.set(DocId::Num(7), ());
        let mut seen = Vec::new();
        map.for_each(|id, _| {
            seen.push(id);
            ControlFlow::Continue(())
        });
        assert_eq!(seen, vec![DocId::Num(7)]);
    }

    #[test]
    fn set_default_inserts_once() {
        let mut map: IdMap<String, Vec<i32>> = IdMap::new();
        map.set_default("k".into(), Vec::new()).push(1);
        map.set_default("k".into(), vec![99]).push(2);
        assert_eq!(map.get(&"k".into()), Some(&vec![1, 2]));
    }

    #[test]
    fn clone_is_deep() {
        let mut original: IdMap<String, Vec<i32>> = IdMap::new();
        original.set("k".into(), vec![1]);

        let mut copy = original.clone();
        copy.get_mut(&"k".into()).unwrap().push(2);

        assert_eq!(original.get(&"k".into()), Some(&vec![1]));
        assert_eq!(copy.get(&"k".into()), Some(&vec![1, 2]));
    }
}

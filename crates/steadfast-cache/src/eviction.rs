//! Eviction policies.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::num::NonZeroUsize;

/// Which entry to drop when the cache is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EvictionPolicy {
    /// First in, first out: the oldest insertion goes, regardless of use.
    /// The default for fingerprint caches, where age tracks staleness.
    #[default]
    Fifo,
    /// Least recently used.
    Lru,
}

/// Storage with a pluggable eviction policy.
pub(crate) trait EvictionStore<K, V>: Send {
    fn get(&mut self, key: &K) -> Option<&V>;

    /// Insert, returning the evicted entry when the store was full and the
    /// key was new.
    fn insert(&mut self, key: K, value: V) -> Option<(K, V)>;

    fn remove(&mut self, key: &K) -> Option<V>;

    fn len(&self) -> usize;

    fn clear(&mut self);

    /// Clone out every live entry, oldest first.
    fn dump(&self) -> Vec<(K, V)>;
}

/// FIFO storage: a map plus an insertion-order deque.
pub(crate) struct FifoStore<K, V> {
    data: HashMap<K, V>,
    order: VecDeque<K>,
    capacity: usize,
}

impl<K: Hash + Eq + Clone, V> FifoStore<K, V> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            data: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }
}

impl<K: Hash + Eq + Clone + Send, V: Clone + Send> EvictionStore<K, V> for FifoStore<K, V> {
    fn get(&mut self, key: &K) -> Option<&V> {
        self.data.get(key)
    }

    fn insert(&mut self, key: K, value: V) -> Option<(K, V)> {
        // Updating an existing key keeps its position in the order.
        if self.data.contains_key(&key) {
            let old = self.data.insert(key.clone(), value)?;
            return Some((key, old));
        }

        let evicted = if self.data.len() >= self.capacity {
            self.order.pop_front().and_then(|oldest| {
                let value = self.data.remove(&oldest)?;
                Some((oldest, value))
            })
        } else {
            None
        };

        self.data.insert(key.clone(), value);
        self.order.push_back(key);
        evicted
    }

    fn remove(&mut self, key: &K) -> Option<V> {
        self.order.retain(|k| k != key);
        self.data.remove(key)
    }

    fn len(&self) -> usize {
        self.data.len()
    }

    fn clear(&mut self) {
        self.data.clear();
        self.order.clear();
    }

    fn dump(&self) -> Vec<(K, V)> {
        self.order
            .iter()
            .filter_map(|k| self.data.get(k).map(|v| (k.clone(), v.clone())))
            .collect()
    }
}

/// LRU storage backed by the `lru` crate.
pub(crate) struct LruStore<K: Hash + Eq, V> {
    cache: lru::LruCache<K, V>,
}

impl<K: Hash + Eq, V> LruStore<K, V> {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is at least 1");
        Self {
            cache: lru::LruCache::new(capacity),
        }
    }
}

impl<K: Hash + Eq + Clone + Send, V: Clone + Send> EvictionStore<K, V> for LruStore<K, V> {
    fn get(&mut self, key: &K) -> Option<&V> {
        self.cache.get(key)
    }

    fn insert(&mut self, key: K, value: V) -> Option<(K, V)> {
        self.cache.push(key, value)
    }

    fn remove(&mut self, key: &K) -> Option<V> {
        self.cache.pop(key)
    }

    fn len(&self) -> usize {
        self.cache.len()
    }

    fn clear(&mut self) {
        self.cache.clear();
    }

    fn dump(&self) -> Vec<(K, V)> {
        // LruCache iterates most-recent first; reverse for oldest-first.
        let mut entries: Vec<(K, V)> = self
            .cache
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        entries.reverse();
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_evicts_oldest_insertion() {
        let mut store = FifoStore::new(2);
        store.insert("a", 1);
        store.insert("b", 2);

        // Touching "a" does not save it from FIFO eviction.
        store.get(&"a");
        let evicted = store.insert("c", 3);
        assert_eq!(evicted, Some(("a", 1)));
        assert_eq!(store.get(&"b"), Some(&2));
        assert_eq!(store.get(&"c"), Some(&3));
    }

    #[test]
    fn fifo_update_keeps_position() {
        let mut store = FifoStore::new(2);
        store.insert("a", 1);
        store.insert("b", 2);
        store.insert("a", 10);

        let evicted = store.insert("c", 3);
        assert_eq!(evicted.map(|(k, _)| k), Some("a"));
    }

    #[test]
    fn lru_evicts_least_recently_used() {
        let mut store = LruStore::new(2);
        store.insert("a", 1);
        store.insert("b", 2);
        store.get(&"a");

        let evicted = store.insert("c", 3);
        assert_eq!(evicted, Some(("b", 2)));
        assert_eq!(store.get(&"a"), Some(&1));
    }

    #[test]
    fn dump_is_oldest_first() {
        let mut store = FifoStore::new(3);
        store.insert("a", 1);
        store.insert("b", 2);
        store.insert("c", 3);
        let keys: Vec<_> = store.dump().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
    }

    #[test]
    fn capacity_is_never_exceeded() {
        let mut store = FifoStore::new(3);
        for i in 0..20 {
            store.insert(i, i);
            assert!(store.len() <= 3);
        }
    }
}

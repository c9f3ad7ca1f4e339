//! Fixed-capacity LRU cache with O(1) operations.
//!
//! Entries live in a `Vec` slab linked into a doubly linked recency list by
//! index; a `HashMap` maps keys to slab slots. Removal uses `swap_remove` and
//! relinks the moved node, so the slab never holds more than `capacity`
//! entries and no stale values linger after eviction.
//!
//! All state sits behind one mutex, so every call (including the
//! read-modify-write of [`BoundedCache::insert_if_absent`]) is atomic with
//! respect to other callers.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("cache capacity must be greater than zero")]
    ZeroCapacity,
}

/// Hit, miss and eviction counters since construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub len: usize,
    pub capacity: usize,
}

/// Outcome of [`BoundedCache::admit`].
#[derive(Debug, PartialEq, Eq)]
pub enum Admission<K, V> {
    Present,
    Inserted { evicted: Option<(K, V)> },
}

const NIL: usize = usize::MAX;

#[derive(Debug)]
struct Node<K, V> {
    key: K,
    value: V,
    prev: usize,
    next: usize,
}

#[derive(Debug)]
struct Lru<K, V> {
    map: HashMap<K, usize>,
    nodes: Vec<Node<K, V>>,
    /// Most recently used.
    head: usize,
    /// Least recently used.
    tail: usize,
    capacity: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl<K: Hash + Eq + Clone, V> Lru<K, V> {
    fn new(capacity: usize) -> Self {
        Self {
            map: HashMap::with_capacity(capacity),
            nodes: Vec::with_capacity(capacity),
            head: NIL,
            tail: NIL,
            capacity,
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = (self.nodes[idx].prev, self.nodes[idx].next);
        if prev == NIL {
            self.head = next;
        } else {
            self.nodes[prev].next = next;
        }
        if next == NIL {
            self.tail = prev;
        } else {
            self.nodes[next].prev = prev;
        }
        self.nodes[idx].prev = NIL;
        self.nodes[idx].next = NIL;
    }

    fn push_front(&mut self, idx: usize) {
        self.nodes[idx].prev = NIL;
        self.nodes[idx].next = self.head;
        if self.head != NIL {
            self.nodes[self.head].prev = idx;
        }
        self.head = idx;
        if self.tail == NIL {
            self.tail = idx;
        }
    }

    fn touch(&mut self, idx: usize) {
        if self.head != idx {
            self.unlink(idx);
            self.push_front(idx);
        }
    }

    fn remove_at(&mut self, idx: usize) -> (K, V) {
        self.unlink(idx);
        let last = self.nodes.len() - 1;
        if idx != last {
            // The last slot moves into `idx`; point its neighbours at the new slot.
            let (prev, next) = (self.nodes[last].prev, self.nodes[last].next);
            if prev == NIL {
                self.head = idx;
            } else {
                self.nodes[prev].next = idx;
            }
            if next == NIL {
                self.tail = idx;
            } else {
                self.nodes[next].prev = idx;
            }
        }
        let node = self.nodes.swap_remove(idx);
        self.map.remove(&node.key);
        if idx != last {
            if let Some(slot) = self.map.get_mut(&self.nodes[idx].key) {
                *slot = idx;
            }
        }
        (node.key, node.value)
    }

    fn put(&mut self, key: K, value: V) -> Option<(K, V)> {
        if let Some(&idx) = self.map.get(&key) {
            self.nodes[idx].value = value;
            self.touch(idx);
            return None;
        }

        let evicted = if self.nodes.len() >= self.capacity {
            self.evictions += 1;
            Some(self.remove_at(self.tail))
        } else {
            None
        };

        let idx = self.nodes.len();
        self.nodes.push(Node {
            key: key.clone(),
            value,
            prev: NIL,
            next: NIL,
        });
        self.map.insert(key, idx);
        self.push_front(idx);
        evicted
    }

    fn get(&mut self, key: &K) -> Option<&V> {
        if let Some(&idx) = self.map.get(key) {
            self.hits += 1;
            self.touch(idx);
            Some(&self.nodes[idx].value)
        } else {
            self.misses += 1;
            None
        }
    }
}

/// Concurrency-safe LRU cache shared by reference across tasks.
#[derive(Debug)]
pub struct BoundedCache<K, V> {
    inner: Mutex<Lru<K, V>>,
}

impl<K: Hash + Eq + Clone, V> BoundedCache<K, V> {
    pub fn new(capacity: usize) -> Result<Self, CacheError> {
        if capacity == 0 {
            return Err(CacheError::ZeroCapacity);
        }
        Ok(Self {
            inner: Mutex::new(Lru::new(capacity)),
        })
    }

    /// Insert or update `key`, marking it most recently used.
    ///
    /// Returns the entry evicted to make room, if any.
    pub fn put(&self, key: K, value: V) -> Option<(K, V)> {
        self.inner.lock().put(key, value)
    }

    /// Insert only when `key` is absent, as one atomic step.
    ///
    /// A present key is only marked most recently used; its value is kept.
    pub fn admit(&self, key: K, value: V) -> Admission<K, V> {
        let mut lru = self.inner.lock();
        if let Some(&idx) = lru.map.get(&key) {
            lru.hits += 1;
            lru.touch(idx);
            return Admission::Present;
        }
        lru.misses += 1;
        Admission::Inserted {
            evicted: lru.put(key, value),
        }
    }

    /// Like [`admit`](Self::admit); returns `false` when the key was already present.
    pub fn insert_if_absent(&self, key: K, value: V) -> bool {
        matches!(self.admit(key, value), Admission::Inserted { .. })
    }

    pub fn contains(&self, key: &K) -> bool {
        self.inner.lock().map.contains_key(key)
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        let mut lru = self.inner.lock();
        let idx = lru.map.get(key).copied()?;
        Some(lru.remove_at(idx).1)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity
    }

    pub fn clear(&self) {
        let mut lru = self.inner.lock();
        lru.map.clear();
        lru.nodes.clear();
        lru.head = NIL;
        lru.tail = NIL;
    }

    pub fn stats(&self) -> CacheStats {
        let lru = self.inner.lock();
        CacheStats {
            hits: lru.hits,
            misses: lru.misses,
            evictions: lru.evictions,
            len: lru.nodes.len(),
            capacity: lru.capacity,
        }
    }
}

impl<K: Hash + Eq + Clone, V: Clone> BoundedCache<K, V> {
    /// Look up `key`, marking it most recently used on a hit.
    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.lock().get(key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn zero_capacity_is_rejected() {
        assert_eq!(
            BoundedCache::<u32, u32>::new(0).unwrap_err(),
            CacheError::ZeroCapacity
        );
    }

    #[test]
    fn size_never_exceeds_capacity() {
        let cache = BoundedCache::new(3).unwrap();
        for i in 0..50 {
            cache.put(i % 7, i);
            assert!(cache.len() <= 3);
        }
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn evicts_least_recently_used_first() {
        let cache = BoundedCache::new(3).unwrap();
        cache.put("a", 1);
        cache.put("b", 2);
        cache.put("c", 3);
        let evicted = cache.put("d", 4);
        assert_eq!(evicted, Some(("a", 1)));
        assert_eq!(cache.get(&"a"), None);
        assert_eq!(cache.get(&"d"), Some(4));
    }

    #[test]
    fn get_refreshes_recency() {
        let cache = BoundedCache::new(3).unwrap();
        cache.put(1, "one");
        cache.put(2, "two");
        cache.put(3, "three");

        assert_eq!(cache.get(&1), Some("one"));
        cache.put(4, "four");
        cache.put(5, "five");

        // 1 was touched before 4 and 5 arrived, so 2 and 3 go first.
        assert_eq!(cache.get(&1), Some("one"));
        assert_eq!(cache.get(&2), None);
        assert_eq!(cache.get(&3), None);
        cache.put(6, "six");
        cache.put(7, "seven");
        cache.put(8, "eight");
        assert_eq!(cache.get(&1), None);
    }

    #[test]
    fn update_refreshes_recency_without_growing() {
        let cache = BoundedCache::new(2).unwrap();
        cache.put("a", 1);
        cache.put("b", 2);
        assert_eq!(cache.put("a", 10), None);
        cache.put("c", 3);
        assert_eq!(cache.get(&"a"), Some(10));
        assert_eq!(cache.get(&"b"), None);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn remove_keeps_links_consistent() {
        let cache = BoundedCache::new(4).unwrap();
        for i in 0..4 {
            cache.put(i, i * 10);
        }
        assert_eq!(cache.remove(&1), Some(10));
        assert_eq!(cache.remove(&1), None);
        cache.put(4, 40);
        cache.put(5, 50);
        // 0 was the oldest remaining entry.
        assert!(!cache.contains(&0));
        for key in [2, 3, 4, 5] {
            assert!(cache.contains(&key), "missing {key}");
        }
    }

    #[test]
    fn capacity_one_replaces_entry() {
        let cache = BoundedCache::new(1).unwrap();
        cache.put("x", 1);
        cache.put("y", 2);
        assert_eq!(cache.get(&"x"), None);
        assert_eq!(cache.get(&"y"), Some(2));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn insert_if_absent_detects_duplicates() {
        let cache = BoundedCache::new(2).unwrap();
        assert!(cache.insert_if_absent("req-1", ()));
        assert!(!cache.insert_if_absent("req-1", ()));
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.len, 1);
    }

    #[test]
    fn admit_reports_eviction() {
        let cache = BoundedCache::new(1).unwrap();
        assert_eq!(cache.admit("a", 1), Admission::Inserted { evicted: None });
        assert_eq!(cache.admit("a", 2), Admission::Present);
        assert_eq!(cache.get(&"a"), Some(1));
        assert_eq!(
            cache.admit("b", 3),
            Admission::Inserted {
                evicted: Some(("a", 1))
            }
        );
    }

    #[test]
    fn clear_empties_cache() {
        let cache = BoundedCache::new(2).unwrap();
        cache.put(1, 1);
        cache.clear();
        assert!(cache.is_empty());
        cache.put(2, 2);
        cache.put(3, 3);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn concurrent_inserts_stay_bounded() {
        let cache = Arc::new(BoundedCache::new(64).unwrap());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for i in 0..1000 {
                        cache.put(t * 1000 + i, i);
                        let _ = cache.get(&(t * 1000 + i / 2));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(cache.len(), 64);

        let claimed: usize = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || usize::from(cache.insert_if_absent(-1, 0)))
            })
            .map(|h| h.join().unwrap())
            .sum();
        assert_eq!(claimed, 1);
    }
}

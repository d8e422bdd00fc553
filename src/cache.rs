//! # Memo Cache
//!
//! Bounded, least-recently-used memoization for values that are cheap to
//! key but wasteful to rebuild: marker icon assets and road-snapped
//! polylines. Instances are owned by whoever needs them and passed in
//! explicitly; nothing here is global.

use std::fmt;
use std::hash::Hash;
use std::num::NonZeroUsize;

use lru::LruCache;

/// An [`LruCache`] that also counts hits and misses.
pub struct MemoCache<K, V> {
    inner: LruCache<K, V>,
    hits: u64,
    misses: u64,
}

/// Hit/miss counters for a cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

impl<K: Eq + Hash, V: Clone> MemoCache<K, V> {
    /// Create a cache holding at most `capacity` entries (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: LruCache::new(capacity),
            hits: 0,
            misses: 0,
        }
    }

    /// Look up a value, marking it as recently used.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        match self.inner.get(key) {
            Some(value) => {
                self.hits += 1;
                Some(value)
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Peek at a value without touching recency or counters.
    pub fn peek(&self, key: &K) -> Option<&V> {
        self.inner.peek(key)
    }

    /// Return the cached value for `key`, building and storing it on a miss.
    pub fn get_or_insert_with<F>(&mut self, key: K, build: F) -> V
    where
        F: FnOnce() -> V,
    {
        if let Some(value) = self.inner.get(&key) {
            self.hits += 1;
            return value.clone();
        }
        self.misses += 1;
        let value = build();
        self.inner.put(key, value.clone());
        value
    }

    /// Store a value, replacing any previous one for the same key.
    pub fn insert(&mut self, key: K, value: V) {
        self.inner.put(key, value);
    }

    /// Drop one key.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.inner.pop(key)
    }

    /// Drop everything, keeping the counters.
    pub fn clear(&mut self) {
        self.inner.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.inner.contains(key)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.inner.len(),
            hits: self.hits,
            misses: self.misses,
        }
    }
}

impl<K: Eq + Hash, V> fmt::Debug for MemoCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoCache")
            .field("capacity", &self.inner.cap())
            .field("entries", &self.inner.len())
            .field("hits", &self.hits)
            .field("misses", &self.misses)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_or_insert_with_builds_once() {
        let mut cache: MemoCache<&str, String> = MemoCache::new(4);
        let mut builds = 0;

        for _ in 0..3 {
            let v = cache.get_or_insert_with("icon", || {
                builds += 1;
                "<svg/>".to_string()
            });
            assert_eq!(v, "<svg/>");
        }

        assert_eq!(builds, 1);
        let stats = cache.stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let mut cache: MemoCache<u32, u32> = MemoCache::new(3);
        cache.insert(1, 10);
        cache.insert(2, 20);
        cache.insert(3, 30);

        // Touch 1 so 2 becomes the stalest
        assert_eq!(cache.get(&1), Some(&10));
        cache.insert(4, 40);

        assert!(cache.contains(&1));
        assert!(!cache.contains(&2));
        assert!(cache.contains(&3));
        assert!(cache.contains(&4));
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn test_insert_replaces_and_remove() {
        let mut cache: MemoCache<String, i32> = MemoCache::new(2);
        cache.insert("a".to_string(), 1);
        cache.insert("a".to_string(), 2);
        assert_eq!(cache.peek(&"a".to_string()), Some(&2));
        assert_eq!(cache.len(), 1);

        assert_eq!(cache.remove(&"a".to_string()), Some(2));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let mut cache: MemoCache<u8, u8> = MemoCache::new(0);
        cache.insert(1, 1);
        cache.insert(2, 2);
        assert_eq!(cache.len(), 1);
        assert!(cache.contains(&2));
    }
}

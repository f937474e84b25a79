//! Bounded hot cache of partition bitmaps.
//!
//! Capacity-limited LRU keyed by the canonical fast-store key. Inserting at
//! capacity surfaces the evicted entry to the caller, which must persist it
//! first if it is dirty; the cache itself never drops data silently.

use std::{num::NonZeroUsize, sync::Arc};

use lru::LruCache;
use parking_lot::{Mutex, RwLock};

use crate::bitset::TimeSet;

pub type CachedSet = Arc<RwLock<TimeSet>>;

pub struct BitsetCache {
    inner: Mutex<LruCache<String, CachedSet>>,
}

impl BitsetCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity clamped to at least 1");
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get(&self, key: &str) -> Option<CachedSet> {
        self.inner.lock().get(key).cloned()
    }

    /// Inserts `value`, returning the entry evicted to make room, if any.
    /// Replacing an existing entry under the same key is not an eviction.
    pub fn put(&self, key: &str, value: CachedSet) -> Option<(String, CachedSet)> {
        let evicted = self.inner.lock().push(key.to_string(), value);
        evicted.filter(|(old_key, _)| old_key != key)
    }

    pub fn remove(&self, key: &str) -> Option<CachedSet> {
        self.inner.lock().pop(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.lock().contains(key)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().len() == 0
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    /// Keys currently cached under `prefix`. Does not touch recency.
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.inner
            .lock()
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Approximate retained bytes across all cached bitmaps.
    pub fn memory_usage(&self) -> u64 {
        self.inner
            .lock()
            .iter()
            .map(|(_, set)| set.read().size_in_bytes() as u64)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(values: &[u32]) -> CachedSet {
        Arc::new(RwLock::new(values.iter().copied().collect()))
    }

    #[test]
    fn capacity_is_never_exceeded() {
        let cache = BitsetCache::new(2);
        assert!(cache.put("a", entry(&[1])).is_none());
        assert!(cache.put("b", entry(&[2])).is_none());

        let evicted = cache.put("c", entry(&[3])).expect("oldest entry evicted");
        assert_eq!(evicted.0, "a");
        assert_eq!(cache.len(), 2);
        assert!(!cache.contains("a"));
        assert!(cache.contains("b"));
        assert!(cache.contains("c"));
    }

    #[test]
    fn replacing_same_key_is_not_an_eviction() {
        let cache = BitsetCache::new(1);
        cache.put("a", entry(&[1]));
        assert!(cache.put("a", entry(&[2])).is_none());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn evicted_entry_retains_its_contents() {
        let cache = BitsetCache::new(1);
        cache.put("a", entry(&[19723]));
        let (key, set) = cache.put("b", entry(&[2])).unwrap();
        assert_eq!(key, "a");
        assert!(set.read().contains(19723));
    }

    #[test]
    fn prefix_listing_matches_whole_prefix() {
        let cache = BitsetCache::new(8);
        cache.put("e4s:index:m:day:1:0", entry(&[1]));
        cache.put("e4s:index:m:day:1:1", entry(&[181]));
        cache.put("e4s:index:m:month:1:0", entry(&[1]));
        cache.put("e4s:index:other:day:1:0", entry(&[1]));

        let mut keys = cache.keys_with_prefix("e4s:index:m:day:1:");
        keys.sort();
        assert_eq!(keys, vec!["e4s:index:m:day:1:0", "e4s:index:m:day:1:1"]);
        assert_eq!(cache.keys_with_prefix("e4s:index:m:").len(), 3);
    }

    #[test]
    fn remove_and_clear() {
        let cache = BitsetCache::new(4);
        cache.put("a", entry(&[1]));
        assert!(cache.remove("a").is_some());
        assert!(cache.remove("a").is_none());

        cache.put("b", entry(&[2]));
        cache.clear();
        assert!(cache.is_empty());
    }
}

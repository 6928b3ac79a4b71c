//! Bounded content-hash cache for embeddings
//!
//! Keys are `xxh3_64` hashes of preprocessed text. Values are shared
//! `Arc<[f32]>` so callers hold references, not copies. When full, the oldest
//! inserted entries are evicted in one batch (FIFO, not LRU).

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use xxhash_rust::xxh3::xxh3_64;

/// Default maximum number of cached embeddings
pub const DEFAULT_CACHE_CAPACITY: usize = 10_000;

/// Entries dropped at once when the cache is full
pub const EVICTION_BATCH: usize = 100;

/// Cache key of a preprocessed text
pub fn content_key(text: &str) -> u64 {
    xxh3_64(text.as_bytes())
}

/// Snapshot of cache counters
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub size: usize,
    pub capacity: usize,
}

/// Lookups take `&self` (counters are atomic) so readers can share a read lock
#[derive(Debug)]
pub struct EmbeddingCache {
    entries: HashMap<u64, Arc<[f32]>>,
    /// Insertion order, oldest first
    order: VecDeque<u64>,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Default for EmbeddingCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

impl EmbeddingCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: HashMap::with_capacity(capacity.min(DEFAULT_CACHE_CAPACITY)),
            order: VecDeque::new(),
            capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: u64) -> Option<Arc<[f32]>> {
        match self.entries.get(&key) {
            Some(v) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(Arc::clone(v))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert, evicting the oldest batch first when full; an existing key keeps its vector
    pub fn insert(&mut self, key: u64, vector: Arc<[f32]>) -> Arc<[f32]> {
        if let Some(existing) = self.entries.get(&key) {
            return Arc::clone(existing);
        }

        if self.entries.len() >= self.capacity {
            let evict = EVICTION_BATCH.min(self.order.len());
            for old in self.order.drain(..evict) {
                self.entries.remove(&old);
            }
        }

        self.order.push_back(key);
        self.entries.insert(key, Arc::clone(&vector));
        vector
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            hits,
            misses,
            hit_rate: if total == 0 { 0.0 } else { hits as f64 / total as f64 },
            size: self.entries.len(),
            capacity: self.capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vector(x: f32) -> Arc<[f32]> {
        Arc::from(vec![x, x])
    }

    #[test]
    fn test_cache_basic() {
        let mut cache = EmbeddingCache::new(10);
        let key = content_key("hello");
        assert!(cache.get(key).is_none());
        cache.insert(key, vector(1.0));
        assert_eq!(&*cache.get(key).unwrap(), &[1.0, 1.0]);
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.size), (1, 1, 1));
        assert!((stats.hit_rate - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_returns_shared_reference() {
        let mut cache = EmbeddingCache::new(10);
        let stored = cache.insert(7, vector(2.0));
        let fetched = cache.get(7).unwrap();
        assert!(Arc::ptr_eq(&stored, &fetched));
    }

    #[test]
    fn test_existing_key_kept() {
        let mut cache = EmbeddingCache::new(10);
        cache.insert(1, vector(1.0));
        let kept = cache.insert(1, vector(9.0));
        assert_eq!(&*kept, &[1.0, 1.0]);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_eviction_drops_oldest_batch() {
        let mut cache = EmbeddingCache::new(250);
        for k in 0..250u64 {
            cache.insert(k, vector(k as f32));
        }
        assert_eq!(cache.len(), 250);
        cache.insert(1000, vector(0.0));
        // Oldest 100 gone, newest kept
        assert_eq!(cache.len(), 151);
        assert!(cache.get(0).is_none());
        assert!(cache.get(99).is_none());
        assert!(cache.get(100).is_some());
        assert!(cache.get(1000).is_some());
    }

    #[test]
    fn test_small_capacity_evicts_everything_old() {
        let mut cache = EmbeddingCache::new(2);
        cache.insert(1, vector(1.0));
        cache.insert(2, vector(2.0));
        cache.insert(3, vector(3.0));
        assert_eq!(cache.len(), 1);
        assert!(cache.get(3).is_some());
    }
}

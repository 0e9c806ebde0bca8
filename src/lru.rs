//! Generic bounded LRU-with-TTL cache shared by the ACL decision cache
//! and the schema-by-id cache.
//!
//! Grounded on `rust-core/src/memory/hot_cache.rs`'s `HotDataCache`
//! (TTL expiry, atomic hit/miss counters, capacity-triggered eviction)
//! adapted from byte-keyed values to a generic `K, V` map using a
//! recency queue (a `VecDeque` of keys re-pushed on touch, same
//! eviction shape as `HotDataCache::evict_lru`).

use std::collections::HashMap;
use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

struct Entry<V> {
    value: V,
    inserted_at: Instant,
}

struct Inner<K, V> {
    map: HashMap<K, Entry<V>>,
    order: VecDeque<K>,
}

/// A bounded cache evicting least-recently-touched entries once
/// `capacity` is exceeded, and treating entries older than `ttl` as
/// absent without requiring an explicit sweep.
pub struct LruCache<K, V> {
    inner: Mutex<Inner<K, V>>,
    capacity: usize,
    ttl: Option<Duration>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<K: Eq + Hash + Clone, V: Clone> LruCache<K, V> {
    pub fn new(capacity: usize, ttl: Option<Duration>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                map: HashMap::new(),
                order: VecDeque::new(),
            }),
            capacity: capacity.max(1),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock();
        let expired = match inner.map.get(key) {
            Some(entry) => self
                .ttl
                .is_some_and(|ttl| entry.inserted_at.elapsed() > ttl),
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };
        if expired {
            inner.map.remove(key);
            inner.order.retain(|k| k != key);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        inner.order.retain(|k| k != key);
        inner.order.push_back(key.clone());
        self.hits.fetch_add(1, Ordering::Relaxed);
        inner.map.get(key).map(|e| e.value.clone())
    }

    pub fn put(&self, key: K, value: V) {
        let mut inner = self.inner.lock();
        inner.order.retain(|k| k != &key);
        inner.order.push_back(key.clone());
        inner.map.insert(
            key,
            Entry {
                value,
                inserted_at: Instant::now(),
            },
        );
        while inner.map.len() > self.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.map.remove(&oldest);
            } else {
                break;
            }
        }
    }

    /// Drops every entry. Any ACL or schema mutation must call this —
    /// a stale cache entry must never survive a mutation.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.map.clear();
        inner.order.clear();
    }

    pub fn remove(&self, key: &K) {
        let mut inner = self.inner.lock();
        inner.map.remove(key);
        inner.order.retain(|k| k != key);
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        CacheStats {
            hits,
            misses,
            entries: self.inner.lock().map.len(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_oldest_past_capacity() {
        let cache: LruCache<u32, u32> = LruCache::new(2, None);
        cache.put(1, 10);
        cache.put(2, 20);
        cache.put(3, 30);
        assert_eq!(cache.get(&1), None);
        assert_eq!(cache.get(&2), Some(20));
        assert_eq!(cache.get(&3), Some(30));
    }

    #[test]
    fn touch_refreshes_recency() {
        let cache: LruCache<u32, u32> = LruCache::new(2, None);
        cache.put(1, 10);
        cache.put(2, 20);
        cache.get(&1);
        cache.put(3, 30);
        assert_eq!(cache.get(&2), None);
        assert_eq!(cache.get(&1), Some(10));
    }

    #[test]
    fn ttl_expiry() {
        let cache: LruCache<u32, u32> = LruCache::new(10, Some(Duration::from_millis(10)));
        cache.put(1, 10);
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(cache.get(&1), None);
    }

    #[test]
    fn clear_drops_everything() {
        let cache: LruCache<u32, u32> = LruCache::new(10, None);
        cache.put(1, 10);
        cache.clear();
        assert_eq!(cache.get(&1), None);
    }
}

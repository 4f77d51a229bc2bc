//! TTL + LRU entry cache
//!
//! Two independent eviction triggers: capacity (least recently used slot is
//! evicted on insert) and time-to-live (checked lazily on lookup). Map,
//! timestamps and recency order all live in one `LruCache` behind a single
//! mutex, so an insert, an eviction and an expiry can never interleave.
//!
//! The cache is never the system of record: every value in it can be
//! reproduced from the backing store.

use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::trace;

const DEFAULT_CAPACITY: NonZeroUsize = match NonZeroUsize::new(1000) {
    Some(n) => n,
    None => unreachable!(),
};

struct CacheSlot<V> {
    value: V,
    inserted_at: Instant,
    ttl: Option<Duration>,
}

impl<V> CacheSlot<V> {
    fn is_expired(&self, now: Instant) -> bool {
        self.ttl
            .map(|ttl| now.duration_since(self.inserted_at) >= ttl)
            .unwrap_or(false)
    }
}

/// Bounded cache of recently used entries
pub struct EntryCache<V> {
    slots: Mutex<LruCache<String, CacheSlot<V>>>,
    default_ttl: Option<Duration>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl<V: Clone> EntryCache<V> {
    /// Create a cache holding at most `capacity` entries.
    ///
    /// Slots inserted without an explicit TTL use `default_ttl`.
    pub fn new(capacity: usize, default_ttl: Option<Duration>) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(DEFAULT_CAPACITY);
        Self {
            slots: Mutex::new(LruCache::new(capacity)),
            default_ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    /// Look up a value, refreshing its recency. Expired slots are purged.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut slots = self.slots.lock();

        let expired = match slots.peek(key) {
            Some(slot) => slot.is_expired(now),
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        if expired {
            slots.pop(key);
            self.expirations.fetch_add(1, Ordering::Relaxed);
            self.misses.fetch_add(1, Ordering::Relaxed);
            trace!(key, "Cache slot expired");
            return None;
        }

        self.hits.fetch_add(1, Ordering::Relaxed);
        slots.get(key).map(|slot| slot.value.clone())
    }

    /// Insert or replace, evicting the least recently used slot when full
    pub fn set(&self, key: String, value: V, ttl: Option<Duration>) {
        let slot = CacheSlot {
            value,
            inserted_at: Instant::now(),
            ttl: ttl.or(self.default_ttl),
        };

        let mut slots = self.slots.lock();
        if let Some((evicted, _)) = slots.push(key.clone(), slot) {
            if evicted != key {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                trace!(key = %evicted, "Cache slot evicted");
            }
        }
    }

    /// Insert unless a live slot already exists. Returns whether it inserted.
    ///
    /// Used when repopulating from the backing store so a value written
    /// concurrently by `store()` is never overwritten by an older read.
    pub fn set_if_absent(&self, key: String, value: V, ttl: Option<Duration>) -> bool {
        let now = Instant::now();
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.peek(&key) {
            if !slot.is_expired(now) {
                return false;
            }
        }

        let slot = CacheSlot {
            value,
            inserted_at: now,
            ttl: ttl.or(self.default_ttl),
        };
        if let Some((evicted, _)) = slots.push(key.clone(), slot) {
            if evicted != key {
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
        true
    }

    /// Remove from cache
    pub fn remove(&self, key: &str) -> bool {
        self.slots.lock().pop(key).is_some()
    }

    /// Clear the cache
    pub fn clear(&self) {
        self.slots.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.slots.lock().cap().get()
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_rate = if total > 0 {
            hits as f64 / total as f64
        } else {
            0.0
        };

        let slots = self.slots.lock();
        CacheStats {
            hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            hit_rate,
            size: slots.len(),
            capacity: slots.cap().get(),
        }
    }
}

/// Cache statistics
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub hit_rate: f64,
    pub size: usize,
    pub capacity: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_basic() {
        let cache = EntryCache::new(100, None);

        // Initially empty
        assert!(cache.get("entry:name").is_none());

        cache.set("entry:name".to_string(), "Ada".to_string(), None);
        assert_eq!(cache.get("entry:name"), Some("Ada".to_string()));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.size, 1);
        assert_eq!(stats.hit_rate, 0.5);
    }

    #[test]
    fn test_cache_eviction() {
        let cache = EntryCache::new(2, None);

        cache.set("a".to_string(), 1, None);
        cache.set("b".to_string(), 2, None);
        cache.set("c".to_string(), 3, None);

        // a is the least recently used
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("b"), Some(2));
        assert_eq!(cache.get("c"), Some(3));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_get_refreshes_recency() {
        let cache = EntryCache::new(2, None);

        cache.set("a".to_string(), 1, None);
        cache.set("b".to_string(), 2, None);
        assert_eq!(cache.get("a"), Some(1));
        cache.set("c".to_string(), 3, None);

        assert_eq!(cache.get("a"), Some(1));
        assert_eq!(cache.get("b"), None);
    }

    #[test]
    fn test_replacing_does_not_count_as_eviction() {
        let cache = EntryCache::new(2, None);
        cache.set("a".to_string(), 1, None);
        cache.set("a".to_string(), 10, None);

        assert_eq!(cache.get("a"), Some(10));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().evictions, 0);
    }

    #[test]
    fn test_never_exceeds_capacity() {
        let cache = EntryCache::new(16, None);
        for i in 0..500 {
            cache.set(format!("k{}", i % 97), i, None);
            assert!(cache.len() <= 16);
        }
        assert_eq!(cache.capacity(), 16);
    }

    #[test]
    fn test_lazy_ttl_expiry() {
        let cache = EntryCache::new(10, None);
        cache.set("short".to_string(), 1, Some(Duration::from_millis(30)));
        cache.set("long".to_string(), 2, None);
        assert_eq!(cache.get("short"), Some(1));

        std::thread::sleep(Duration::from_millis(60));

        assert_eq!(cache.get("short"), None);
        assert_eq!(cache.get("long"), Some(2));
        let stats = cache.stats();
        assert_eq!(stats.expirations, 1);
        assert_eq!(stats.size, 1);
    }

    #[test]
    fn test_default_ttl_applies() {
        let cache = EntryCache::new(10, Some(Duration::from_millis(20)));
        cache.set("a".to_string(), 1, None);
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(cache.get("a"), None);
    }

    #[test]
    fn test_set_if_absent_keeps_live_value() {
        let cache = EntryCache::new(10, None);
        cache.set("k".to_string(), "fresh", None);

        assert!(!cache.set_if_absent("k".to_string(), "stale", None));
        assert_eq!(cache.get("k"), Some("fresh"));

        assert!(cache.set_if_absent("other".to_string(), "loaded", None));
        assert_eq!(cache.get("other"), Some("loaded"));
    }

    #[test]
    fn test_cache_remove_and_clear() {
        let cache = EntryCache::new(100, None);
        cache.set("key1".to_string(), 1, None);
        cache.set("key2".to_string(), 2, None);

        assert!(cache.remove("key1"));
        assert!(!cache.remove("key1"));
        assert_eq!(cache.len(), 1);

        cache.clear();
        assert!(cache.is_empty());
    }
}

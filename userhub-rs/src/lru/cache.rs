//! Provides the thread safe cache used by the user service.
//!
//! # Configuration
//! The cache is sized via the system config. Changes are picked up at runtime:
//!
//! ```yaml
//! cache:
//!     # Specifies the maximal number of entries to store.
//!     capacity: 100
//!     # Specifies how long (in milliseconds) an entry is considered fresh.
//!     ttl_ms: 60000
//! ```
//!
//! # Example
//! ```
//! # use std::sync::Arc;
//! # use userhub::clock::ManualClock;
//! # use userhub::lru::Cache;
//! let clock = Arc::new(ManualClock::new());
//! let cache = Cache::new(100, 60_000, clock.clone());
//!
//! cache.put(1, "John".to_owned());
//! assert_eq!(cache.get(&1), Some("John".to_owned()));
//!
//! clock.advance(60_001);
//! assert_eq!(cache.get(&1), None);
//!
//! let stats = cache.stats();
//! assert_eq!((stats.hits, stats.misses, stats.size), (1, 1, 0));
//! ```
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::average::Average;
use crate::clock::Clock;
use crate::fmt::format_millis;
use crate::lru::LRUCache;

/// Represents a snapshot of the metrics of a [Cache].
#[derive(Debug, Clone, PartialEq)]
pub struct CacheStats {
    /// Contains the number of successful reads since the last clear.
    pub hits: u64,
    /// Contains the number of unsuccessful reads since the last clear.
    pub misses: u64,
    /// Contains the number of stored entries.
    pub size: usize,
    /// Contains the max number of entries.
    pub capacity: usize,
    /// Contains the number of entries evicted to make room for others.
    pub evictions: u64,
    /// Contains the hit rate in percent.
    pub hit_rate: f64,
    /// Contains the sliding average of the recorded latencies in microseconds.
    pub avg_latency_micros: i32,
    /// Contains the total number of recorded latencies.
    pub latency_samples: u64,
}

/// Describes the state of a [Cache] as reported by [Cache::status].
#[derive(Debug, Clone, PartialEq)]
pub struct CacheStatus<K> {
    /// Contains the metrics of the cache.
    pub stats: CacheStats,
    /// Contains the requested number of keys (most recently used first).
    pub sample_keys: Vec<K>,
    /// Contains the total number of keys.
    pub total_keys: usize,
}

/// Describes the outcome of a [Cache::sweep].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    /// Contains the number of removed (stale) entries.
    pub removed: usize,
    /// Contains the number of entries before the sweep.
    pub size_before: usize,
    /// Contains the number of entries after the sweep.
    pub size_after: usize,
}

/// Wraps an [LRUCache] so that it can be shared across request handlers.
pub struct Cache<K: Hash + Eq + Clone, V: Clone> {
    lru: Mutex<LRUCache<K, V>>,
    clock: Arc<dyn Clock>,
    latency: Average,
}

impl<K: Hash + Eq + Clone + Debug, V: Clone> Cache<K, V> {
    /// Creates a new cache with the given capacity and default TTL (in milliseconds).
    pub fn new(capacity: usize, ttl: u64, clock: Arc<dyn Clock>) -> Self {
        Cache {
            lru: Mutex::new(LRUCache::new(capacity, ttl)),
            clock,
            latency: Average::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LRUCache<K, V>> {
        self.lru.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns a copy of the value stored for the given key if it is still fresh.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = self.clock.now();
        self.lock().get(key, now).cloned()
    }

    /// Stores a value using the default TTL.
    pub fn put(&self, key: K, value: V) {
        let now = self.clock.now();
        if let Some(evicted) = self.lock().put(key, value, now) {
            log::debug!("Evicted {:?} from the cache to make room.", evicted);
        }
    }

    /// Stores a value using a custom TTL in milliseconds.
    pub fn put_with_ttl(&self, key: K, value: V, ttl: u64) {
        let now = self.clock.now();
        if let Some(evicted) = self.lock().put_with_ttl(key, value, ttl, now) {
            log::debug!("Evicted {:?} from the cache to make room.", evicted);
        }
    }

    /// Removes the entry for the given key and reports whether one was present.
    pub fn delete(&self, key: &K) -> bool {
        self.lock().remove(key)
    }

    /// Removes all entries and resets the hit and miss counters.
    ///
    /// Returns the number of entries which were present before.
    pub fn clear(&self) -> usize {
        let mut lru = self.lock();
        let previous_size = lru.len();
        lru.clear();

        previous_size
    }

    /// Removes all entries which are stale at the time this method was invoked.
    pub fn sweep(&self) -> SweepReport {
        let now = self.clock.now();
        let mut lru = self.lock();
        let size_before = lru.len();
        let removed = lru.sweep(now);

        SweepReport {
            removed,
            size_before,
            size_after: lru.len(),
        }
    }

    /// Returns a snapshot of all keys (including not yet swept stale ones).
    pub fn keys(&self) -> Vec<K> {
        self.lock().keys()
    }

    /// Returns the number of stored entries.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Determines if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Records the time it took to answer a request which consulted this cache.
    pub fn record_latency(&self, micros: i32) {
        self.latency.add(micros);
    }

    /// Returns a snapshot of the metrics of this cache.
    pub fn stats(&self) -> CacheStats {
        self.stats_of(&self.lock())
    }

    /// Returns the metrics along with the **samples** most recently used keys.
    ///
    /// Everything is read under a single lock, so that the keys and metrics always match.
    pub fn status(&self, samples: usize) -> CacheStatus<K> {
        let lru = self.lock();
        let keys = lru.keys();

        CacheStatus {
            stats: self.stats_of(&lru),
            total_keys: keys.len(),
            sample_keys: keys.into_iter().rev().take(samples).collect(),
        }
    }

    fn stats_of(&self, lru: &LRUCache<K, V>) -> CacheStats {
        CacheStats {
            hits: lru.hits(),
            misses: lru.misses(),
            size: lru.len(),
            capacity: lru.capacity(),
            evictions: lru.evictions(),
            hit_rate: lru.hit_rate(),
            avg_latency_micros: self.latency.avg(),
            latency_samples: self.latency.count(),
        }
    }

    /// Applies a new capacity and default TTL.
    ///
    /// Shrinking the cache evicts the least recently used entries right away. A new TTL only
    /// applies to entries stored from now on.
    pub fn reconfigure(&self, capacity: usize, ttl: u64) {
        let mut lru = self.lock();

        if lru.capacity() != capacity {
            log::info!(
                "Updating the cache capacity from {} to {}.",
                lru.capacity(),
                capacity
            );
            lru.set_capacity(capacity);
        }

        if lru.ttl() != ttl {
            log::info!(
                "Updating the cache TTL from {} to {}.",
                format_millis(lru.ttl()),
                format_millis(ttl)
            );
            lru.set_ttl(ttl);
        }
    }
}

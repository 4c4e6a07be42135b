use std::borrow::Borrow;
use std::hash::Hash;

use linked_hash_map::LinkedHashMap;

/// Provides a size constrained LRU cache whose entries expire after a time to live.
///
/// A cache behaves just like a **Map** as long as there is room left. Once **capacity** entries
/// are stored, each insertion of a new key evicts the least recently used entry. Both, a
/// successful **get** and a **put** mark the key as most recently used.
///
/// Each entry carries its own TTL. An entry is fresh as long as `now - inserted_at <= ttl`.
/// Stale entries are never returned: **get** drops them when it stumbles over one and **sweep**
/// removes all of them at once. Note that **put** will not look for stale entries when it has
/// to make room, it strictly evicts the least recently used one.
///
/// This struct itself isn't thread safe and doesn't know what time it is, therefore each time
/// dependent operation receives the current timestamp (in milliseconds) from its caller. See
/// [Cache](crate::lru::Cache) for the synchronized wrapper used by the service.
///
/// # Examples
/// ```
/// # use userhub::lru::LRUCache;
/// // A cache of up to 2 entries which stay fresh for 1s...
/// let mut lru = LRUCache::new(2, 1_000);
///
/// lru.put("a", 1, 0);
/// lru.put("b", 2, 0);
/// assert_eq!(lru.get("a", 10), Some(&1));
///
/// // "b" is now the least recently used key and therefore has to go...
/// lru.put("c", 3, 20);
/// assert_eq!(lru.get("b", 30), None);
///
/// // ..and after one second "a" is no longer fresh.
/// assert_eq!(lru.get("a", 1_001), None);
///```
pub struct LRUCache<K: Hash + Eq + Clone, V> {
    capacity: usize,
    ttl: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
    map: LinkedHashMap<K, Entry<V>>,
}

struct Entry<V> {
    value: V,
    inserted_at: u64,
    ttl: u64,
}

impl<V> Entry<V> {
    fn is_fresh(&self, now: u64) -> bool {
        now.saturating_sub(self.inserted_at) <= self.ttl
    }
}

impl<K: Hash + Eq + Clone, V> LRUCache<K, V> {
    /// Creates a new cache which stores up to **capacity** entries which stay fresh for **ttl**
    /// milliseconds unless specified otherwise in [put_with_ttl](LRUCache::put_with_ttl).
    ///
    /// Both values are at least 1.
    pub fn new(capacity: usize, ttl: u64) -> Self {
        let capacity = capacity.max(1);
        LRUCache {
            capacity,
            ttl: ttl.max(1),
            hits: 0,
            misses: 0,
            evictions: 0,
            map: LinkedHashMap::with_capacity(capacity),
        }
    }

    /// Stores the given value for the given key using the default TTL.
    ///
    /// Returns the key which had to be evicted to make room, if any.
    pub fn put(&mut self, key: K, value: V, now: u64) -> Option<K> {
        let ttl = self.ttl;
        self.put_with_ttl(key, value, ttl, now)
    }

    /// Stores the given value for the given key using a custom TTL (in milliseconds).
    ///
    /// The key becomes the most recently used one, no matter if it was present before or not.
    /// Returns the key which had to be evicted to make room, if any.
    ///
    /// # Examples
    /// ```
    /// # use userhub::lru::LRUCache;
    /// let mut lru = LRUCache::new(8, 60_000);
    /// lru.put_with_ttl("short", "lived", 100, 0);
    /// lru.put("long", "lived", 0);
    ///
    /// assert_eq!(lru.get("short", 101), None);
    /// assert_eq!(lru.get("long", 101), Some(&"lived"));
    /// ```
    pub fn put_with_ttl(&mut self, key: K, value: V, ttl: u64, now: u64) -> Option<K> {
        let entry = Entry {
            value,
            inserted_at: now,
            ttl: ttl.max(1),
        };

        // Replacing an existing key also moves it to the back (MRU end) of the map...
        let _ = self.map.insert(key, entry);

        self.enforce_capacity().pop()
    }

    fn enforce_capacity(&mut self) -> Vec<K> {
        let mut evicted = Vec::new();
        while self.map.len() > self.capacity {
            match self.map.pop_front() {
                Some((key, _)) => {
                    self.evictions += 1;
                    evicted.push(key);
                }
                None => break,
            }
        }

        evicted
    }

    /// Returns the value stored for the given key if it is still fresh.
    ///
    /// A hit marks the key as most recently used. A stale entry is removed and reported as miss.
    pub fn get<Q>(&mut self, key: &Q, now: u64) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        match self.map.get_refresh(key).map(|entry| entry.is_fresh(now)) {
            Some(true) => {
                self.hits += 1;
                self.map.get(key).map(|entry| &entry.value)
            }
            Some(false) => {
                let _ = self.map.remove(key);
                self.misses += 1;
                None
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Removes the entry for the given key.
    ///
    /// Returns **true** if an entry was present.
    pub fn remove<Q>(&mut self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.map.remove(key).is_some()
    }

    /// Removes all entries and resets the hit and miss counters.
    ///
    /// # Examples
    /// ```
    /// # use userhub::lru::LRUCache;
    /// let mut lru = LRUCache::new(8, 60_000);
    /// lru.put(1, "one", 0);
    /// assert_eq!(lru.get(&1, 0), Some(&"one"));
    ///
    /// lru.clear();
    /// assert_eq!(lru.len(), 0);
    /// assert_eq!(lru.hits(), 0);
    /// ```
    pub fn clear(&mut self) {
        self.map.clear();
        self.hits = 0;
        self.misses = 0;
    }

    /// Removes all entries which are no longer fresh at **now**.
    ///
    /// Returns the number of removed entries.
    pub fn sweep(&mut self, now: u64) -> usize {
        let expired = self
            .map
            .iter()
            .filter(|(_, entry)| !entry.is_fresh(now))
            .map(|(key, _)| key.clone())
            .collect::<Vec<_>>();

        for key in &expired {
            let _ = self.map.remove(key);
        }

        expired.len()
    }

    /// Returns a snapshot of all keys, starting with the least recently used one.
    ///
    /// Note that this might include stale entries which haven't been swept yet.
    pub fn keys(&self) -> Vec<K> {
        self.map.keys().cloned().collect()
    }

    /// Returns the least recently used key, which is the next candidate for eviction.
    pub fn lru_key(&self) -> Option<&K> {
        self.map.front().map(|(key, _)| key)
    }

    /// Returns the most recently used key.
    pub fn mru_key(&self) -> Option<&K> {
        self.map.back().map(|(key, _)| key)
    }

    /// Returns the number of entries (including not yet swept stale ones).
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Determines if the cache is completely empty.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Returns the max number of entries in this cache.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Changes the max number of entries.
    ///
    /// If the cache shrinks, the least recently used entries are evicted right away.
    ///
    /// # Examples
    /// ```
    /// # use userhub::lru::LRUCache;
    /// let mut lru = LRUCache::new(10, 60_000);
    /// for i in 0..6 {
    ///     lru.put(i, i, 0);
    /// }
    ///
    /// lru.set_capacity(3);
    /// assert_eq!(lru.len(), 3);
    /// assert_eq!(lru.keys(), vec![3, 4, 5]);
    /// ```
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        let _ = self.enforce_capacity();
    }

    /// Returns the default TTL in milliseconds.
    pub fn ttl(&self) -> u64 {
        self.ttl
    }

    /// Changes the default TTL.
    ///
    /// Existing entries keep the TTL they were stored with.
    pub fn set_ttl(&mut self, ttl: u64) {
        self.ttl = ttl.max(1);
    }

    /// Returns the number of successful reads since the last **clear**.
    pub fn hits(&self) -> u64 {
        self.hits
    }

    /// Returns the number of unsuccessful reads since the last **clear**.
    pub fn misses(&self) -> u64 {
        self.misses
    }

    /// Returns the number of entries which were evicted to make room.
    pub fn evictions(&self) -> u64 {
        self.evictions
    }

    /// Returns the hit rate in percent.
    pub fn hit_rate(&self) -> f64 {
        match self.hits + self.misses {
            0 => 0.,
            reads => self.hits as f64 / reads as f64 * 100.,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::lru::LRUCache;

    #[test]
    fn capacity_is_enforced() {
        let mut lru = LRUCache::new(4, 60_000);

        for i in 1..=4 {
            assert_eq!(lru.put(i, i * 10, 0), None);
        }
        assert_eq!(lru.len(), 4);

        // Using an entry "saves" it, so that the next oldest one is evicted...
        assert_eq!(lru.get(&1, 1), Some(&10));
        assert_eq!(lru.put(5, 50, 2), Some(2));
        assert_eq!(lru.len(), 4);
        assert_eq!(lru.evictions(), 1);
        assert_eq!(lru.get(&2, 3), None);

        // Replacing an existing key never evicts anything...
        assert_eq!(lru.put(3, 31, 4), None);
        assert_eq!(lru.len(), 4);

        // ...and removing an entry makes room for another one.
        assert!(lru.remove(&5));
        assert!(!lru.remove(&5));
        assert_eq!(lru.put(6, 60, 5), None);
        assert_eq!(lru.len(), 4);
    }

    #[test]
    fn size_never_exceeds_capacity() {
        let mut lru = LRUCache::new(7, 60_000);
        for i in 0..1_000u64 {
            let _ = lru.put(i % 13, i, i);
            if i % 3 == 0 {
                let _ = lru.get(&(i % 5), i);
            }
            assert!(lru.len() <= 7);
        }
    }

    #[test]
    fn the_least_recently_used_key_is_evicted() {
        let mut lru = LRUCache::new(3, 60_000);
        let _ = lru.put("a", 1, 0);
        let _ = lru.put("b", 2, 0);
        let _ = lru.put("c", 3, 0);
        assert_eq!(lru.get("a", 0), Some(&1));

        // "a" was just touched and "c" was written after "b"...
        assert_eq!(lru.put("d", 4, 0), Some("b"));
        assert_eq!(lru.get("b", 0), None);
        assert_eq!(lru.get("a", 0), Some(&1));
        assert_eq!(lru.get("c", 0), Some(&3));
        assert_eq!(lru.get("d", 0), Some(&4));
    }

    #[test]
    fn reads_and_writes_promote_to_mru() {
        let mut lru = LRUCache::new(3, 60_000);
        let _ = lru.put("a", 1, 0);
        let _ = lru.put("b", 2, 0);
        assert_eq!(lru.mru_key(), Some(&"b"));
        assert_eq!(lru.lru_key(), Some(&"a"));

        let _ = lru.get("a", 0);
        assert_eq!(lru.mru_key(), Some(&"a"));
        assert_eq!(lru.lru_key(), Some(&"b"));

        let _ = lru.put("b", 3, 0);
        assert_eq!(lru.mru_key(), Some(&"b"));

        // A miss doesn't change anything...
        let _ = lru.get("x", 0);
        assert_eq!(lru.mru_key(), Some(&"b"));
    }

    #[test]
    fn entries_are_fresh_up_to_and_including_their_ttl() {
        let mut lru = LRUCache::new(8, 1_000);
        let _ = lru.put("key", "value", 5_000);

        assert_eq!(lru.get("key", 6_000), Some(&"value"));
        assert_eq!(lru.get("key", 6_001), None);

        // The stale entry has been dropped by get...
        assert_eq!(lru.len(), 0);
        assert_eq!(lru.hits(), 1);
        assert_eq!(lru.misses(), 1);
    }

    #[test]
    fn put_does_not_prefer_stale_entries_for_eviction() {
        let mut lru = LRUCache::new(2, 60_000);
        let _ = lru.put_with_ttl("stale", 1, 10, 0);
        let _ = lru.put("fresh", 2, 0);
        let _ = lru.get("stale", 5);

        // "fresh" is the LRU entry, so it goes even though "stale" is expired by now...
        assert_eq!(lru.put("new", 3, 100), Some("fresh"));
        assert_eq!(lru.len(), 2);
    }

    #[test]
    fn sweep_removes_exactly_the_stale_entries() {
        let mut lru = LRUCache::new(16, 1_000);
        let _ = lru.put("a", 1, 0);
        let _ = lru.put("b", 2, 400);
        let _ = lru.put_with_ttl("c", 3, 10_000, 0);
        let _ = lru.put("d", 4, 1_200);

        assert_eq!(lru.sweep(1_500), 2);
        assert_eq!(lru.len(), 2);
        assert_eq!(lru.get("c", 1_500), Some(&3));
        assert_eq!(lru.get("d", 1_500), Some(&4));

        // Sweeping again at the same instant is a no-op...
        assert_eq!(lru.sweep(1_500), 0);
    }

    #[test]
    fn clear_is_idempotent() {
        let mut lru = LRUCache::new(4, 1_000);
        let _ = lru.put(1, 1, 0);
        let _ = lru.get(&1, 0);
        let _ = lru.get(&2, 0);

        lru.clear();
        let after_first = (lru.len(), lru.hits(), lru.misses(), lru.keys());
        lru.clear();
        let after_second = (lru.len(), lru.hits(), lru.misses(), lru.keys());

        assert_eq!(after_first, (0, 0, 0, Vec::new()));
        assert_eq!(after_first, after_second);
    }

    #[test]
    fn changing_the_ttl_only_affects_new_entries() {
        let mut lru = LRUCache::new(4, 1_000);
        let _ = lru.put("old", 1, 0);
        lru.set_ttl(10_000);
        let _ = lru.put("new", 2, 0);

        assert_eq!(lru.get("old", 2_000), None);
        assert_eq!(lru.get("new", 2_000), Some(&2));
    }

    #[test]
    fn hit_rate_is_computed() {
        let mut lru = LRUCache::new(4, 1_000);
        assert_eq!(lru.hit_rate(), 0.);

        let _ = lru.put("A", 1, 0);
        let _ = lru.put("B", 2, 0);
        let _ = lru.put("C", 3, 0);
        assert!(lru.get("A", 0).is_some());
        assert!(lru.get("B", 0).is_some());
        assert!(lru.get("C", 0).is_some());
        assert!(lru.get("D", 0).is_none());

        assert_eq!(lru.hit_rate().round() as i32, 75);
    }
}

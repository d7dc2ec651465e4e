//! Fixed-capacity LRU cache with optional time-based expiry
//!
//! Entries live in a slab of nodes linked into a doubly-linked recency list
//! (head = most recently used, tail = least recently used) and are located
//! through a `HashMap` of slab slots, so `get`, `set` and `delete` are O(1).
//!
//! Expiry is measured from insertion. Stale entries are dropped lazily when
//! `get`/`has` touch them, or eagerly by [`BoundedCache::purge_expired`].
//!
//! # Example
//!
//! ```rust
//! use state_store::BoundedCache;
//!
//! let mut cache = BoundedCache::new(2);
//! cache.set("a", 1);
//! cache.set("b", 2);
//! cache.get(&"a");          // "a" is now most recently used
//! cache.set("c", 3);        // evicts "b"
//!
//! assert!(cache.has(&"a"));
//! assert!(!cache.has(&"b"));
//! assert_eq!(cache.keys(), vec!["c", "a"]);
//! ```

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

use tracing::trace;

const NIL: usize = usize::MAX;

/// Counters describing how a cache has been used
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

impl CacheStats {
    /// Fraction of lookups that hit, 0.0 when nothing was looked up
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct Node<K, V> {
    key: K,
    value: V,
    inserted: Instant,
    prev: usize,
    next: usize,
}

/// LRU cache with an optional TTL
pub struct BoundedCache<K, V> {
    capacity: usize,
    ttl: Option<Duration>,
    slots: Vec<Option<Node<K, V>>>,
    free: Vec<usize>,
    index: HashMap<K, usize>,
    head: usize,
    tail: usize,
    stats: CacheStats,
}

impl<K, V> BoundedCache<K, V>
where
    K: Eq + Hash + Clone,
{
    /// Create a cache holding at most `capacity` entries (at least one)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            ttl: None,
            slots: Vec::with_capacity(capacity.min(1024)),
            free: Vec::new(),
            index: HashMap::with_capacity(capacity.min(1024)),
            head: NIL,
            tail: NIL,
            stats: CacheStats::default(),
        }
    }

    /// Create a cache whose entries expire `ttl` after insertion
    pub fn with_ttl(capacity: usize, ttl: Duration) -> Self {
        let mut cache = Self::new(capacity);
        cache.ttl = Some(ttl);
        cache
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    /// Number of stored entries, including ones that expired but were not yet touched
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// Look up `key`, promoting it to most recently used
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let Some(slot) = self.live_slot(key) else {
            self.stats.misses += 1;
            return None;
        };
        self.stats.hits += 1;
        self.detach(slot);
        self.push_front(slot);
        self.slots[slot].as_ref().map(|node| &node.value)
    }

    /// Look up `key` without touching recency or expiring it
    pub fn peek(&self, key: &K) -> Option<&V> {
        let slot = *self.index.get(key)?;
        let node = self.slots[slot].as_ref()?;
        if self.is_expired(node) {
            return None;
        }
        Some(&node.value)
    }

    /// `true` if `key` is present and fresh; expires it otherwise
    pub fn has(&mut self, key: &K) -> bool {
        self.live_slot(key).is_some()
    }

    /// Insert or overwrite `key`.
    ///
    /// Returns the least recently used entry when the insert pushed the cache
    /// over capacity.
    pub fn set(&mut self, key: K, value: V) -> Option<(K, V)> {
        if let Some(&slot) = self.index.get(&key) {
            if let Some(node) = self.slots[slot].as_mut() {
                node.value = value;
                node.inserted = Instant::now();
            }
            self.detach(slot);
            self.push_front(slot);
            return None;
        }

        let evicted = if self.index.len() >= self.capacity {
            self.evict_tail()
        } else {
            None
        };

        let node = Node {
            key: key.clone(),
            value,
            inserted: Instant::now(),
            prev: NIL,
            next: NIL,
        };
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(node);
                slot
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        };
        self.index.insert(key, slot);
        self.push_front(slot);
        evicted
    }

    /// Remove `key`, returning its value
    pub fn delete(&mut self, key: &K) -> Option<V> {
        let slot = self.index.remove(key)?;
        self.detach(slot);
        let node = self.slots[slot].take()?;
        self.free.push(slot);
        Some(node.value)
    }

    /// Drop every expired entry; returns how many were removed
    pub fn purge_expired(&mut self) -> usize {
        if self.ttl.is_none() {
            return 0;
        }
        let stale: Vec<K> = self
            .nodes()
            .filter(|node| self.is_expired(node))
            .map(|node| node.key.clone())
            .collect();
        for key in &stale {
            self.delete(key);
        }
        self.stats.expirations += stale.len() as u64;
        if !stale.is_empty() {
            trace!(removed = stale.len(), "Purged expired cache entries");
        }
        stale.len()
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
        self.index.clear();
        self.head = NIL;
        self.tail = NIL;
    }

    /// Keys from most to least recently used
    pub fn keys(&self) -> Vec<K> {
        self.nodes().map(|node| node.key.clone()).collect()
    }

    /// Values from most to least recently used
    pub fn values(&self) -> Vec<&V> {
        self.nodes().map(|node| &node.value).collect()
    }

    /// Entries from most to least recently used
    pub fn entries(&self) -> Vec<(&K, &V)> {
        self.nodes().map(|node| (&node.key, &node.value)).collect()
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn nodes(&self) -> impl Iterator<Item = &Node<K, V>> {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            let node = self.slots.get(cursor)?.as_ref()?;
            cursor = node.next;
            Some(node)
        })
    }

    fn is_expired(&self, node: &Node<K, V>) -> bool {
        self.ttl
            .map(|ttl| node.inserted.elapsed() >= ttl)
            .unwrap_or(false)
    }

    /// Slot of a fresh entry; stale entries are removed on the way
    fn live_slot(&mut self, key: &K) -> Option<usize> {
        let slot = *self.index.get(key)?;
        let expired = self.slots[slot]
            .as_ref()
            .map(|node| self.is_expired(node))
            .unwrap_or(true);
        if expired {
            self.delete(key);
            self.stats.expirations += 1;
            return None;
        }
        Some(slot)
    }

    fn evict_tail(&mut self) -> Option<(K, V)> {
        let slot = self.tail;
        if slot == NIL {
            return None;
        }
        self.detach(slot);
        let node = self.slots[slot].take()?;
        self.free.push(slot);
        self.index.remove(&node.key);
        self.stats.evictions += 1;
        Some((node.key, node.value))
    }

    fn detach(&mut self, slot: usize) {
        let (prev, next) = match self.slots[slot].as_ref() {
            Some(node) => (node.prev, node.next),
            None => return,
        };
        if prev != NIL {
            if let Some(node) = self.slots[prev].as_mut() {
                node.next = next;
            }
        } else if self.head == slot {
            self.head = next;
        }
        if next != NIL {
            if let Some(node) = self.slots[next].as_mut() {
                node.prev = prev;
            }
        } else if self.tail == slot {
            self.tail = prev;
        }
        if let Some(node) = self.slots[slot].as_mut() {
            node.prev = NIL;
            node.next = NIL;
        }
    }

    fn push_front(&mut self, slot: usize) {
        let old_head = self.head;
        if let Some(node) = self.slots[slot].as_mut() {
            node.prev = NIL;
            node.next = old_head;
        }
        if old_head != NIL {
            if let Some(node) = self.slots[old_head].as_mut() {
                node.prev = slot;
            }
        }
        self.head = slot;
        if self.tail == NIL {
            self.tail = slot;
        }
    }
}

impl<K, V> std::fmt::Debug for BoundedCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedCache")
            .field("capacity", &self.capacity)
            .field("len", &self.index.len())
            .field("ttl", &self.ttl)
            .field("stats", &self.stats)
            .finish()
    }
}

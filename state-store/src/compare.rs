//! Deep equality and shape comparison over [`Value`] trees
//!
//! [`Comparator`] is the cached comparator the engine injects everywhere a
//! "did this actually change" decision is needed. Results for composite pairs
//! are remembered by a per-allocation identity for a short time, so repeated
//! comparisons of the same two snapshots are a hash lookup.
//!
//! Snapshots are never mutated in place, which is what makes reusing a cached
//! verdict for the same pair of allocations sound.
//!
//! ```rust
//! use state_store::{Comparator, Value};
//! use serde_json::json;
//!
//! let comparator = Comparator::default();
//! let a = Value::from(json!({ "items": [1, 2, 3] }));
//! let b = Value::from(json!({ "items": [1, 2, 3] }));
//!
//! assert!(comparator.equal(&a, &b));
//! assert!(comparator.equal(&a, &b)); // served from the result cache
//! assert_eq!(comparator.stats().cache_hits, 1);
//! ```

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::cache::BoundedCache;
use crate::value::{Value, WeakNode};

/// Default recursion bound
pub const DEFAULT_MAX_DEPTH: usize = 100;

/// Default size at or below which composites skip the key/length pre-check
pub const DEFAULT_SMALL_THRESHOLD: usize = 10;

/// Default number of cached comparison results
pub const DEFAULT_CACHE_CAPACITY: usize = 1000;

/// Default lifetime of a cached comparison result
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60);

/// Tuning knobs for [`Comparator`]
#[derive(Debug, Clone, PartialEq)]
pub struct CompareOptions {
    pub max_depth: usize,
    pub small_threshold: usize,
    pub cache_capacity: usize,
    pub cache_ttl: Duration,
}

impl Default for CompareOptions {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
            small_threshold: DEFAULT_SMALL_THRESHOLD,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            cache_ttl: DEFAULT_CACHE_TTL,
        }
    }
}

/// Snapshot of comparator counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ComparatorStats {
    pub comparisons: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub depth_exceeded: u64,
    pub tracked_identities: usize,
}

/// One-level shape difference between two values
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShapeDelta {
    /// Both sides are non-null and differ in kind, with at least one composite
    pub kind_changed: bool,
    /// Keys added plus keys removed for objects, length difference otherwise
    pub size_delta: usize,
}

impl ShapeDelta {
    pub fn exceeds(&self, threshold: usize) -> bool {
        self.kind_changed || self.size_delta > threshold
    }
}

struct Identity {
    id: u64,
    _pin: WeakNode,
}

/// Cached, cycle-safe, depth-bounded structural comparator
pub struct Comparator {
    options: CompareOptions,
    identities: Mutex<BoundedCache<usize, Identity>>,
    results: Mutex<BoundedCache<(u64, u64), bool>>,
    next_id: AtomicU64,
    comparisons: AtomicU64,
    depth_exceeded: AtomicU64,
}

impl Default for Comparator {
    fn default() -> Self {
        Self::new(CompareOptions::default())
    }
}

impl std::fmt::Debug for Comparator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Comparator")
            .field("options", &self.options)
            .field("stats", &self.stats())
            .finish()
    }
}

impl Comparator {
    pub fn new(options: CompareOptions) -> Self {
        // Identities outlive the results keyed on them
        let identity_capacity = options.cache_capacity.saturating_mul(2);
        Self {
            identities: Mutex::new(BoundedCache::with_ttl(identity_capacity, options.cache_ttl)),
            results: Mutex::new(BoundedCache::with_ttl(options.cache_capacity, options.cache_ttl)),
            next_id: AtomicU64::new(1),
            comparisons: AtomicU64::new(0),
            depth_exceeded: AtomicU64::new(0),
            options,
        }
    }

    pub fn options(&self) -> &CompareOptions {
        &self.options
    }

    /// Deep equality with reference short-circuit and result caching
    pub fn equal(&self, a: &Value, b: &Value) -> bool {
        self.comparisons.fetch_add(1, Ordering::Relaxed);

        if Value::identical(a, b) {
            return true;
        }
        if a.kind() != b.kind() {
            return false;
        }

        let key = match (self.identity(a), self.identity(b)) {
            (Some(x), Some(y)) => Some(if x <= y { (x, y) } else { (y, x) }),
            _ => None,
        };

        if let Some(key) = key {
            if let Some(&cached) = self.results.lock().get(&key) {
                trace!(left = key.0, right = key.1, equal = cached, "Comparator cache hit");
                return cached;
            }
        }

        let mut walk = Walk::new(&self.options);
        let result = walk.equal(a, b, 0);
        if walk.depth_exceeded {
            self.depth_exceeded.fetch_add(1, Ordering::Relaxed);
            return result;
        }

        if let Some(key) = key {
            self.results.lock().set(key, result);
        }
        result
    }

    /// `Option`-aware [`Comparator::equal`]: two absent values are equal
    pub fn equal_opt(&self, a: Option<&Value>, b: Option<&Value>) -> bool {
        match (a, b) {
            (None, None) => true,
            (Some(a), Some(b)) => self.equal(a, b),
            _ => false,
        }
    }

    /// Cheap one-level check: did the key set, length or kind change?
    pub fn structural_delta(&self, before: &Value, after: &Value) -> bool {
        structural_delta(before, after)
    }

    /// Drop all cached identities and verdicts
    pub fn clear(&self) {
        self.results.lock().clear();
        self.identities.lock().clear();
    }

    /// Drop expired cache entries; returns how many were removed
    pub fn purge_expired(&self) -> usize {
        self.results.lock().purge_expired() + self.identities.lock().purge_expired()
    }

    pub fn stats(&self) -> ComparatorStats {
        let results = self.results.lock().stats();
        ComparatorStats {
            comparisons: self.comparisons.load(Ordering::Relaxed),
            cache_hits: results.hits,
            cache_misses: results.misses,
            depth_exceeded: self.depth_exceeded.load(Ordering::Relaxed),
            tracked_identities: self.identities.lock().len(),
        }
    }

    /// Stable id for a composite allocation, assigned on first sight
    fn identity(&self, value: &Value) -> Option<u64> {
        let addr = value.node_addr()?;
        let mut identities = self.identities.lock();
        if let Some(identity) = identities.get(&addr) {
            return Some(identity.id);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        identities.set(
            addr,
            Identity {
                id,
                _pin: value.downgrade()?,
            },
        );
        Some(id)
    }
}

// ============================================================================
// Uncached helpers
// ============================================================================

/// Uncached deep equality with default limits
pub fn deep_equal(a: &Value, b: &Value) -> bool {
    if Value::identical(a, b) {
        return true;
    }
    let options = CompareOptions::default();
    Walk::new(&options).equal(a, b, 0)
}

/// One-level key/length/kind comparison, no recursion into values
pub fn structural_delta(before: &Value, after: &Value) -> bool {
    if before.kind() != after.kind() {
        return true;
    }
    match (before, after) {
        (Value::Object(a), Value::Object(b)) => a.len() != b.len() || !a.keys().eq(b.keys()),
        (Value::Array(a), Value::Array(b)) | (Value::Set(a), Value::Set(b)) => a.len() != b.len(),
        (Value::Map(a), Value::Map(b)) => a.len() != b.len(),
        _ => false,
    }
}

/// Measure how far the shape of `after` moved from `before`
pub fn shape_delta(before: &Value, after: &Value) -> ShapeDelta {
    let kind_changed = !before.is_null()
        && !after.is_null()
        && before.kind() != after.kind()
        && (before.is_composite() || after.is_composite());

    let size_delta = match (before, after) {
        (Value::Object(a), Value::Object(b)) => {
            let removed = a.keys().filter(|k| !b.contains_key(*k)).count();
            let added = b.keys().filter(|k| !a.contains_key(*k)).count();
            removed + added
        }
        _ if before.kind() == after.kind() => before.len().abs_diff(after.len()),
        _ => before.len().max(after.len()),
    };

    ShapeDelta {
        kind_changed,
        size_delta,
    }
}

// ============================================================================
// Recursive walk
// ============================================================================

struct Walk<'a> {
    options: &'a CompareOptions,
    in_progress: HashSet<(usize, usize)>,
    depth_exceeded: bool,
}

impl<'a> Walk<'a> {
    fn new(options: &'a CompareOptions) -> Self {
        Self {
            options,
            in_progress: HashSet::new(),
            depth_exceeded: false,
        }
    }

    fn equal(&mut self, a: &Value, b: &Value, depth: usize) -> bool {
        if Value::identical(a, b) {
            return true;
        }
        if depth > self.options.max_depth {
            if !self.depth_exceeded {
                warn!(
                    max_depth = self.options.max_depth,
                    "Comparison exceeded max depth, treating values as different"
                );
            }
            self.depth_exceeded = true;
            return false;
        }

        match (a, b) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(x), Value::Bool(y)) => x == y,
            (Value::Number(x), Value::Number(y)) => x == y || (x.is_nan() && y.is_nan()),
            (Value::String(x), Value::String(y)) => x == y,
            (Value::Date(x), Value::Date(y)) => x == y,
            (Value::Pattern(x), Value::Pattern(y)) => x.canonical() == y.canonical(),
            _ if a.kind() != b.kind() => false,
            _ => self.composite(a, b, depth),
        }
    }

    fn composite(&mut self, a: &Value, b: &Value, depth: usize) -> bool {
        let pair = match (a.node_addr(), b.node_addr()) {
            (Some(x), Some(y)) => (x, y),
            _ => return false,
        };
        if !self.in_progress.insert(pair) {
            // Revisiting a pair still being compared closes the loop
            return true;
        }

        let result = match (a, b) {
            (Value::Array(x), Value::Array(y)) => {
                x.len() == y.len()
                    && x.iter()
                        .zip(y.iter())
                        .all(|(l, r)| self.equal(l, r, depth + 1))
            }
            (Value::Object(x), Value::Object(y)) => {
                if x.len() != y.len() {
                    false
                } else if x.len() > self.options.small_threshold && !x.keys().eq(y.keys()) {
                    false
                } else {
                    x.iter().all(|(key, l)| match y.get(key) {
                        Some(r) => self.equal(l, r, depth + 1),
                        None => false,
                    })
                }
            }
            (Value::Set(x), Value::Set(y)) => {
                x.len() == y.len() && self.match_unordered(x, y, depth, |walk, l, r, d| walk.equal(l, r, d))
            }
            (Value::Map(x), Value::Map(y)) => {
                x.len() == y.len()
                    && self.match_unordered(x, y, depth, |walk, (lk, lv), (rk, rv), d| {
                        walk.equal(lk, rk, d) && walk.equal(lv, rv, d)
                    })
            }
            _ => false,
        };

        self.in_progress.remove(&pair);
        result
    }

    /// Match every element of `left` against a distinct, not yet matched
    /// element of `right`.
    fn match_unordered<T>(
        &mut self,
        left: &[T],
        right: &[T],
        depth: usize,
        eq: impl Fn(&mut Self, &T, &T, usize) -> bool,
    ) -> bool {
        let mut matched = vec![false; right.len()];
        for l in left {
            let hit = right.iter().enumerate().position(|(i, r)| !matched[i] && eq(self, l, r, depth + 1));
            match hit {
                Some(i) => matched[i] = true,
                None => return false,
            }
        }
        true
    }
}

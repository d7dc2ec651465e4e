//! Path-indexed subscriber registry
//!
//! Subscribers register callbacks under one or more [`PathPattern`]s. Patterns
//! are stored in a trie keyed by path segment, so finding everybody affected by
//! a changed path costs one walk down the changed path rather than a scan over
//! all subscribers.
//!
//! # Matching
//!
//! | Registered | Fires for |
//! |---|---|
//! | `*` (everything) | every change |
//! | `a.b` | `a.b` and any descendant (`a.b.c`) |
//! | `a.*` | exactly one level below (`a.x`, not `a.x.y`) |
//! | `a.**` | any depth below (`a.x`, `a.x.y`) |
//!
//! # Mutation during notification
//!
//! Callbacks run without any lock held and are free to subscribe or dispose.
//! Such changes are queued and applied once the outermost notification
//! returns; an unsubscribed subscriber is deactivated immediately so it does
//! not fire again in the running batch.
//!
//! # Architecture
//!
//! ```text
//! PathSubscriptionIndex<E> (Clone, Arc inner)
//!     │
//!     ├── state: Mutex<IndexState>
//!     │       ├── root: TrieNode
//!     │       │     ├── subscribers   (registered exactly here)
//!     │       │     ├── children      Segment -> TrieNode
//!     │       │     ├── wildcard      `*`  -> TrieNode
//!     │       │     └── deep          `**` subscribers
//!     │       └── subscribers: id -> Arc<Subscriber<E>>
//!     │
//!     └── deferred: Mutex<Deferred>  (notification depth + queued ops)
//! ```

use std::collections::{HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use state_store::{panic_message, Path, PathPattern, PatternSegment, Segment};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Identifier handed out per subscription
pub type SubscriberId = u64;

/// Subscriber callback
pub type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Per-subscriber delivery options
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Higher fires first; ties fire in registration order
    pub priority: i32,
    /// Minimum time between two deliveries
    pub throttle: Option<Duration>,
}

/// Outcome of one [`PathSubscriptionIndex::notify`] call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NotifyReport {
    /// Active subscribers whose patterns matched
    pub matched: usize,
    /// Callbacks invoked
    pub fired: usize,
    /// Matched but skipped because of throttling
    pub throttled: usize,
    /// Callbacks that panicked
    pub failed: usize,
}

struct Subscriber<E> {
    id: SubscriberId,
    callback: Callback<E>,
    priority: i32,
    throttle: Option<Duration>,
    last_fired: Mutex<Option<Instant>>,
    active: AtomicBool,
    patterns: Mutex<Vec<PathPattern>>,
}

impl<E> Subscriber<E> {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Claim a delivery slot, honoring the throttle interval
    fn try_claim(&self) -> bool {
        let mut last = self.last_fired.lock();
        let now = Instant::now();
        if let (Some(interval), Some(previous)) = (self.throttle, *last) {
            if now.duration_since(previous) < interval {
                return false;
            }
        }
        *last = Some(now);
        true
    }
}

#[derive(Default)]
struct TrieNode {
    subscribers: HashSet<SubscriberId>,
    children: HashMap<Segment, TrieNode>,
    wildcard: Option<Box<TrieNode>>,
    deep: HashSet<SubscriberId>,
}

impl TrieNode {
    fn insert(&mut self, pattern: &[PatternSegment], id: SubscriberId) {
        let Some((head, rest)) = pattern.split_first() else {
            self.subscribers.insert(id);
            return;
        };
        match head {
            PatternSegment::Exact(segment) => self
                .children
                .entry(segment.clone())
                .or_default()
                .insert(rest, id),
            PatternSegment::Wildcard => self
                .wildcard
                .get_or_insert_with(Default::default)
                .insert(rest, id),
            PatternSegment::DeepWildcard => {
                self.deep.insert(id);
            }
        }
    }

    /// Remove `id` along `pattern`; returns true when this node became empty
    fn remove(&mut self, pattern: &[PatternSegment], id: SubscriberId) -> bool {
        match pattern.split_first() {
            None => {
                self.subscribers.remove(&id);
            }
            Some((PatternSegment::Exact(segment), rest)) => {
                let prune = self
                    .children
                    .get_mut(segment)
                    .map(|child| child.remove(rest, id))
                    .unwrap_or(false);
                if prune {
                    self.children.remove(segment);
                }
            }
            Some((PatternSegment::Wildcard, rest)) => {
                let prune = self
                    .wildcard
                    .as_mut()
                    .map(|child| child.remove(rest, id))
                    .unwrap_or(false);
                if prune {
                    self.wildcard = None;
                }
            }
            Some((PatternSegment::DeepWildcard, _)) => {
                self.deep.remove(&id);
            }
        }
        self.is_empty()
    }

    fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
            && self.children.is_empty()
            && self.wildcard.is_none()
            && self.deep.is_empty()
    }

    /// Collect subscribers whose pattern matches a path with `remaining`
    /// segments left below this node.
    fn collect(&self, remaining: &[Segment], via_wildcard: bool, out: &mut HashSet<SubscriberId>) {
        // A `*` step matches exactly one segment; exact steps match descendants too
        if !via_wildcard || remaining.is_empty() {
            out.extend(self.subscribers.iter().copied());
        }
        let Some((head, rest)) = remaining.split_first() else {
            return;
        };
        out.extend(self.deep.iter().copied());
        if let Some(child) = self.children.get(head) {
            child.collect(rest, false, out);
        }
        if let Some(wildcard) = &self.wildcard {
            wildcard.collect(rest, true, out);
        }
    }
}

enum PendingOp<E> {
    Subscribe(Arc<Subscriber<E>>),
    Unsubscribe(SubscriberId),
    Replace(SubscriberId, Vec<PathPattern>),
}

struct Deferred<E> {
    depth: usize,
    ops: Vec<PendingOp<E>>,
}

struct IndexState<E> {
    root: TrieNode,
    subscribers: HashMap<SubscriberId, Arc<Subscriber<E>>>,
}

impl<E> IndexState<E> {
    fn insert(&mut self, subscriber: Arc<Subscriber<E>>) {
        for pattern in subscriber.patterns.lock().iter() {
            self.root.insert(pattern.segments(), subscriber.id);
        }
        self.subscribers.insert(subscriber.id, subscriber);
    }

    fn remove(&mut self, id: SubscriberId) -> bool {
        let Some(subscriber) = self.subscribers.remove(&id) else {
            return false;
        };
        for pattern in subscriber.patterns.lock().iter() {
            self.root.remove(pattern.segments(), id);
        }
        true
    }

    fn replace(&mut self, id: SubscriberId, patterns: Vec<PathPattern>) {
        let Some(subscriber) = self.subscribers.get(&id).cloned() else {
            return;
        };
        let mut current = subscriber.patterns.lock();
        for pattern in current.iter() {
            self.root.remove(pattern.segments(), id);
        }
        for pattern in &patterns {
            self.root.insert(pattern.segments(), id);
        }
        *current = patterns;
    }

    fn apply(&mut self, op: PendingOp<E>) {
        match op {
            PendingOp::Subscribe(subscriber) => {
                if subscriber.is_active() {
                    self.insert(subscriber);
                }
            }
            PendingOp::Unsubscribe(id) => {
                self.remove(id);
            }
            PendingOp::Replace(id, patterns) => self.replace(id, patterns),
        }
    }
}

struct IndexInner<E> {
    state: Mutex<IndexState<E>>,
    deferred: Mutex<Deferred<E>>,
    next_id: AtomicU64,
}

impl<E> IndexInner<E> {
    fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut deferred = self.deferred.lock();
        let mut state = self.state.lock();
        let Some(subscriber) = state.subscribers.get(&id).cloned().or_else(|| {
            deferred.ops.iter().find_map(|op| match op {
                PendingOp::Subscribe(s) if s.id == id => Some(Arc::clone(s)),
                _ => None,
            })
        }) else {
            return false;
        };
        subscriber.active.store(false, Ordering::Release);

        if deferred.depth > 0 {
            deferred.ops.push(PendingOp::Unsubscribe(id));
        } else {
            state.remove(id);
        }
        true
    }
}

/// Handle returned by `subscribe`; call [`Disposer::dispose`] to unsubscribe
#[must_use = "dropping a Disposer keeps the subscription alive; call dispose() to remove it"]
pub struct Disposer {
    id: SubscriberId,
    dispose: Option<Box<dyn FnOnce() -> bool + Send + Sync>>,
}

impl Disposer {
    pub(crate) fn new(id: SubscriberId, dispose: impl FnOnce() -> bool + Send + Sync + 'static) -> Self {
        Self {
            id,
            dispose: Some(Box::new(dispose)),
        }
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Remove the subscription; returns false if it was already gone
    pub fn dispose(mut self) -> bool {
        self.dispose.take().map(|dispose| dispose()).unwrap_or(false)
    }
}

impl std::fmt::Debug for Disposer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Disposer").field("id", &self.id).finish()
    }
}

/// Trie-backed subscriber registry delivering events of type `E`
pub struct PathSubscriptionIndex<E> {
    inner: Arc<IndexInner<E>>,
}

impl<E> Clone for PathSubscriptionIndex<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Non-owning handle to a [`PathSubscriptionIndex`]
pub(crate) struct WeakIndex<E> {
    inner: Weak<IndexInner<E>>,
}

impl<E> WeakIndex<E> {
    pub(crate) fn upgrade(&self) -> Option<PathSubscriptionIndex<E>> {
        self.inner.upgrade().map(|inner| PathSubscriptionIndex { inner })
    }
}

impl<E: 'static> Default for PathSubscriptionIndex<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: 'static> PathSubscriptionIndex<E> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(IndexInner {
                state: Mutex::new(IndexState {
                    root: TrieNode::default(),
                    subscribers: HashMap::new(),
                }),
                deferred: Mutex::new(Deferred {
                    depth: 0,
                    ops: Vec::new(),
                }),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register `callback` under `patterns` (everything when empty)
    pub fn subscribe(
        &self,
        patterns: Vec<PathPattern>,
        options: SubscribeOptions,
        callback: impl Fn(&E) + Send + Sync + 'static,
    ) -> Disposer {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let patterns = if patterns.is_empty() {
            vec![PathPattern::everything()]
        } else {
            patterns
        };
        trace!(id, patterns = ?patterns.iter().map(|p| p.to_string()).collect::<Vec<_>>(), "Subscribing");

        let subscriber = Arc::new(Subscriber {
            id,
            callback: Arc::new(callback),
            priority: options.priority,
            throttle: options.throttle,
            last_fired: Mutex::new(None),
            active: AtomicBool::new(true),
            patterns: Mutex::new(patterns),
        });

        {
            let mut deferred = self.inner.deferred.lock();
            if deferred.depth > 0 {
                debug!(id, "Subscription deferred until notification completes");
                deferred.ops.push(PendingOp::Subscribe(subscriber));
            } else {
                self.inner.state.lock().insert(subscriber);
            }
        }

        let weak: Weak<IndexInner<E>> = Arc::downgrade(&self.inner);
        Disposer::new(id, move || {
            weak.upgrade()
                .map(|inner| inner.unsubscribe(id))
                .unwrap_or(false)
        })
    }

    pub(crate) fn downgrade(&self) -> WeakIndex<E> {
        WeakIndex {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Remove a subscriber by id; returns false if unknown
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.inner.unsubscribe(id)
    }

    /// Swap the patterns a subscriber is registered under
    pub fn replace_patterns(&self, id: SubscriberId, patterns: Vec<PathPattern>) {
        let patterns = if patterns.is_empty() {
            vec![PathPattern::everything()]
        } else {
            patterns
        };
        let mut deferred = self.inner.deferred.lock();
        if deferred.depth > 0 {
            deferred.ops.push(PendingOp::Replace(id, patterns));
        } else {
            self.inner.state.lock().replace(id, patterns);
        }
    }

    /// Number of registered subscribers, excluding queued registrations
    pub fn len(&self) -> usize {
        self.inner.state.lock().subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a notification is currently running
    pub fn is_notifying(&self) -> bool {
        self.inner.deferred.lock().depth > 0
    }

    /// Ids of subscribers affected by any of `changed`, in firing order
    pub fn matching<'p>(&self, changed: impl IntoIterator<Item = &'p Path>) -> Vec<SubscriberId> {
        self.collect(changed).iter().map(|s| s.id).collect()
    }

    /// Deliver `event` to every active subscriber matching any changed path.
    ///
    /// Subscribers fire at most once per call, by descending priority then
    /// registration order. A panicking callback is logged and skipped.
    pub fn notify<'p>(&self, changed: impl IntoIterator<Item = &'p Path>, event: &E) -> NotifyReport {
        self.inner.deferred.lock().depth += 1;

        let targets = self.collect(changed);
        let mut report = NotifyReport {
            matched: targets.len(),
            ..Default::default()
        };

        for subscriber in targets {
            if !subscriber.is_active() {
                continue;
            }
            if !subscriber.try_claim() {
                trace!(id = subscriber.id, "Subscriber throttled");
                report.throttled += 1;
                continue;
            }
            let callback = Arc::clone(&subscriber.callback);
            match panic::catch_unwind(AssertUnwindSafe(|| callback(event))) {
                Ok(()) => report.fired += 1,
                Err(payload) => {
                    report.failed += 1;
                    warn!(
                        id = subscriber.id,
                        error = %panic_message(&*payload),
                        "Subscriber callback panicked"
                    );
                }
            }
        }

        let mut deferred = self.inner.deferred.lock();
        deferred.depth -= 1;
        if deferred.depth == 0 && !deferred.ops.is_empty() {
            let ops = std::mem::take(&mut deferred.ops);
            debug!(count = ops.len(), "Applying deferred subscription changes");
            let mut state = self.inner.state.lock();
            for op in ops {
                state.apply(op);
            }
        }

        report
    }

    fn collect<'p>(&self, changed: impl IntoIterator<Item = &'p Path>) -> Vec<Arc<Subscriber<E>>> {
        let state = self.inner.state.lock();
        let mut ids = HashSet::new();
        for path in changed {
            if path.is_wildcard() {
                ids.extend(state.subscribers.keys().copied());
                break;
            }
            state.root.collect(path.segments(), false, &mut ids);
        }

        let mut targets: Vec<Arc<Subscriber<E>>> = ids
            .into_iter()
            .filter_map(|id| state.subscribers.get(&id).cloned())
            .filter(|s| s.is_active())
            .collect();
        targets.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
        targets
    }
}

//! The state engine
//!
//! `StateEngine` owns the canonical snapshot and drives every other part of
//! the crate. One update runs through these steps:
//!
//! ```text
//! set_state(partial)
//!     │
//!     ├── merge into a new snapshot (untouched subtrees shared)
//!     ├── diff old vs new ───────────────► nothing changed: stop
//!     ├── commit snapshot
//!     ├── ComputedGraph::update ─────────► changed keys become `$computed.<key>`
//!     ├── ChangeFeed::publish (silent updates stop after this)
//!     └── UpdateScheduler::schedule ─────► flush: PathSubscriptionIndex::notify
//! ```
//!
//! Changes accumulate until the scheduled flush runs. Several updates in one
//! tick are therefore delivered as one batch, with one [`StateEvent`]
//! carrying the union of their changed paths.
//!
//! # Example
//!
//! ```rust,ignore
//! use reactive_state::prelude::*;
//!
//! let engine = StateEngine::builder(json!({ "count": 0 }))
//!     .computed("doubled", |s| Ok(Value::from(s.get("count").as_f64().unwrap_or(0.0) * 2.0)))
//!     .build()?;
//!
//! let _sub = engine.subscribe(&["count"], |event| println!("{}", event.state))?;
//! engine.set_state(json!({ "count": 5 }), SetStateOptions::default())?;
//! assert_eq!(engine.get_computed("doubled")?, Value::from(10));
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use state_store::{
    BoundedCache, ChangeEvent, ChangeFeed, ChangeIterator, ChangeSet, Comparator, ComparatorStats, DependencyTracker,
    Differ, Path, PathPattern, Tracked, Value, ValueError,
};
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::builder::EngineBuilder;
use crate::computed::{ComputeFn, ComputedGraph};
use crate::config::StoreConfig;
use crate::error::{ComputeError, Result, StoreError, TransitionError};
use crate::retry::{RetryContext, SafeExecutor};
use crate::scheduler::{Priority, ScheduleOptions, UpdateScheduler};
use crate::selector::{Selector, SelectorMemo, SelectorOptions};
use crate::subscription::{Disposer, PathSubscriptionIndex, SubscribeOptions};
use crate::transition::{AsyncOutcome, AsyncStatus, AsyncTransitionManager, Operation, StateSink};

/// Namespace computed value changes are published under
pub const COMPUTED_NAMESPACE: &str = "$computed";

/// Namespace async status changes are published under
pub const ASYNC_NAMESPACE: &str = "$async";

/// Scheduler id of the notification flush
const NOTIFY_JOB: &str = "state:notify";

/// `$computed.<key>`
pub fn computed_path(key: &str) -> Path {
    Path::key(COMPUTED_NAMESPACE).child(key)
}

/// `$async.<name>`
pub fn async_path(name: &str) -> Path {
    Path::key(ASYNC_NAMESPACE).child(name)
}

// ============================================================================
// Events and options
// ============================================================================

/// What a path subscriber receives
#[derive(Debug, Clone)]
pub struct StateEvent {
    /// Snapshot at delivery time
    pub state: Value,
    /// Union of every change since the previous delivery
    pub changes: ChangeSet,
    /// Computed values at delivery time
    pub computed: Arc<HashMap<String, Value>>,
}

impl StateEvent {
    pub fn touches(&self, path: &Path) -> bool {
        self.changes.is_wildcard()
            || self
                .changes
                .paths()
                .any(|changed| changed == path || changed.is_prefix_of(path) || path.is_prefix_of(changed))
    }

    pub fn computed(&self, key: &str) -> Option<&Value> {
        self.computed.get(key)
    }
}

/// Options for [`StateEngine::set_state`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SetStateOptions {
    /// Scheduler lane of the resulting notification
    pub priority: Priority,
    /// Scheduler id; defaults to the shared notification job
    pub id: Option<String>,
    /// Commit and publish to the change feed, but do not notify subscribers
    pub silent: bool,
    /// Write `partial` at this path instead of merging it at the top level
    pub path: Option<Path>,
}

impl SetStateOptions {
    pub fn silent() -> Self {
        Self {
            silent: true,
            ..Default::default()
        }
    }

    pub fn at(path: Path) -> Self {
        Self {
            path: Some(path),
            ..Default::default()
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

// ============================================================================
// StateEngine
// ============================================================================

pub(crate) struct EngineInner {
    config: StoreConfig,
    state: RwLock<Value>,
    /// Serializes commits; never held while subscribers run
    commit: Mutex<()>,
    comparator: Arc<Comparator>,
    tracker: DependencyTracker,
    graph: Mutex<ComputedGraph>,
    index: PathSubscriptionIndex<StateEvent>,
    scheduler: UpdateScheduler,
    transitions: AsyncTransitionManager,
    executor: SafeExecutor,
    feed: ChangeFeed,
    pending: Mutex<ChangeSet>,
    selector_memo: SelectorMemo,
}

/// Reactive state container
///
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct StateEngine {
    inner: Arc<EngineInner>,
}

impl StateEngine {
    /// Start building an engine around `initial`
    pub fn builder(initial: impl Into<Value>) -> EngineBuilder {
        EngineBuilder::new(initial)
    }

    /// Engine with default configuration and nothing registered
    pub fn new(initial: impl Into<Value>) -> Result<Self> {
        EngineBuilder::new(initial).build()
    }

    pub(crate) fn from_parts(
        initial: Value,
        config: StoreConfig,
        computed: Vec<(String, ComputeFn)>,
        operations: Vec<(String, Operation)>,
    ) -> Self {
        let comparator = Arc::new(Comparator::new(config.compare_options()));
        let tracker = DependencyTracker::new(config.tracker_options());

        let mut graph = ComputedGraph::new(tracker, Arc::clone(&comparator));
        for (key, func) in computed {
            graph.define(key, func);
        }
        if !graph.is_empty() {
            graph.evaluate_all(&initial);
        }

        let transitions = AsyncTransitionManager::new(config.watchdog_timeout);
        for (name, operation) in operations {
            transitions.register(name, operation);
        }

        let selector_memo = Arc::new(Mutex::new(match config.selector_cache_ttl {
            Some(ttl) => BoundedCache::with_ttl(config.selector_cache_capacity, ttl),
            None => BoundedCache::new(config.selector_cache_capacity),
        }));

        debug!(
            computed = graph.len(),
            flush_mode = ?config.flush_mode,
            "State engine created"
        );

        Self {
            inner: Arc::new(EngineInner {
                scheduler: UpdateScheduler::new(config.flush_mode),
                executor: SafeExecutor::new(config.retry.clone()),
                state: RwLock::new(initial),
                commit: Mutex::new(()),
                comparator,
                tracker,
                graph: Mutex::new(graph),
                index: PathSubscriptionIndex::new(),
                transitions,
                feed: ChangeFeed::new(),
                pending: Mutex::new(ChangeSet::new()),
                selector_memo,
                config,
            }),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    // ========================================================================
    // Reading
    // ========================================================================

    /// Current snapshot; O(1)
    pub fn get_state(&self) -> Value {
        self.inner.state.read().clone()
    }

    /// Value at `path` in the current snapshot
    pub fn get_path(&self, path: &str) -> Result<Option<Value>> {
        let path = Path::parse(path)?;
        Ok(self.inner.state.read().pointer(&path).cloned())
    }

    /// Cached computed value; never recomputes.
    ///
    /// A key that is part of a cycle and was never evaluated reads as `Null`.
    pub fn get_computed(&self, key: &str) -> Result<Value> {
        let graph = self.inner.graph.lock();
        if !graph.contains(key) {
            return Err(StoreError::UnknownComputed(key.to_string()));
        }
        Ok(graph.get(key).cloned().unwrap_or(Value::Null))
    }

    pub fn computed_keys(&self) -> Vec<String> {
        self.inner.graph.lock().keys().to_vec()
    }

    /// Evaluation order of computed values
    pub fn computed_order(&self) -> Vec<String> {
        self.inner.graph.lock().order()
    }

    /// Computed dependency cycles found by the last graph build
    pub fn computed_cycles(&self) -> Vec<Vec<String>> {
        self.inner.graph.lock().cycles()
    }

    // ========================================================================
    // Writing
    // ========================================================================

    /// Apply a partial update.
    ///
    /// Returns `Ok(false)` when the update changes nothing; the previous
    /// snapshot is kept as is in that case.
    pub fn set_state(&self, partial: impl Into<Value>, options: SetStateOptions) -> Result<bool> {
        let partial = partial.into();
        let changes = {
            let _commit = self.inner.commit.lock();
            let before = self.get_state();
            let (after, keys) = match &options.path {
                Some(path) if !path.is_root() && !path.is_wildcard() => {
                    let keys = path.first_key().map(|key| vec![key.to_string()]);
                    (before.with_path(path, partial)?, keys)
                }
                Some(_) => (partial, None),
                None => {
                    let keys = partial
                        .as_object()
                        .map(|fields| fields.keys().cloned().collect::<Vec<_>>());
                    (before.merge_top_level(&partial)?, keys)
                }
            };
            if after.as_object().is_none() {
                return Err(StoreError::InvalidUpdate(ValueError::NotAnObject(after.kind())));
            }
            self.commit(&before, after, keys.as_deref())
        };

        match changes {
            Some(changes) => {
                self.publish(changes, &options);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Swap the whole snapshot, diffing it like any other update
    pub fn replace_state(&self, state: impl Into<Value>) -> Result<bool> {
        let state = state.into();
        if state.as_object().is_none() {
            return Err(StoreError::InvalidUpdate(ValueError::NotAnObject(state.kind())));
        }
        let changes = {
            let _commit = self.inner.commit.lock();
            let before = self.get_state();
            self.commit(&before, state, None)
        };
        match changes {
            Some(changes) => {
                self.publish(changes, &SetStateOptions::default());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Retry `update` under the configured policy.
    ///
    /// `update` receives the current snapshot and returns a partial state.
    /// Returns `false` once the attempt budget is spent.
    pub async fn set_state_with_retry<F>(
        &self,
        context: RetryContext,
        mut update: F,
        options: SetStateOptions,
    ) -> bool
    where
        F: FnMut(&Value) -> Result<Value>,
    {
        self.inner
            .executor
            .run(
                &context,
                |_attempt| {
                    let result = update(&self.get_state())
                        .and_then(|partial| self.set_state(partial, options.clone()))
                        .map(|_| true);
                    async move { result }
                },
                false,
            )
            .await
    }

    /// Register (or replace) a computed value after construction
    pub fn define_computed<F>(&self, key: impl Into<String>, f: F)
    where
        F: Fn(&Tracked<'_>) -> std::result::Result<Value, ComputeError> + Send + Sync + 'static,
    {
        let key = key.into();
        let changes = {
            let _commit = self.inner.commit.lock();
            let state = self.get_state();
            let mut graph = self.inner.graph.lock();
            graph.define(key.clone(), Arc::new(f));
            let changed = graph.evaluate_all(&state);
            computed_changes(&changed)
        };
        if !changes.is_empty() {
            self.publish(changes, &SetStateOptions::default());
        }
    }

    /// Diff, store and propagate to computed values. Caller holds `commit`.
    fn commit(&self, before: &Value, after: Value, keys: Option<&[String]>) -> Option<ChangeSet> {
        let differ = Differ::new(&self.inner.comparator).with_structural_threshold(self.inner.config.structural_threshold);
        let mut changes = differ.diff(before, &after, keys);
        if changes.is_empty() {
            trace!("Update changed nothing");
            return None;
        }

        *self.inner.state.write() = after.clone();

        let full_reset = changes.structural || before.is_empty_object();
        let changed = self.inner.graph.lock().update(&changes, &after, full_reset);
        changes.merge(computed_changes(&changed));

        debug!(
            keys = changes.changed_keys.len(),
            paths = changes.changed_paths.len(),
            structural = changes.structural,
            computed = changed.len(),
            "State committed"
        );
        Some(changes)
    }

    /// Feed first, then subscribers unless silent
    fn publish(&self, changes: ChangeSet, options: &SetStateOptions) {
        self.inner.feed.publish(&ChangeEvent::new(&changes, options.silent));
        if options.silent {
            return;
        }

        self.inner.pending.lock().merge(changes);
        let schedule = ScheduleOptions {
            priority: options.priority,
            id: Some(options.id.clone().unwrap_or_else(|| NOTIFY_JOB.to_string())),
            replace: true,
        };
        let weak: Weak<EngineInner> = Arc::downgrade(&self.inner);
        self.inner.scheduler.schedule(schedule, move || {
            if let Some(inner) = weak.upgrade() {
                deliver(&inner);
            }
        });
    }

    /// Run pending notifications now. Returns the number of jobs run.
    pub fn flush(&self) -> usize {
        self.inner.scheduler.flush_immediately()
    }

    /// Blocking iterator over every committed change, silent ones included
    pub fn changes(&self) -> ChangeIterator {
        self.inner.feed.subscribe()
    }

    // ========================================================================
    // Subscribing
    // ========================================================================

    /// Call `callback` whenever anything under `patterns` changes.
    ///
    /// An empty pattern list subscribes to everything.
    pub fn subscribe(
        &self,
        patterns: &[&str],
        callback: impl Fn(&StateEvent) + Send + Sync + 'static,
    ) -> Result<Disposer> {
        self.subscribe_with(patterns, SubscribeOptions::default(), callback)
    }

    pub fn subscribe_with(
        &self,
        patterns: &[&str],
        options: SubscribeOptions,
        callback: impl Fn(&StateEvent) + Send + Sync + 'static,
    ) -> Result<Disposer> {
        let patterns = patterns
            .iter()
            .map(|pattern| PathPattern::parse(pattern))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(self.inner.index.subscribe(patterns, options, callback))
    }

    /// Call `callback` whenever the value derived by `select` changes
    pub fn subscribe_selector<S, C>(&self, select: S, options: SelectorOptions, callback: C) -> Disposer
    where
        S: Fn(&Tracked<'_>) -> std::result::Result<Value, ComputeError> + Send + Sync + 'static,
        C: Fn(&Value) + Send + Sync + 'static,
    {
        let selector = Arc::new(Selector::new(
            Arc::new(select),
            Arc::new(callback),
            options.equality,
            self.inner.tracker,
            Arc::clone(&self.inner.comparator),
            Arc::clone(&self.inner.selector_memo),
            self.inner.index.downgrade(),
        ));

        let state = self.get_state();
        let computed = self.inner.graph.lock().values_snapshot();
        let patterns = selector.initialize(&state, &computed);

        let listener = Arc::clone(&selector);
        let subscription = self
            .inner
            .index
            .subscribe(patterns, options.subscribe_options(), move |event| listener.on_event(event));
        let id = subscription.id();
        selector.attach(id, &state, &computed);

        if options.fire_immediately {
            selector.fire_current();
        }

        let memo = Arc::clone(&self.inner.selector_memo);
        Disposer::new(id, move || {
            memo.lock().delete(&id);
            subscription.dispose()
        })
    }

    /// Number of active subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.inner.index.len()
    }

    // ========================================================================
    // Async transitions
    // ========================================================================

    /// Invoke a registered operation and wait for it to settle
    pub async fn invoke_async(&self, name: &str, args: Vec<Value>) -> Result<AsyncOutcome> {
        let sink = EngineSink { engine: self };
        self.inner
            .transitions
            .invoke(name, args, &sink)
            .await
            .map_err(operation_error)
    }

    /// Invoke several operations with at most `limit` in flight
    pub async fn invoke_parallel(
        &self,
        calls: Vec<(String, Vec<Value>)>,
        limit: usize,
    ) -> Vec<(String, Result<AsyncOutcome>)> {
        let sink = EngineSink { engine: self };
        self.inner
            .transitions
            .invoke_parallel(calls, limit, &sink)
            .await
            .into_iter()
            .map(|(name, result)| (name, result.map_err(operation_error)))
            .collect()
    }

    pub fn get_async_status(&self, name: &str) -> AsyncStatus {
        self.inner.transitions.status(name)
    }

    pub fn watch_async_status(&self, name: &str) -> watch::Receiver<AsyncStatus> {
        self.inner.transitions.watch(name)
    }

    /// Register (or replace) an operation after construction
    pub fn register_operation(&self, name: impl Into<String>, operation: Operation) {
        self.inner.transitions.register(name, operation);
    }

    // ========================================================================
    // Diagnostics
    // ========================================================================

    pub fn comparator_stats(&self) -> ComparatorStats {
        self.inner.comparator.stats()
    }

    /// Notification jobs waiting for a flush
    pub fn pending_jobs(&self) -> usize {
        self.inner.scheduler.pending()
    }
}

impl std::fmt::Debug for StateEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateEngine")
            .field("state", &*self.inner.state.read())
            .field("subscribers", &self.inner.index.len())
            .field("scheduler", &self.inner.scheduler)
            .finish()
    }
}

/// Notify subscribers of everything accumulated since the last delivery
fn deliver(inner: &EngineInner) {
    let changes = std::mem::take(&mut *inner.pending.lock());
    if changes.is_empty() {
        return;
    }
    let event = StateEvent {
        state: inner.state.read().clone(),
        computed: Arc::new(inner.graph.lock().values_snapshot()),
        changes,
    };
    let report = inner.index.notify(event.changes.paths(), &event);
    debug!(
        matched = report.matched,
        fired = report.fired,
        throttled = report.throttled,
        failed = report.failed,
        "Notification batch delivered"
    );
}

/// Change set announcing updated computed keys
fn computed_changes(keys: &[String]) -> ChangeSet {
    let mut changes = ChangeSet::new();
    if keys.is_empty() {
        return changes;
    }
    changes.changed_keys.insert(COMPUTED_NAMESPACE.to_string());
    changes.changed_paths.insert(Path::key(COMPUTED_NAMESPACE));
    for key in keys {
        changes.changed_paths.insert(computed_path(key));
    }
    changes
}

fn operation_error(error: TransitionError) -> StoreError {
    match error {
        TransitionError::UnknownOperation(name) => StoreError::UnknownOperation(name),
        other => StoreError::Transition(other),
    }
}

/// Routes a transition's effects back into the engine
struct EngineSink<'a> {
    engine: &'a StateEngine,
}

impl StateSink for EngineSink<'_> {
    fn apply_partial(&self, name: &str, partial: Value) -> std::result::Result<Value, TransitionError> {
        trace!(operation = name, "Applying async result");
        self.engine
            .set_state(partial, SetStateOptions::default())
            .map(|_| self.engine.get_state())
            .map_err(|e| TransitionError::Rejected(e.to_string()))
    }

    fn status_changed(&self, name: &str, _status: &AsyncStatus) {
        let mut changes = ChangeSet::new();
        changes.changed_keys.insert(ASYNC_NAMESPACE.to_string());
        changes.changed_paths.insert(Path::key(ASYNC_NAMESPACE));
        changes.changed_paths.insert(async_path(name));
        self.engine.publish(changes, &SetStateOptions::default());
    }
}

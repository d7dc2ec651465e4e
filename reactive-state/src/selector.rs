//! Selector subscriptions
//!
//! A selector derives one value from the state. Its callback fires only when
//! that derived value changes, no matter how much of the state moved. The
//! paths it listens on are whatever the selector read on its last run, so a
//! selector that switches branches re-registers itself under the new paths.
//!
//! ```rust,ignore
//! let disposer = engine.subscribe_selector(
//!     |s| Ok(Value::from(s.get("todos").len())),
//!     SelectorOptions::default(),
//!     |count| println!("{} todos", count),
//! );
//! ```

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::Mutex;
use state_store::{
    BoundedCache, Comparator, ComputedSource, Dependencies, DependencyTracker, InputSnapshot, PathPattern, Tracked,
    Value,
};
use tracing::{debug, trace, warn};

use crate::engine::{computed_path, StateEvent};
use crate::error::ComputeError;
use crate::subscription::{SubscribeOptions, SubscriberId, WeakIndex};

/// Selector derivation
pub type SelectFn = Arc<dyn Fn(&Tracked<'_>) -> Result<Value, ComputeError> + Send + Sync>;

/// Receives each newly selected value
pub type SelectorCallback = Arc<dyn Fn(&Value) + Send + Sync>;

/// Shared memo of selector inputs, keyed by subscriber
pub(crate) type SelectorMemo = Arc<Mutex<BoundedCache<SubscriberId, InputSnapshot>>>;

/// How a new selected value is compared with the previous one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Equality {
    /// Fire unless the new value is the identical value
    Reference,
    /// Fire only when the new value differs structurally
    #[default]
    Deep,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SelectorOptions {
    pub equality: Equality,
    /// Call the callback once with the initial value on subscribe
    pub fire_immediately: bool,
    pub priority: i32,
    pub throttle: Option<Duration>,
}

impl SelectorOptions {
    pub fn fire_immediately(mut self) -> Self {
        self.fire_immediately = true;
        self
    }

    pub fn with_equality(mut self, equality: Equality) -> Self {
        self.equality = equality;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_throttle(mut self, throttle: Duration) -> Self {
        self.throttle = Some(throttle);
        self
    }

    pub(crate) fn subscribe_options(&self) -> SubscribeOptions {
        SubscribeOptions {
            priority: self.priority,
            throttle: self.throttle,
        }
    }
}

/// Patterns a subscriber with `dependencies` must listen on
pub(crate) fn listen_patterns(dependencies: &Dependencies) -> Vec<PathPattern> {
    if dependencies.is_everything() {
        return vec![PathPattern::everything()];
    }
    let consumed = if dependencies.reads().is_empty() {
        dependencies.paths()
    } else {
        dependencies.reads()
    };
    consumed
        .iter()
        .cloned()
        .chain(dependencies.computed().iter().map(|key| computed_path(key)))
        .map(PathPattern::from)
        .collect()
}

pub(crate) struct Selector {
    select: SelectFn,
    callback: SelectorCallback,
    equality: Equality,
    tracker: DependencyTracker,
    comparator: Arc<Comparator>,
    memo: SelectorMemo,
    index: WeakIndex<StateEvent>,
    id: OnceLock<SubscriberId>,
    last: Mutex<Option<Value>>,
    dependencies: Mutex<Dependencies>,
}

impl Selector {
    pub(crate) fn new(
        select: SelectFn,
        callback: SelectorCallback,
        equality: Equality,
        tracker: DependencyTracker,
        comparator: Arc<Comparator>,
        memo: SelectorMemo,
        index: WeakIndex<StateEvent>,
    ) -> Self {
        Self {
            select,
            callback,
            equality,
            tracker,
            comparator,
            memo,
            index,
            id: OnceLock::new(),
            last: Mutex::new(None),
            dependencies: Mutex::new(Dependencies::default()),
        }
    }

    /// First run; returns the patterns to subscribe under
    pub(crate) fn initialize(&self, state: &Value, computed: &dyn ComputedSource) -> Vec<PathPattern> {
        let dependencies = match self.run(state, computed) {
            Ok((value, dependencies)) => {
                *self.last.lock() = Some(value);
                dependencies
            }
            Err(error) => {
                warn!(error = %error, "Selector failed on first run, listening on everything");
                Dependencies::everything()
            }
        };
        let patterns = listen_patterns(&dependencies);
        *self.dependencies.lock() = dependencies;
        patterns
    }

    /// Record the id once the subscription exists
    pub(crate) fn attach(&self, id: SubscriberId, state: &Value, computed: &dyn ComputedSource) {
        if self.id.set(id).is_err() {
            return;
        }
        let snapshot = self.dependencies.lock().snapshot(state, computed);
        self.memo.lock().set(id, snapshot);
    }

    /// Deliver the last selected value, if any
    pub(crate) fn fire_current(&self) {
        let current = self.last.lock().clone();
        if let Some(value) = current {
            (self.callback)(&value);
        }
    }

    pub(crate) fn on_event(&self, event: &StateEvent) {
        let id = self.id.get().copied();
        let computed: &dyn ComputedSource = &*event.computed;

        if let Some(id) = id {
            let unchanged = self
                .memo
                .lock()
                .get(&id)
                .map(|snapshot| snapshot.unchanged(&event.state, computed))
                .unwrap_or(false);
            if unchanged {
                trace!(id, "Selector inputs unchanged");
                return;
            }
        }

        let (value, dependencies) = match self.run(&event.state, computed) {
            Ok(ran) => ran,
            Err(error) => {
                warn!(id = ?id, error = %error, "Selector failed, keeping previous value");
                if let Some(id) = id {
                    self.memo.lock().delete(&id);
                }
                self.update_dependencies(Dependencies::everything());
                return;
            }
        };

        if let Some(id) = id {
            let snapshot = dependencies.snapshot(&event.state, computed);
            self.memo.lock().set(id, snapshot);
        }
        self.update_dependencies(dependencies);

        let changed = {
            let mut last = self.last.lock();
            let same = last.as_ref().is_some_and(|previous| match self.equality {
                Equality::Reference => Value::identical(previous, &value),
                Equality::Deep => Value::identical(previous, &value) || self.comparator.equal(previous, &value),
            });
            if !same {
                *last = Some(value.clone());
            }
            !same
        };
        if changed {
            (self.callback)(&value);
        }
    }

    fn run(&self, state: &Value, computed: &dyn ComputedSource) -> Result<(Value, Dependencies), ComputeError> {
        let select = Arc::clone(&self.select);
        let tracking = self.tracker.track(state, computed, |view| select(view));
        match tracking.output {
            Ok(Ok(value)) => Ok((value, tracking.dependencies)),
            Ok(Err(error)) => Err(error),
            Err(message) => Err(ComputeError::Panicked(message)),
        }
    }

    fn update_dependencies(&self, dependencies: Dependencies) {
        let patterns = {
            let mut current = self.dependencies.lock();
            if current.same_edges(&dependencies) {
                *current = dependencies;
                return;
            }
            let patterns = listen_patterns(&dependencies);
            *current = dependencies;
            patterns
        };

        let (Some(id), Some(index)) = (self.id.get().copied(), self.index.upgrade()) else {
            return;
        };
        debug!(id, patterns = patterns.len(), "Selector dependencies changed, re-registering");
        index.replace_patterns(id, patterns);
    }
}

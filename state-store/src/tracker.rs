//! Read tracking for dependency discovery
//!
//! A derivation never sees a bare [`Value`]. It receives a [`Tracked`] view
//! whose accessors record every path they resolve. After the derivation
//! returns (or panics), the recorded [`Dependencies`] tell the engine exactly
//! which state paths and which other computed values it depends on.
//!
//! # Example
//!
//! ```rust
//! use std::collections::HashMap;
//! use state_store::{DependencyTracker, Path, Value};
//! use serde_json::json;
//!
//! let state = Value::from(json!({ "cart": { "items": [{ "price": 3 }, { "price": 4 }] }, "user": "ada" }));
//! let computed: HashMap<String, Value> = HashMap::new();
//!
//! let tracking = DependencyTracker::default().track(&state, &computed, |s| {
//!     s.get("cart")
//!         .get("items")
//!         .items()
//!         .iter()
//!         .filter_map(|item| item.get("price").as_f64())
//!         .sum::<f64>()
//! });
//!
//! assert_eq!(tracking.output, Ok(7.0));
//! assert!(tracking.dependencies.paths().contains(&Path::parse("cart.items[1].price").unwrap()));
//! assert!(!tracking.dependencies.paths().contains(&Path::key("user")));
//! ```
//!
//! # Architecture
//!
//! ```text
//! track(snapshot, computed_source, f)
//!     │
//!     ├── Recorder (RefCell sets: paths, reads, computed)
//!     │
//!     ├── Tracked::root ──get/at──▶ Tracked (child path, depth + 1)
//!     │                               │
//!     │                               └── past max wrap depth: raw view,
//!     │                                   path + first N child paths recorded
//!     │
//!     └── catch_unwind(f) ──▶ Tracking { output, dependencies }
//!                                 (empty dependencies become `*`)
//! ```

use std::cell::{Cell, RefCell};
use std::collections::{BTreeSet, HashMap};
use std::panic::{self, AssertUnwindSafe};

use tracing::{debug, warn};

use crate::path::Path;
use crate::value::Value;

/// Default maximum nesting depth for tracked views
pub const DEFAULT_MAX_WRAP_DEPTH: usize = 10;

/// Default number of child paths recorded past the wrap depth
pub const DEFAULT_FALLBACK_CHILD_DEPS: usize = 10;

/// Limits applied while tracking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerOptions {
    pub max_wrap_depth: usize,
    pub fallback_child_deps: usize,
}

impl Default for TrackerOptions {
    fn default() -> Self {
        Self {
            max_wrap_depth: DEFAULT_MAX_WRAP_DEPTH,
            fallback_child_deps: DEFAULT_FALLBACK_CHILD_DEPS,
        }
    }
}

/// Where tracked derivations read other computed values from
pub trait ComputedSource {
    fn computed_value(&self, key: &str) -> Option<Value>;
}

impl ComputedSource for HashMap<String, Value> {
    fn computed_value(&self, key: &str) -> Option<Value> {
        self.get(key).cloned()
    }
}

/// A source with no computed values
#[derive(Debug, Clone, Copy, Default)]
pub struct NoComputed;

impl ComputedSource for NoComputed {
    fn computed_value(&self, _key: &str) -> Option<Value> {
        None
    }
}

// ============================================================================
// Dependencies
// ============================================================================

/// What a tracked derivation was observed to read
#[derive(Debug, Clone, Default)]
pub struct Dependencies {
    paths: BTreeSet<Path>,
    reads: BTreeSet<Path>,
    computed: BTreeSet<String>,
}

impl Dependencies {
    /// Depends on everything (`*`)
    pub fn everything() -> Self {
        let all = BTreeSet::from([Path::wildcard()]);
        Self {
            paths: all.clone(),
            reads: all,
            computed: BTreeSet::new(),
        }
    }

    /// Add `*` while keeping every recorded path and computed edge
    pub fn widen(mut self) -> Self {
        self.paths.insert(Path::wildcard());
        self.reads.insert(Path::wildcard());
        self
    }

    /// Build from explicit paths; used for path-based subscriptions
    pub fn from_paths(paths: impl IntoIterator<Item = Path>) -> Self {
        let paths: BTreeSet<Path> = paths.into_iter().collect();
        if paths.is_empty() {
            return Self::everything();
        }
        Self {
            reads: paths.clone(),
            paths,
            computed: BTreeSet::new(),
        }
    }

    /// Every path resolved, including intermediate levels
    pub fn paths(&self) -> &BTreeSet<Path> {
        &self.paths
    }

    /// Paths whose value the derivation actually consumed
    pub fn reads(&self) -> &BTreeSet<Path> {
        &self.reads
    }

    /// Other computed keys read
    pub fn computed(&self) -> &BTreeSet<String> {
        &self.computed
    }

    pub fn is_everything(&self) -> bool {
        self.paths.iter().any(Path::is_wildcard)
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty() && self.computed.is_empty()
    }

    /// Same graph edges (state paths and computed keys), ignoring `reads`
    pub fn same_edges(&self, other: &Dependencies) -> bool {
        self.paths == other.paths && self.computed == other.computed
    }

    /// Does a change at `changed` touch anything this set depends on?
    pub fn touches(&self, changed: &Path) -> bool {
        if changed.is_wildcard() {
            return true;
        }
        self.paths
            .iter()
            .any(|dep| dep.is_wildcard() || dep == changed || dep.is_ancestor_of(changed))
    }

    /// Capture the identity of every consumed input
    pub fn snapshot(&self, state: &Value, source: &dyn ComputedSource) -> InputSnapshot {
        InputSnapshot {
            paths: self
                .reads
                .iter()
                .map(|path| (path.clone(), state.pointer(path).cloned()))
                .collect(),
            computed: self
                .computed
                .iter()
                .map(|key| (key.clone(), source.computed_value(key)))
                .collect(),
        }
    }
}

/// Identity of every input a derivation consumed on its last run
#[derive(Debug, Clone, Default)]
pub struct InputSnapshot {
    paths: Vec<(Path, Option<Value>)>,
    computed: Vec<(String, Option<Value>)>,
}

impl InputSnapshot {
    /// `true` when every input is still the identical value.
    ///
    /// A pure derivation rerun on identical inputs produces the same output,
    /// so callers may skip the rerun.
    pub fn unchanged(&self, state: &Value, source: &dyn ComputedSource) -> bool {
        self.paths
            .iter()
            .all(|(path, value)| Value::identical_opt(state.pointer(path), value.as_ref()))
            && self.computed.iter().all(|(key, value)| {
                Value::identical_opt(source.computed_value(key).as_ref(), value.as_ref())
            })
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty() && self.computed.is_empty()
    }
}

// ============================================================================
// Recorder and tracked views
// ============================================================================

struct Recorder<'a> {
    options: TrackerOptions,
    source: &'a dyn ComputedSource,
    paths: RefCell<BTreeSet<Path>>,
    reads: RefCell<BTreeSet<Path>>,
    computed: RefCell<BTreeSet<String>>,
    warned_write: Cell<bool>,
}

impl<'a> Recorder<'a> {
    fn new(options: TrackerOptions, source: &'a dyn ComputedSource) -> Self {
        Self {
            options,
            source,
            paths: RefCell::new(BTreeSet::new()),
            reads: RefCell::new(BTreeSet::new()),
            computed: RefCell::new(BTreeSet::new()),
            warned_write: Cell::new(false),
        }
    }

    fn visit(&self, path: &Path) {
        if !path.is_root() {
            self.paths.borrow_mut().insert(path.clone());
        }
    }

    fn consume(&self, path: &Path) {
        let path = if path.is_root() { Path::wildcard() } else { path.clone() };
        self.paths.borrow_mut().insert(path.clone());
        self.reads.borrow_mut().insert(path);
    }

    fn finish(self) -> Dependencies {
        let mut dependencies = Dependencies {
            paths: self.paths.into_inner(),
            reads: self.reads.into_inner(),
            computed: self.computed.into_inner(),
        };
        if dependencies.is_empty() {
            dependencies = Dependencies::everything();
        }
        dependencies
    }
}

/// A read-recording view of one location in a snapshot
///
/// Navigation (`get`, `at`) records the path it resolves. Accessors that hand
/// out data (`as_f64`, `value`, `keys`, ...) additionally mark the path as
/// consumed, which is what memoization compares on the next run.
#[derive(Clone)]
pub struct Tracked<'a> {
    recorder: &'a Recorder<'a>,
    path: Path,
    value: Option<&'a Value>,
    depth: usize,
    recording: bool,
}

impl<'a> Tracked<'a> {
    fn root(recorder: &'a Recorder<'a>, value: &'a Value) -> Self {
        Self {
            recorder,
            path: Path::root(),
            value: Some(value),
            depth: 0,
            recording: true,
        }
    }

    fn descend(&self, path: Path, value: Option<&'a Value>) -> Tracked<'a> {
        if !self.recording {
            return Tracked {
                recorder: self.recorder,
                path,
                value,
                depth: self.depth + 1,
                recording: false,
            };
        }

        let depth = self.depth + 1;
        let options = self.recorder.options;
        if depth > options.max_wrap_depth {
            debug!(path = %path, depth, "Tracking depth exceeded, recording path only");
            self.recorder.consume(&path);
            if let Some(value) = value {
                for child in value
                    .child_paths(&path)
                    .into_iter()
                    .take(options.fallback_child_deps)
                {
                    self.recorder.visit(&child);
                }
            }
            return Tracked {
                recorder: self.recorder,
                path,
                value,
                depth,
                recording: false,
            };
        }

        self.recorder.visit(&path);
        Tracked {
            recorder: self.recorder,
            path,
            value,
            depth,
            recording: true,
        }
    }

    fn consume(&self) {
        if self.recording {
            self.recorder.consume(&self.path);
        }
    }

    /// Path of this view relative to the state root
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Object field
    pub fn get(&self, key: &str) -> Tracked<'a> {
        let value = self.value.and_then(|v| v.get(key));
        self.descend(self.path.child(key), value)
    }

    /// Array element
    pub fn at(&self, index: usize) -> Tracked<'a> {
        let value = self.value.and_then(|v| v.get_index(index));
        self.descend(self.path.index(index), value)
    }

    /// Walk a whole path, recording each level
    pub fn at_path(&self, path: &Path) -> Tracked<'a> {
        path.segments().iter().fold(self.clone(), |view, segment| {
            let value = view.value.and_then(|v| v.child(segment));
            view.descend(view.path.join(segment.clone()), value)
        })
    }

    /// Value of another computed key, recording the edge
    pub fn computed(&self, key: &str) -> Option<Value> {
        self.recorder.computed.borrow_mut().insert(key.to_string());
        self.recorder.source.computed_value(key)
    }

    /// Raw value at this location. Reading the root depends on everything.
    pub fn value(&self) -> Option<&'a Value> {
        self.consume();
        self.value
    }

    /// Owned copy of the raw value, `Null` when absent
    pub fn cloned(&self) -> Value {
        self.value().cloned().unwrap_or_default()
    }

    pub fn exists(&self) -> bool {
        self.value().is_some()
    }

    pub fn is_null(&self) -> bool {
        self.value().map(Value::is_null).unwrap_or(true)
    }

    pub fn as_f64(&self) -> Option<f64> {
        self.value()?.as_f64()
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.value()?.as_i64()
    }

    pub fn as_bool(&self) -> Option<bool> {
        self.value()?.as_bool()
    }

    pub fn as_str(&self) -> Option<&'a str> {
        self.value()?.as_str()
    }

    pub fn len(&self) -> usize {
        self.value().map(Value::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Object keys in order
    pub fn keys(&self) -> Vec<String> {
        self.value()
            .and_then(Value::as_object)
            .map(|fields| fields.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Tracked views of every array element
    pub fn items(&self) -> Vec<Tracked<'a>> {
        self.consume();
        let len = self.value.and_then(Value::as_array).map(<[Value]>::len).unwrap_or(0);
        (0..len).map(|i| self.at(i)).collect()
    }

    /// Tracked views of every object field
    pub fn entries(&self) -> Vec<(String, Tracked<'a>)> {
        self.keys()
            .into_iter()
            .map(|key| {
                let view = self.get(&key);
                (key, view)
            })
            .collect()
    }

    /// Writes through a tracked view are ignored
    pub fn try_set(&self, _value: impl Into<Value>) -> bool {
        if !self.recorder.warned_write.replace(true) {
            warn!(path = %self.path, "Ignoring write through a read-only tracked view");
        }
        false
    }
}

impl std::fmt::Debug for Tracked<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracked")
            .field("path", &self.path.to_string())
            .field("value", &self.value)
            .field("depth", &self.depth)
            .finish()
    }
}

// ============================================================================
// Tracker
// ============================================================================

/// Outcome of a tracked run
#[derive(Debug)]
pub struct Tracking<T> {
    /// The derivation's result, or the panic message if it panicked
    pub output: Result<T, String>,
    /// Everything read before returning or panicking
    pub dependencies: Dependencies,
}

/// Runs derivations against tracked views
#[derive(Debug, Clone, Copy, Default)]
pub struct DependencyTracker {
    options: TrackerOptions,
}

impl DependencyTracker {
    pub fn new(options: TrackerOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> TrackerOptions {
        self.options
    }

    /// Run `f` against `snapshot`, recording what it reads.
    ///
    /// A panic inside `f` is caught; the dependencies gathered up to that
    /// point are still returned. An empty dependency set becomes `*`.
    pub fn track<T>(
        &self,
        snapshot: &Value,
        source: &dyn ComputedSource,
        f: impl FnOnce(&Tracked<'_>) -> T,
    ) -> Tracking<T> {
        let recorder = Recorder::new(self.options, source);
        let output = {
            let root = Tracked::root(&recorder, snapshot);
            panic::catch_unwind(AssertUnwindSafe(|| f(&root))).map_err(|payload| panic_message(&*payload))
        };
        Tracking {
            output,
            dependencies: recorder.finish(),
        }
    }
}

/// Best-effort text of a panic payload
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn path(s: &str) -> Path {
        Path::parse(s).unwrap()
    }

    fn state() -> Value {
        Value::from(json!({
            "user": { "name": "ada", "age": 36 },
            "todos": [{ "done": true }, { "done": false }],
            "flag": false
        }))
    }

    #[test]
    fn test_records_each_level() {
        let state = state();
        let tracking = DependencyTracker::default().track(&state, &NoComputed, |s| {
            s.get("user").get("name").as_str().map(str::to_string)
        });

        assert_eq!(tracking.output, Ok(Some("ada".to_string())));
        let deps = tracking.dependencies;
        assert!(deps.paths().contains(&path("user")));
        assert!(deps.paths().contains(&path("user.name")));
        assert_eq!(deps.reads().iter().collect::<Vec<_>>(), vec![&path("user.name")]);
    }

    #[test]
    fn test_items_records_elements() {
        let state = state();
        let tracking = DependencyTracker::default().track(&state, &NoComputed, |s| {
            s.get("todos")
                .items()
                .iter()
                .filter(|todo| todo.get("done").as_bool() == Some(true))
                .count()
        });

        assert_eq!(tracking.output, Ok(1));
        let deps = tracking.dependencies;
        assert!(deps.reads().contains(&path("todos")));
        assert!(deps.reads().contains(&path("todos[1].done")));
    }

    #[test]
    fn test_empty_dependencies_become_wildcard() {
        let tracking = DependencyTracker::default().track(&state(), &NoComputed, |_| 42);
        assert!(tracking.dependencies.is_everything());
    }

    #[test]
    fn test_reading_root_depends_on_everything() {
        let state = state();
        let tracking = DependencyTracker::default().track(&state, &NoComputed, |s| s.len());
        assert_eq!(tracking.output, Ok(3));
        assert!(tracking.dependencies.is_everything());
    }

    #[test]
    fn test_panic_keeps_partial_dependencies() {
        let state = state();
        let tracking: Tracking<()> = DependencyTracker::default().track(&state, &NoComputed, |s| {
            let _ = s.get("flag").as_bool();
            panic!("boom");
        });

        assert_eq!(tracking.output, Err("boom".to_string()));
        assert!(tracking.dependencies.paths().contains(&path("flag")));
        assert!(!tracking.dependencies.is_everything());
    }

    #[test]
    fn test_widen_keeps_recorded_edges() {
        let mut source = HashMap::new();
        source.insert("total".to_string(), Value::from(10));

        let tracking = DependencyTracker::default().track(&state(), &source, |s| {
            let _ = s.get("flag").as_bool();
            s.computed("total")
        });
        let widened = tracking.dependencies.widen();

        assert!(widened.is_everything());
        assert!(widened.paths().contains(&path("flag")));
        assert!(widened.computed().contains("total"));
    }

    #[test]
    fn test_computed_reads_are_recorded() {
        let mut source = HashMap::new();
        source.insert("total".to_string(), Value::from(10));

        let tracking = DependencyTracker::default().track(&state(), &source, |s| {
            s.computed("total").and_then(|v| v.as_f64()).unwrap_or(0.0) * 2.0
        });

        assert_eq!(tracking.output, Ok(20.0));
        assert!(tracking.dependencies.computed().contains("total"));
        assert!(tracking.dependencies.paths().is_empty());
    }

    #[test]
    fn test_depth_limit_records_path_and_children() {
        let deep = Value::from(json!({ "a": { "b": { "c": { "x": 1, "y": 2, "z": 3 } } } }));
        let tracker = DependencyTracker::new(TrackerOptions {
            max_wrap_depth: 2,
            fallback_child_deps: 2,
        });

        let tracking = tracker.track(&deep, &NoComputed, |s| {
            s.get("a").get("b").get("c").get("x").as_f64()
        });

        assert_eq!(tracking.output, Ok(Some(1.0)));
        let deps = tracking.dependencies;
        assert!(deps.reads().contains(&path("a.b.c")));
        assert!(deps.paths().contains(&path("a.b.c.x")));
        assert!(deps.paths().contains(&path("a.b.c.y")));
        assert!(!deps.paths().contains(&path("a.b.c.z")));
    }

    #[test]
    fn test_writes_are_ignored() {
        let state = state();
        let tracking = DependencyTracker::default().track(&state, &NoComputed, |s| s.get("flag").try_set(true));
        assert_eq!(tracking.output, Ok(false));
        assert_eq!(state.get("flag"), Some(&Value::from(false)));
    }

    #[test]
    fn test_touches() {
        let deps = Dependencies::from_paths([path("a.b")]);
        assert!(deps.touches(&path("a.b")));
        assert!(deps.touches(&path("a.b.c")));
        assert!(!deps.touches(&path("a.c")));
        assert!(!deps.touches(&path("a")));
        assert!(deps.touches(&Path::wildcard()));
    }

    #[test]
    fn test_snapshot_detects_identity_changes() {
        let state = state();
        let tracking = DependencyTracker::default().track(&state, &NoComputed, |s| s.get("user").get("age").as_f64());
        let snapshot = tracking.dependencies.snapshot(&state, &NoComputed);

        let unrelated = state.merge_top_level(&Value::from(json!({ "flag": true }))).unwrap();
        assert!(snapshot.unchanged(&unrelated, &NoComputed));

        let older = state
            .with_path(&path("user.age"), Value::from(37))
            .unwrap();
        assert!(!snapshot.unchanged(&older, &NoComputed));
    }
}

//! Computed values and their dependency graph
//!
//! Each computed value is a pure function of the state and of other computed
//! values. Its dependencies are never declared. They are observed by running
//! the function through the [`DependencyTracker`], first against an empty
//! state when the graph is built, then again on every evaluation. A function
//! that reads a path only on some branch therefore picks that dependency up
//! the first time the branch is taken.
//!
//! After an update only the affected subset is re-evaluated:
//!
//! 1. changed paths are looked up in a reverse index (path -> computed keys)
//! 2. computed keys reading an affected computed key are added transitively
//! 3. the affected keys run in topological order
//!
//! A key whose inputs are all still the identical values is skipped. A new
//! result replaces the cached one only when it differs structurally, so
//! dependents of a key that recomputed to an equal value see no change.
//!
//! Keys involved in a cycle are reported once per build, excluded from the
//! order and keep their last value.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use state_store::{
    ChangeSet, Comparator, ComputedSource, Dependencies, DependencyTracker, InputSnapshot, Path, Tracked, Value,
};
use tracing::{debug, trace, warn};

use crate::error::ComputeError;

/// A computed value's derivation
pub type ComputeFn = Arc<dyn Fn(&Tracked<'_>) -> Result<Value, ComputeError> + Send + Sync>;

struct ComputedNode {
    func: ComputeFn,
    value: Option<Value>,
    dependencies: Dependencies,
    memo: Option<InputSnapshot>,
    error: Option<ComputeError>,
}

/// Result of [`ComputedGraph::build_graph`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GraphBuild {
    /// Evaluation order, dependencies first; cyclic keys excluded
    pub order: Vec<String>,
    /// Each detected cycle, in discovery order
    pub cycles: Vec<Vec<String>>,
}

#[derive(Default)]
struct ReverseIndex {
    by_path: HashMap<Path, BTreeSet<String>>,
    everything: BTreeSet<String>,
    dependents: HashMap<String, BTreeSet<String>>,
}

/// Read-only view of the current computed values
struct NodeValues<'a>(&'a HashMap<String, ComputedNode>);

impl ComputedSource for NodeValues<'_> {
    fn computed_value(&self, key: &str) -> Option<Value> {
        self.0.get(key).and_then(|node| node.value.clone())
    }
}

/// Owns computed definitions, cached values and the dependency graph
pub struct ComputedGraph {
    tracker: DependencyTracker,
    comparator: Arc<Comparator>,
    keys: Vec<String>,
    nodes: HashMap<String, ComputedNode>,
    build: Option<GraphBuild>,
    cyclic: HashSet<String>,
    reverse: Option<ReverseIndex>,
    dirty: bool,
}

impl ComputedGraph {
    pub fn new(tracker: DependencyTracker, comparator: Arc<Comparator>) -> Self {
        Self {
            tracker,
            comparator,
            keys: Vec::new(),
            nodes: HashMap::new(),
            build: None,
            cyclic: HashSet::new(),
            reverse: None,
            dirty: true,
        }
    }

    /// Register a computed value; re-registering a key replaces it
    pub fn define(&mut self, key: impl Into<String>, func: ComputeFn) {
        let key = key.into();
        if !self.nodes.contains_key(&key) {
            self.keys.push(key.clone());
        }
        self.nodes.insert(
            key,
            ComputedNode {
                func,
                value: None,
                dependencies: Dependencies::default(),
                memo: None,
                error: None,
            },
        );
        self.build = None;
        self.reverse = None;
        self.dirty = true;
    }

    pub fn contains(&self, key: &str) -> bool {
        self.nodes.contains_key(key)
    }

    /// Keys in registration order
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Cached value; never recomputes
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.nodes.get(key)?.value.as_ref()
    }

    /// Error from the most recent failed evaluation of `key`
    pub fn last_error(&self, key: &str) -> Option<&ComputeError> {
        self.nodes.get(key)?.error.as_ref()
    }

    pub fn dependencies(&self, key: &str) -> Option<&Dependencies> {
        self.nodes.get(key).map(|node| &node.dependencies)
    }

    /// Every cached value, keyed by name
    pub fn values_snapshot(&self) -> HashMap<String, Value> {
        self.nodes
            .iter()
            .filter_map(|(key, node)| node.value.clone().map(|value| (key.clone(), value)))
            .collect()
    }

    /// Current evaluation order (empty before the first build)
    pub fn order(&self) -> Vec<String> {
        self.build.as_ref().map(|b| b.order.clone()).unwrap_or_default()
    }

    /// Cycles found by the last build
    pub fn cycles(&self) -> Vec<Vec<String>> {
        self.build.as_ref().map(|b| b.cycles.clone()).unwrap_or_default()
    }

    pub fn is_cyclic(&self, key: &str) -> bool {
        self.cyclic.contains(key)
    }

    // ========================================================================
    // Graph construction
    // ========================================================================

    /// Discover dependencies of never-evaluated keys and compute the order
    pub fn build_graph(&mut self) -> GraphBuild {
        let empty = Value::empty_object();
        let undiscovered: Vec<String> = self
            .keys
            .iter()
            .filter(|key| self.nodes.get(*key).map(|n| n.dependencies.is_empty()).unwrap_or(false))
            .cloned()
            .collect();

        for key in undiscovered {
            let Some(func) = self.nodes.get(&key).map(|node| Arc::clone(&node.func)) else {
                continue;
            };
            let tracking = self
                .tracker
                .track(&empty, &NodeValues(&self.nodes), |view| func(view));
            trace!(
                key = %key,
                paths = tracking.dependencies.paths().len(),
                computed = tracking.dependencies.computed().len(),
                "Discovered computed dependencies"
            );
            if let Some(node) = self.nodes.get_mut(&key) {
                node.dependencies = tracking.dependencies;
            }
        }

        let build = self.topological_order();
        if !build.cycles.is_empty() {
            let rendered: Vec<String> = build.cycles.iter().map(|cycle| cycle.join(" -> ")).collect();
            warn!(
                cycles = ?rendered,
                "Computed dependency cycle detected; affected keys will keep their last value"
            );
        }

        self.cyclic = build.cycles.iter().flatten().cloned().collect();
        self.build = Some(build.clone());
        self.reverse = None;
        self.dirty = false;
        debug!(order = ?build.order, "Computed graph built");
        build
    }

    fn topological_order(&self) -> GraphBuild {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        fn visit(
            graph: &ComputedGraph,
            key: &str,
            marks: &mut HashMap<String, Mark>,
            stack: &mut Vec<String>,
            result: &mut GraphBuild,
        ) {
            match marks.get(key) {
                Some(Mark::Done) => return,
                Some(Mark::Visiting) => {
                    if let Some(start) = stack.iter().position(|k| k == key) {
                        result.cycles.push(stack[start..].to_vec());
                    }
                    return;
                }
                None => {}
            }

            marks.insert(key.to_string(), Mark::Visiting);
            stack.push(key.to_string());
            if let Some(node) = graph.nodes.get(key) {
                for dependency in node.dependencies.computed() {
                    if graph.nodes.contains_key(dependency) {
                        visit(graph, dependency, marks, stack, result);
                    }
                }
            }
            stack.pop();
            marks.insert(key.to_string(), Mark::Done);
            result.order.push(key.to_string());
        }

        let mut marks = HashMap::new();
        let mut stack = Vec::new();
        let mut result = GraphBuild::default();
        for key in &self.keys {
            visit(self, key, &mut marks, &mut stack, &mut result);
        }

        let cyclic: HashSet<&String> = result.cycles.iter().flatten().collect();
        result.order.retain(|key| !cyclic.contains(key));
        result
    }

    fn reverse_index(&mut self) -> &ReverseIndex {
        if self.reverse.is_none() {
            let mut index = ReverseIndex::default();
            for (key, node) in &self.nodes {
                for path in node.dependencies.paths() {
                    if path.is_wildcard() {
                        index.everything.insert(key.clone());
                    } else {
                        index.by_path.entry(path.clone()).or_default().insert(key.clone());
                    }
                }
                for dependency in node.dependencies.computed() {
                    index.dependents.entry(dependency.clone()).or_default().insert(key.clone());
                }
            }
            self.reverse = Some(index);
        }
        self.reverse.get_or_insert_with(ReverseIndex::default)
    }

    // ========================================================================
    // Evaluation
    // ========================================================================

    /// Evaluate every key against `state`
    pub fn evaluate_all(&mut self, state: &Value) -> Vec<String> {
        self.update(&ChangeSet::everything(), state, true)
    }

    /// Re-evaluate the keys affected by `changes`.
    ///
    /// Returns the keys whose cached value changed, in evaluation order.
    pub fn update(&mut self, changes: &ChangeSet, state: &Value, full_reset: bool) -> Vec<String> {
        if self.nodes.is_empty() {
            return Vec::new();
        }
        let never_built = self.build.is_none();
        if never_built || self.dirty {
            self.build_graph();
        }

        let everything = never_built || full_reset || changes.structural || changes.is_wildcard();
        let order = self.order();
        let affected: HashSet<String> = if everything {
            order.iter().cloned().collect()
        } else {
            self.affected_keys(changes)
        };
        if affected.is_empty() {
            return Vec::new();
        }
        trace!(affected = affected.len(), everything, "Updating computed values");

        let mut changed = Vec::new();
        for key in order.iter().filter(|key| affected.contains(*key)) {
            if self.evaluate(key, state) {
                changed.push(key.clone());
            }
        }
        changed
    }

    fn affected_keys(&mut self, changes: &ChangeSet) -> HashSet<String> {
        let index = self.reverse_index();
        let mut affected: HashSet<String> = index.everything.iter().cloned().collect();
        for path in changes.paths() {
            if let Some(keys) = index.by_path.get(path) {
                affected.extend(keys.iter().cloned());
            }
        }

        let mut queue: VecDeque<String> = affected.iter().cloned().collect();
        while let Some(key) = queue.pop_front() {
            if let Some(dependents) = index.dependents.get(&key) {
                for dependent in dependents {
                    if affected.insert(dependent.clone()) {
                        queue.push_back(dependent.clone());
                    }
                }
            }
        }
        affected
    }

    /// Run one key; returns true when its cached value changed
    fn evaluate(&mut self, key: &str, state: &Value) -> bool {
        let (func, memo_hit) = {
            let Some(node) = self.nodes.get(key) else {
                return false;
            };
            let source = NodeValues(&self.nodes);
            let memo_hit = node
                .memo
                .as_ref()
                .map(|memo| memo.unchanged(state, &source))
                .unwrap_or(false);
            (Arc::clone(&node.func), memo_hit)
        };
        if memo_hit {
            trace!(key, "Computed inputs unchanged, skipping");
            return false;
        }

        let tracking = self
            .tracker
            .track(state, &NodeValues(&self.nodes), |view| func(view));
        let result = match tracking.output {
            Ok(result) => result,
            Err(message) => Err(ComputeError::Panicked(message)),
        };

        match result {
            Ok(value) => {
                let memo = tracking
                    .dependencies
                    .snapshot(state, &NodeValues(&self.nodes));
                let comparator = Arc::clone(&self.comparator);
                let Some(node) = self.nodes.get_mut(key) else {
                    return false;
                };
                let edges_changed = !node.dependencies.same_edges(&tracking.dependencies);
                node.dependencies = tracking.dependencies;
                node.memo = Some(memo);
                node.error = None;

                let unchanged = node
                    .value
                    .as_ref()
                    .map(|old| Value::identical(old, &value) || comparator.equal(old, &value))
                    .unwrap_or(false);
                if !unchanged {
                    node.value = Some(value);
                }
                if edges_changed {
                    debug!(key, "Computed dependencies changed");
                    self.reverse = None;
                    self.dirty = true;
                }
                !unchanged
            }
            Err(error) => {
                warn!(key, error = %error, "Computed evaluation failed, keeping previous value");
                let widened = tracking.dependencies.widen();
                if let Some(node) = self.nodes.get_mut(key) {
                    if !node.dependencies.same_edges(&widened) {
                        self.reverse = None;
                        self.dirty = true;
                    }
                    node.dependencies = widened;
                    node.memo = None;
                    node.error = Some(error);
                }
                false
            }
        }
    }
}

impl std::fmt::Debug for ComputedGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputedGraph")
            .field("keys", &self.keys)
            .field("order", &self.order())
            .field("cycles", &self.cycles())
            .field("dirty", &self.dirty)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;
    use state_store::Differ;

    fn graph() -> ComputedGraph {
        ComputedGraph::new(DependencyTracker::default(), Arc::new(Comparator::default()))
    }

    fn func(f: impl Fn(&Tracked<'_>) -> Result<Value, ComputeError> + Send + Sync + 'static) -> ComputeFn {
        Arc::new(f)
    }

    fn diff(before: &Value, after: &Value) -> ChangeSet {
        let comparator = Comparator::default();
        Differ::new(&comparator).diff(before, after, None)
    }

    /// Wraps `f` so each run appends `key` to `log`
    fn logged(
        log: &Arc<Mutex<Vec<String>>>,
        key: &str,
        f: impl Fn(&Tracked<'_>) -> Result<Value, ComputeError> + Send + Sync + 'static,
    ) -> ComputeFn {
        let log = Arc::clone(log);
        let key = key.to_string();
        Arc::new(move |view| {
            log.lock().push(key.clone());
            f(view)
        })
    }

    #[test]
    fn test_chained_values_recompute_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut graph = graph();
        // Registered before its dependency on purpose
        graph.define(
            "d",
            logged(&log, "d", |s| {
                Ok(Value::from(s.computed("c").and_then(|c| c.as_f64()).unwrap_or(0.0) + 1.0))
            }),
        );
        graph.define(
            "c",
            logged(&log, "c", |s| Ok(Value::from(s.get("x").as_f64().unwrap_or(0.0) * 10.0))),
        );

        let state = Value::from(json!({ "x": 1, "y": 1 }));
        graph.evaluate_all(&state);
        assert_eq!(graph.order(), vec!["c", "d"]);
        assert_eq!(graph.get("d"), Some(&Value::from(11)));

        log.lock().clear();
        let unrelated = state.merge_top_level(&Value::from(json!({ "y": 2 }))).unwrap();
        let changed = graph.update(&diff(&state, &unrelated), &unrelated, false);
        assert!(changed.is_empty());
        assert!(log.lock().is_empty());

        let related = unrelated.merge_top_level(&Value::from(json!({ "x": 2 }))).unwrap();
        let changed = graph.update(&diff(&unrelated, &related), &related, false);
        assert_eq!(changed, vec!["c", "d"]);
        assert_eq!(*log.lock(), vec!["c", "d"]);
        assert_eq!(graph.get("d"), Some(&Value::from(21)));
    }

    #[test]
    fn test_equal_result_does_not_propagate() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut graph = graph();
        graph.define(
            "positive",
            logged(&log, "positive", |s| Ok(Value::from(s.get("n").as_f64().unwrap_or(0.0) > 0.0))),
        );
        graph.define(
            "label",
            logged(&log, "label", |s| {
                let positive = s.computed("positive").and_then(|v| v.as_bool()).unwrap_or(false);
                Ok(Value::from(if positive { "yes" } else { "no" }))
            }),
        );

        let state = Value::from(json!({ "n": 1 }));
        graph.evaluate_all(&state);
        log.lock().clear();

        let next = state.merge_top_level(&Value::from(json!({ "n": 5 }))).unwrap();
        let changed = graph.update(&diff(&state, &next), &next, false);

        assert!(changed.is_empty());
        // label is affected transitively but its input is the identical value
        assert_eq!(*log.lock(), vec!["positive"]);
    }

    #[test]
    fn test_cycles_are_excluded() {
        let mut graph = graph();
        graph.define(
            "a",
            func(|s| Ok(s.computed("b").unwrap_or(Value::from(0)))),
        );
        graph.define(
            "b",
            func(|s| Ok(s.computed("a").unwrap_or(Value::from(0)))),
        );
        graph.define("c", func(|s| Ok(s.get("x").cloned())));

        let build = graph.build_graph();
        assert_eq!(build.order, vec!["c"]);
        assert_eq!(build.cycles, vec![vec!["a".to_string(), "b".to_string()]]);
        assert!(graph.is_cyclic("a") && graph.is_cyclic("b"));

        let state = Value::from(json!({ "x": 1 }));
        graph.evaluate_all(&state);
        assert_eq!(graph.get("a"), None);
        assert_eq!(graph.get("c"), Some(&Value::from(1)));
    }

    #[test]
    fn test_failure_keeps_previous_value_and_widens_dependencies() {
        let mut graph = graph();
        graph.define(
            "ratio",
            func(|s| {
                let d = s.get("d").as_f64().unwrap_or(0.0);
                if d == 0.0 {
                    return Err(ComputeError::failed("division by zero"));
                }
                Ok(Value::from(s.get("n").as_f64().unwrap_or(0.0) / d))
            }),
        );

        let state = Value::from(json!({ "n": 4, "d": 2 }));
        graph.evaluate_all(&state);
        assert_eq!(graph.get("ratio"), Some(&Value::from(2)));

        let zero = state.merge_top_level(&Value::from(json!({ "d": 0 }))).unwrap();
        assert!(graph.update(&diff(&state, &zero), &zero, false).is_empty());
        assert_eq!(graph.get("ratio"), Some(&Value::from(2)));
        assert!(graph.last_error("ratio").is_some());
        assert!(graph.dependencies("ratio").unwrap().is_everything());
    }

    #[test]
    fn test_failed_key_keeps_computed_edges() {
        let mut graph = graph();
        graph.define(
            "d",
            func(|s| {
                let c = s.computed("c").and_then(|c| c.as_f64()).unwrap_or(0.0);
                if s.get("fail").as_bool() == Some(true) {
                    return Err(ComputeError::failed("downstream failure"));
                }
                Ok(Value::from(c + 1.0))
            }),
        );
        graph.define("c", func(|s| Ok(Value::from(s.get("x").as_f64().unwrap_or(0.0) * 10.0))));

        let state = Value::from(json!({ "x": 1, "fail": false }));
        graph.evaluate_all(&state);

        let failing = state.merge_top_level(&Value::from(json!({ "fail": true }))).unwrap();
        graph.update(&diff(&state, &failing), &failing, false);
        let dependencies = graph.dependencies("d").unwrap();
        assert!(dependencies.is_everything());
        assert!(dependencies.computed().contains("c"));

        let recovered = failing
            .merge_top_level(&Value::from(json!({ "x": 2, "fail": false })))
            .unwrap();
        graph.update(&diff(&failing, &recovered), &recovered, false);
        assert_eq!(graph.order(), vec!["c", "d"]);
        assert_eq!(graph.get("d"), Some(&Value::from(21)));
    }

    #[test]
    fn test_panics_are_contained() {
        let mut graph = graph();
        graph.define("boom", func(|s| {
            if s.get("explode").as_bool() == Some(true) {
                panic!("exploded");
            }
            Ok(Value::from(1))
        }));

        let state = Value::from(json!({ "explode": false }));
        graph.evaluate_all(&state);

        let next = state.merge_top_level(&Value::from(json!({ "explode": true }))).unwrap();
        graph.update(&diff(&state, &next), &next, false);
        assert_eq!(graph.get("boom"), Some(&Value::from(1)));
        assert!(matches!(graph.last_error("boom"), Some(ComputeError::Panicked(_))));
    }

    #[test]
    fn test_conditional_dependency_is_picked_up_after_branch_flips() {
        let mut graph = graph();
        graph.define(
            "shown",
            func(|s| {
                if s.get("useX").as_bool().unwrap_or(false) {
                    Ok(s.get("x").cloned())
                } else {
                    Ok(s.get("y").cloned())
                }
            }),
        );

        let s0 = Value::from(json!({ "useX": false, "x": 1, "y": 2 }));
        graph.evaluate_all(&s0);
        assert!(!graph.dependencies("shown").unwrap().touches(&Path::key("x")));

        // Changing x is invisible while the branch reads y
        let s1 = s0.merge_top_level(&Value::from(json!({ "x": 10 }))).unwrap();
        assert!(graph.update(&diff(&s0, &s1), &s1, false).is_empty());

        // Flipping the branch re-runs and records x from now on
        let s2 = s1.merge_top_level(&Value::from(json!({ "useX": true }))).unwrap();
        assert_eq!(graph.update(&diff(&s1, &s2), &s2, false), vec!["shown"]);
        assert_eq!(graph.get("shown"), Some(&Value::from(10)));

        let s3 = s2.merge_top_level(&Value::from(json!({ "x": 11 }))).unwrap();
        assert_eq!(graph.update(&diff(&s2, &s3), &s3, false), vec!["shown"]);
        assert_eq!(graph.get("shown"), Some(&Value::from(11)));
    }

    #[test]
    fn test_structural_change_resets_everything() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut graph = graph();
        graph.define("a", logged(&log, "a", |s| Ok(s.get("a").cloned())));
        graph.define("b", logged(&log, "b", |s| Ok(s.get("b").cloned())));

        let state = Value::from(json!({ "a": 1, "b": 1 }));
        graph.evaluate_all(&state);
        log.lock().clear();

        let mut changes = ChangeSet::new();
        changes.structural = true;
        graph.update(&changes, &state, false);
        // Both considered, both skipped by identical inputs
        assert!(log.lock().is_empty());

        let next = Value::from(json!({ "a": 2, "b": 3 }));
        graph.update(&ChangeSet::everything(), &next, false);
        assert_eq!(*log.lock(), vec!["a", "b"]);
    }

    #[test]
    fn test_redefine_replaces_function() {
        let mut graph = graph();
        graph.define("k", func(|_| Ok(Value::from(1))));
        graph.define("k", func(|_| Ok(Value::from(2))));
        assert_eq!(graph.len(), 1);
        graph.evaluate_all(&Value::empty_object());
        assert_eq!(graph.get("k"), Some(&Value::from(2)));
    }
}

//! Path-level diffing between two state snapshots
//!
//! A [`ChangeSet`] lists the top-level keys and every path whose value differs
//! between two snapshots. When a whole subtree is added, removed or replaced
//! by a value of another kind, every descendant path of both the old and the
//! new subtree is listed too, so a subscriber on a deep path notices that
//! its ancestor was swapped out.
//!
//! Unchanged branches are skipped by reference before any deep comparison.

use std::collections::BTreeSet;

use crate::compare::{shape_delta, Comparator};
use crate::path::Path;
use crate::value::Value;

/// Default key-set / length delta above which a change counts as structural
pub const DEFAULT_STRUCTURAL_THRESHOLD: usize = 3;

/// Descendant synthesis stops below this many levels
const MAX_SYNTHESIS_DEPTH: usize = 64;

/// Result of diffing two snapshots
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    /// Top-level keys whose value changed
    pub changed_keys: BTreeSet<String>,
    /// Every changed path, including synthesized descendants
    pub changed_paths: BTreeSet<Path>,
    /// The shape of a changed object or array moved past the threshold
    pub structural: bool,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// A change set that matches everything
    pub fn everything() -> Self {
        Self {
            changed_keys: BTreeSet::new(),
            changed_paths: BTreeSet::from([Path::wildcard()]),
            structural: true,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.changed_keys.is_empty() && self.changed_paths.is_empty()
    }

    pub fn is_wildcard(&self) -> bool {
        self.changed_paths.iter().any(Path::is_wildcard)
    }

    pub fn contains_path(&self, path: &Path) -> bool {
        self.changed_paths.contains(path)
    }

    /// Fold `other` into `self`
    pub fn merge(&mut self, other: ChangeSet) {
        self.changed_keys.extend(other.changed_keys);
        self.changed_paths.extend(other.changed_paths);
        self.structural |= other.structural;
    }

    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.changed_paths.iter()
    }
}

/// Computes [`ChangeSet`]s with a shared [`Comparator`]
#[derive(Debug, Clone, Copy)]
pub struct Differ<'a> {
    comparator: &'a Comparator,
    structural_threshold: usize,
}

impl<'a> Differ<'a> {
    pub fn new(comparator: &'a Comparator) -> Self {
        Self {
            comparator,
            structural_threshold: DEFAULT_STRUCTURAL_THRESHOLD,
        }
    }

    pub fn with_structural_threshold(mut self, threshold: usize) -> Self {
        self.structural_threshold = threshold;
        self
    }

    /// Diff two snapshots.
    ///
    /// `keys` narrows the comparison to the given top-level keys (the keys of a
    /// partial update); `None` compares the union of both key sets.
    pub fn diff(&self, before: &Value, after: &Value, keys: Option<&[String]>) -> ChangeSet {
        let mut changes = ChangeSet::new();
        if Value::identical(before, after) {
            return changes;
        }

        let candidates: BTreeSet<&str> = match keys {
            Some(keys) => keys.iter().map(String::as_str).collect(),
            None => top_level_keys(before).chain(top_level_keys(after)).collect(),
        };

        for key in candidates {
            let old = before.get(key);
            let new = after.get(key);
            if Value::identical_opt(old, new) || self.comparator.equal_opt(old, new) {
                continue;
            }
            changes.changed_keys.insert(key.to_string());
            self.diff_node(&mut changes, Path::key(key), old, new);
        }

        if !changes.changed_keys.is_empty() && shape_delta(before, after).exceeds(self.structural_threshold) {
            changes.structural = true;
        }
        changes
    }

    fn diff_node(&self, changes: &mut ChangeSet, path: Path, old: Option<&Value>, new: Option<&Value>) {
        let null = Value::Null;
        let (before, after) = (old.unwrap_or(&null), new.unwrap_or(&null));

        if shape_delta(before, after).exceeds(self.structural_threshold) {
            changes.structural = true;
        }

        let same_container = matches!(
            (before, after),
            (Value::Object(_), Value::Object(_)) | (Value::Array(_), Value::Array(_))
        );

        if !same_container {
            synthesize(changes, &path, old, 0);
            synthesize(changes, &path, new, 0);
            changes.changed_paths.insert(path);
            return;
        }

        let mut children: BTreeSet<Path> = before.child_paths(&path).into_iter().collect();
        children.extend(after.child_paths(&path));
        changes.changed_paths.insert(path);

        for child in children {
            let segment = &child.segments()[child.len() - 1];
            let old_child = before.child(segment);
            let new_child = after.child(segment);
            if Value::identical_opt(old_child, new_child) || self.comparator.equal_opt(old_child, new_child) {
                continue;
            }
            self.diff_node(changes, child, old_child, new_child);
        }
    }
}

fn top_level_keys(value: &Value) -> impl Iterator<Item = &str> {
    value.as_object().into_iter().flat_map(|fields| fields.keys().map(String::as_str))
}

/// Record every descendant path of `value` under `path`
fn synthesize(changes: &mut ChangeSet, path: &Path, value: Option<&Value>, depth: usize) {
    let Some(value) = value else { return };
    if depth >= MAX_SYNTHESIS_DEPTH {
        return;
    }
    for child in value.child_paths(path) {
        let segment = &child.segments()[child.len() - 1];
        let next = value.child(segment);
        synthesize(changes, &child, next, depth + 1);
        changes.changed_paths.insert(child);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn v(json: serde_json::Value) -> Value {
        Value::from(json)
    }

    fn paths(changes: &ChangeSet) -> Vec<String> {
        changes.changed_paths.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn test_identical_snapshots_produce_nothing() {
        let comparator = Comparator::default();
        let state = v(json!({ "a": 1 }));
        assert!(Differ::new(&comparator).diff(&state, &state.clone(), None).is_empty());
    }

    #[test]
    fn test_equal_but_rebuilt_values_produce_nothing() {
        let comparator = Comparator::default();
        let before = v(json!({ "a": { "b": 1 } }));
        let after = before.merge_top_level(&v(json!({ "a": { "b": 1 } }))).unwrap();
        assert!(Differ::new(&comparator).diff(&before, &after, None).is_empty());
    }

    #[test]
    fn test_nested_change_lists_each_level() {
        let comparator = Comparator::default();
        let before = v(json!({ "a": { "b": 1, "c": 2 }, "z": 0 }));
        let after = v(json!({ "a": { "b": 5, "c": 2 }, "z": 0 }));

        let changes = Differ::new(&comparator).diff(&before, &after, None);
        assert_eq!(changes.changed_keys, BTreeSet::from(["a".to_string()]));
        assert_eq!(paths(&changes), vec!["a", "a.b"]);
        assert!(!changes.structural);
    }

    #[test]
    fn test_replaced_subtree_synthesizes_descendants() {
        let comparator = Comparator::default();
        let before = v(json!({ "a": { "b": { "c": 1 } } }));
        let after = v(json!({ "a": 7 }));

        let changes = Differ::new(&comparator).diff(&before, &after, None);
        assert_eq!(paths(&changes), vec!["a", "a.b", "a.b.c"]);
        assert!(changes.structural);
    }

    #[test]
    fn test_added_array_lists_elements() {
        let comparator = Comparator::default();
        let before = v(json!({}));
        let after = v(json!({ "list": [{ "id": 1 }, { "id": 2 }] }));

        let changes = Differ::new(&comparator).diff(&before, &after, None);
        assert_eq!(
            paths(&changes),
            vec!["list", "list[0]", "list[0].id", "list[1]", "list[1].id"]
        );
    }

    #[test]
    fn test_key_filter_limits_comparison() {
        let comparator = Comparator::default();
        let before = v(json!({ "a": 1, "b": 1 }));
        let after = v(json!({ "a": 2, "b": 2 }));

        let changes = Differ::new(&comparator).diff(&before, &after, Some(&["a".to_string()]));
        assert_eq!(paths(&changes), vec!["a"]);
    }

    #[test]
    fn test_structural_threshold() {
        let comparator = Comparator::default();
        let before = v(json!({ "a": { "x": 1 } }));
        let small = v(json!({ "a": { "x": 1, "y": 2 } }));
        let large = v(json!({ "a": { "x": 1, "p": 1, "q": 2, "r": 3, "s": 4 } }));

        let differ = Differ::new(&comparator);
        assert!(!differ.diff(&before, &small, None).structural);
        assert!(differ.diff(&before, &large, None).structural);
        assert!(differ.with_structural_threshold(0).diff(&before, &small, None).structural);
    }

    #[test]
    fn test_merge() {
        let mut first = ChangeSet::new();
        first.changed_keys.insert("a".into());
        let mut second = ChangeSet::everything();
        second.changed_keys.insert("b".into());
        first.merge(second);
        assert!(first.is_wildcard());
        assert!(first.structural);
        assert_eq!(first.changed_keys.len(), 2);
    }
}

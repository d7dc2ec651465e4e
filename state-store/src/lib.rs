//! Persistent State Primitives
//!
//! The runtime-free building blocks of the reactive engine: an immutable,
//! structurally shared value tree, path addressing, a cached deep comparator,
//! path-level diffing, read tracking for dependency discovery, and a bounded
//! LRU+TTL cache.
//!
//! # Features
//!
//! - **Structural sharing**: writes rebuild only the spine, untouched branches
//!   stay pointer-equal across snapshots
//! - **Path diffing**: exact changed paths plus synthesized descendants
//! - **Deep comparison**: depth-bounded, order-independent for maps/sets,
//!   cached per allocation pair
//! - **Read tracking**: derivations report exactly which paths they read
//! - **Change feed**: blocking iteration over committed changes
//!
//! # Quick Start
//!
//! ```rust
//! use state_store::{Comparator, Differ, Path, Value};
//! use serde_json::json;
//!
//! let before = Value::from(json!({ "todos": [{ "done": false }], "filter": "all" }));
//! let after = before
//!     .with_path(&Path::parse("todos[0].done").unwrap(), Value::from(true))
//!     .unwrap();
//!
//! let comparator = Comparator::default();
//! let changes = Differ::new(&comparator).diff(&before, &after, None);
//!
//! let changed: Vec<String> = changes.changed_paths.iter().map(|p| p.to_string()).collect();
//! assert_eq!(changed, vec!["todos", "todos[0]", "todos[0].done"]);
//! ```
//!
//! # Architecture
//!
//! ```text
//! Value (Arc-shared tree)
//!     │
//!     ├── Path / PathPattern ── addressing and subscription patterns
//!     │
//!     ├── Comparator ── deep_equal + BoundedCache<(id, id), bool>
//!     │       │
//!     │       └── Differ ── ChangeSet { changed_keys, changed_paths, structural }
//!     │
//!     ├── DependencyTracker ── Tracked views ── Dependencies / InputSnapshot
//!     │
//!     └── ChangeFeed ── ChangeEvent ── ChangeIterator
//! ```

// Modules
pub mod cache;
pub mod compare;
pub mod diff;
pub mod error;
pub mod event;
pub mod iter;
pub mod path;
pub mod tracker;
pub mod value;

// Re-exports - Public API
pub use cache::{BoundedCache, CacheStats};
pub use compare::{deep_equal, shape_delta, structural_delta, CompareOptions, Comparator, ComparatorStats, ShapeDelta};
pub use diff::{ChangeSet, Differ, DEFAULT_STRUCTURAL_THRESHOLD};
pub use error::{PathError, ValueError};
pub use event::ChangeEvent;
pub use iter::{ChangeFeed, ChangeIterator, TimeoutIter, TryIter};
pub use path::{Path, PathPattern, PatternSegment, Segment};
pub use tracker::{
    panic_message, ComputedSource, Dependencies, DependencyTracker, InputSnapshot, NoComputed, Tracked,
    TrackerOptions, Tracking,
};
pub use value::{Object, Pattern, Value, ValueKind};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::diff::ChangeSet;
    pub use crate::event::ChangeEvent;
    pub use crate::iter::ChangeIterator;
    pub use crate::path::{Path, PathPattern};
    pub use crate::tracker::Tracked;
    pub use crate::value::Value;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_full_workflow() {
        let comparator = Comparator::default();
        let feed = ChangeFeed::new();
        let changes = feed.subscribe();

        let before = Value::from(json!({ "count": 0, "user": { "name": "ada" } }));
        let after = before.merge_top_level(&Value::from(json!({ "count": 1 }))).unwrap();

        let diff = Differ::new(&comparator).diff(&before, &after, Some(&["count".to_string()]));
        feed.publish(&ChangeEvent::new(&diff, false));

        let event = changes.try_recv().unwrap();
        assert!(event.touches(&Path::key("count")));
        assert!(!event.touches(&Path::key("user")));
    }

    #[test]
    fn test_snapshot_clone_shares_state() {
        let first = Value::from(json!({ "nested": { "list": [1, 2, 3] } }));
        let second = first.clone();
        assert!(Value::identical(&first, &second));
    }

    #[test]
    fn test_tracked_derivation_matches_diff() {
        let comparator = Comparator::default();
        let before = Value::from(json!({ "x": 1, "y": 1 }));
        let tracking = DependencyTracker::default().track(&before, &NoComputed, |s| s.get("x").as_f64());

        let after = before.merge_top_level(&Value::from(json!({ "y": 2 }))).unwrap();
        let diff = Differ::new(&comparator).diff(&before, &after, None);

        assert!(!diff.paths().any(|p| tracking.dependencies.touches(p)));
    }
}

//! Change events for committed state updates
//!
//! Every accepted update produces one `ChangeEvent` describing which keys and
//! paths changed. Events carry no values. Read the new snapshot from the
//! store after receiving one.

use std::collections::BTreeSet;
use std::time::Instant;

use crate::diff::ChangeSet;
use crate::path::Path;

/// A committed change to the state snapshot
///
/// # Example
///
/// ```rust,ignore
/// for event in engine.changes() {
///     if event.touches(&Path::key("count")) {
///         println!("count is now {:?}", engine.get_path("count"));
///     }
/// }
/// ```
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    /// Top-level keys that changed
    pub changed_keys: BTreeSet<String>,

    /// Every changed path, including synthesized descendants
    pub changed_paths: BTreeSet<Path>,

    /// Whether the update changed the shape of the state
    pub structural: bool,

    /// The update was applied without notifying subscribers
    pub silent: bool,

    /// When the change was committed
    pub timestamp: Instant,
}

impl ChangeEvent {
    /// Create an event from a diff result
    pub fn new(changes: &ChangeSet, silent: bool) -> Self {
        Self::with_timestamp(changes, silent, Instant::now())
    }

    /// Create an event with a specific timestamp
    pub fn with_timestamp(changes: &ChangeSet, silent: bool, timestamp: Instant) -> Self {
        Self {
            changed_keys: changes.changed_keys.clone(),
            changed_paths: changes.changed_paths.clone(),
            structural: changes.structural,
            silent,
            timestamp,
        }
    }

    /// Did this change touch `path` or anything below it?
    pub fn touches(&self, path: &Path) -> bool {
        self.changed_paths
            .iter()
            .any(|changed| changed.is_wildcard() || path.is_prefix_of(changed))
    }
}

impl PartialEq for ChangeEvent {
    fn eq(&self, other: &Self) -> bool {
        // Timestamp not included in equality
        self.changed_keys == other.changed_keys
            && self.changed_paths == other.changed_paths
            && self.structural == other.structural
            && self.silent == other.silent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn changes(paths: &[&str]) -> ChangeSet {
        let mut changes = ChangeSet::new();
        for path in paths {
            let path = Path::parse(path).unwrap();
            if let Some(key) = path.first_key() {
                changes.changed_keys.insert(key.to_string());
            }
            changes.changed_paths.insert(path);
        }
        changes
    }

    #[test]
    fn test_change_event_creation() {
        let event = ChangeEvent::new(&changes(&["count"]), false);

        assert!(event.changed_keys.contains("count"));
        assert!(!event.structural);
        assert!(!event.silent);
    }

    #[test]
    fn test_change_event_equality() {
        let event1 = ChangeEvent::new(&changes(&["a", "a.b"]), false);
        let event2 = ChangeEvent::new(&changes(&["a", "a.b"]), false);
        let event3 = ChangeEvent::new(&changes(&["a", "a.c"]), false);
        let event4 = ChangeEvent::new(&changes(&["a", "a.b"]), true);

        // Same paths
        assert_eq!(event1, event2);

        // Different paths
        assert_ne!(event1, event3);

        // Different delivery
        assert_ne!(event1, event4);
    }

    #[test]
    fn test_touches() {
        let event = ChangeEvent::new(&changes(&["a", "a.b", "a.b.c"]), false);
        assert!(event.touches(&Path::parse("a.b").unwrap()));
        assert!(!event.touches(&Path::parse("a.x").unwrap()));

        let everything = ChangeEvent::new(&ChangeSet::everything(), false);
        assert!(everything.touches(&Path::parse("anything").unwrap()));
    }
}

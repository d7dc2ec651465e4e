//! Persistent value tree backing every state snapshot
//!
//! Composite values (`Array`, `Object`, `Map`, `Set`) live behind `Arc`, so
//! cloning a snapshot is O(1) and a write rebuilds only the spine between the
//! root and the written location. Untouched branches stay pointer-equal to the
//! previous snapshot, and that pointer identity is what the comparator cache
//! and memoized derivations key on.
//!
//! # Example
//!
//! ```rust
//! use state_store::{Path, Value};
//! use serde_json::json;
//!
//! let before = Value::from(json!({ "cart": { "items": [1, 2] }, "user": { "name": "ada" } }));
//! let after = before
//!     .with_path(&Path::parse("cart.items[1]").unwrap(), Value::from(5))
//!     .unwrap();
//!
//! assert_eq!(after.pointer(&Path::parse("cart.items[1]").unwrap()), Some(&Value::from(5)));
//! // `user` was never touched, so both snapshots share it
//! assert!(Value::identical(before.get("user").unwrap(), after.get("user").unwrap()));
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ValueError;
use crate::path::{Path, Segment};

/// Keyed record type used for objects
pub type Object = BTreeMap<String, Value>;

/// A regular-expression-like pattern, compared by canonical form
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Pattern {
    pub source: String,
    pub flags: String,
}

impl Pattern {
    pub fn new(source: impl Into<String>, flags: impl Into<String>) -> Self {
        let mut flags: Vec<char> = flags.into().chars().collect();
        flags.sort_unstable();
        flags.dedup();
        Self {
            source: source.into(),
            flags: flags.into_iter().collect(),
        }
    }

    /// `/source/flags` with flags in sorted order
    pub fn canonical(&self) -> String {
        format!("/{}/{}", self.source, self.flags)
    }
}

/// Discriminant of a [`Value`], used in errors and logs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Null,
    Bool,
    Number,
    String,
    Array,
    Object,
    Date,
    Pattern,
    Map,
    Set,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::Null => "null",
            ValueKind::Bool => "bool",
            ValueKind::Number => "number",
            ValueKind::String => "string",
            ValueKind::Array => "array",
            ValueKind::Object => "object",
            ValueKind::Date => "date",
            ValueKind::Pattern => "pattern",
            ValueKind::Map => "map",
            ValueKind::Set => "set",
        };
        f.write_str(name)
    }
}

/// An immutable node in the state tree
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(f64),
    String(Arc<str>),
    Array(Arc<Vec<Value>>),
    Object(Arc<Object>),
    /// Temporal value, compared by instant
    Date(DateTime<Utc>),
    /// Pattern value, compared by canonical representation
    Pattern(Arc<Pattern>),
    /// Keyed collection with arbitrary keys, compared order-independently
    Map(Arc<Vec<(Value, Value)>>),
    /// Unique-element collection, compared order-independently
    Set(Arc<Vec<Value>>),
}

/// Weak handle to a composite allocation.
///
/// Holding one keeps the allocation (not the value) alive, so the address it
/// was taken from cannot be handed to a different composite in the meantime.
#[derive(Debug, Clone)]
#[allow(dead_code)] // held only to pin the allocation
pub(crate) enum WeakNode {
    Items(Weak<Vec<Value>>),
    Fields(Weak<Object>),
    Entries(Weak<Vec<(Value, Value)>>),
}

impl Value {
    // ========================================================================
    // Construction
    // ========================================================================

    pub fn object<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        Value::Object(Arc::new(
            entries.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        ))
    }

    pub fn empty_object() -> Self {
        Value::Object(Arc::new(Object::new()))
    }

    pub fn array(items: Vec<Value>) -> Self {
        Value::Array(Arc::new(items))
    }

    pub fn map(entries: Vec<(Value, Value)>) -> Self {
        Value::Map(Arc::new(entries))
    }

    /// Build a set, dropping elements deep-equal to an earlier one
    pub fn set(items: Vec<Value>) -> Self {
        let mut unique: Vec<Value> = Vec::with_capacity(items.len());
        for item in items {
            if !unique.iter().any(|existing| existing == &item) {
                unique.push(item);
            }
        }
        Value::Set(Arc::new(unique))
    }

    pub fn date(at: DateTime<Utc>) -> Self {
        Value::Date(at)
    }

    pub fn pattern(source: impl Into<String>, flags: impl Into<String>) -> Self {
        Value::Pattern(Arc::new(Pattern::new(source, flags)))
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Null => ValueKind::Null,
            Value::Bool(_) => ValueKind::Bool,
            Value::Number(_) => ValueKind::Number,
            Value::String(_) => ValueKind::String,
            Value::Array(_) => ValueKind::Array,
            Value::Object(_) => ValueKind::Object,
            Value::Date(_) => ValueKind::Date,
            Value::Pattern(_) => ValueKind::Pattern,
            Value::Map(_) => ValueKind::Map,
            Value::Set(_) => ValueKind::Set,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Arrays, objects, maps and sets
    pub fn is_composite(&self) -> bool {
        matches!(
            self,
            Value::Array(_) | Value::Object(_) | Value::Map(_) | Value::Set(_)
        )
    }

    /// Values a [`Path`] can descend into
    pub fn is_container(&self) -> bool {
        matches!(self, Value::Array(_) | Value::Object(_))
    }

    /// Values that are read as a unit and never descended into by paths
    pub fn is_opaque(&self) -> bool {
        matches!(
            self,
            Value::Date(_) | Value::Pattern(_) | Value::Map(_) | Value::Set(_)
        )
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Number(n) if n.fract() == 0.0 && n.is_finite() => Some(*n as i64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items.as_slice()),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Object> {
        match self {
            Value::Object(fields) => Some(fields),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Date(at) => Some(*at),
            _ => None,
        }
    }

    /// Object field lookup
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_object()?.get(key)
    }

    /// Array element lookup
    pub fn get_index(&self, index: usize) -> Option<&Value> {
        self.as_array()?.get(index)
    }

    /// Single-segment lookup
    pub fn child(&self, segment: &Segment) -> Option<&Value> {
        match (self, segment) {
            (Value::Object(fields), Segment::Key(key)) => fields.get(key),
            (Value::Array(items), Segment::Index(index)) => items.get(*index),
            _ => None,
        }
    }

    /// Resolve a path against this value. The wildcard path resolves to `self`.
    pub fn pointer(&self, path: &Path) -> Option<&Value> {
        if path.is_wildcard() {
            return Some(self);
        }
        path.segments()
            .iter()
            .try_fold(self, |node, segment| node.child(segment))
    }

    /// Number of entries in a composite, 0 for everything else
    pub fn len(&self) -> usize {
        match self {
            Value::Array(items) | Value::Set(items) => items.len(),
            Value::Object(fields) => fields.len(),
            Value::Map(entries) => entries.len(),
            _ => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_empty_object(&self) -> bool {
        matches!(self, Value::Object(fields) if fields.is_empty())
    }

    /// Paths of the immediate children of this value, relative to `base`
    pub fn child_paths(&self, base: &Path) -> Vec<Path> {
        match self {
            Value::Object(fields) => fields.keys().map(|k| base.child(k)).collect(),
            Value::Array(items) => (0..items.len()).map(|i| base.index(i)).collect(),
            _ => Vec::new(),
        }
    }

    /// Reference identity for composites, value identity for scalars.
    ///
    /// This is the cheap `===`-style check: two separately built but equal
    /// objects are *not* identical.
    pub fn identical(a: &Value, b: &Value) -> bool {
        match (a, b) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(x), Value::Bool(y)) => x == y,
            (Value::Number(x), Value::Number(y)) => x == y,
            (Value::String(x), Value::String(y)) => Arc::ptr_eq(x, y) || x == y,
            (Value::Date(x), Value::Date(y)) => x == y,
            (Value::Pattern(x), Value::Pattern(y)) => Arc::ptr_eq(x, y),
            (Value::Array(x), Value::Array(y)) => Arc::ptr_eq(x, y),
            (Value::Set(x), Value::Set(y)) => Arc::ptr_eq(x, y),
            (Value::Object(x), Value::Object(y)) => Arc::ptr_eq(x, y),
            (Value::Map(x), Value::Map(y)) => Arc::ptr_eq(x, y),
            _ => false,
        }
    }

    /// [`Value::identical`] lifted over optional lookups
    pub fn identical_opt(a: Option<&Value>, b: Option<&Value>) -> bool {
        match (a, b) {
            (None, None) => true,
            (Some(a), Some(b)) => Value::identical(a, b),
            _ => false,
        }
    }

    /// Allocation address of a composite
    pub(crate) fn node_addr(&self) -> Option<usize> {
        match self {
            Value::Array(items) | Value::Set(items) => Some(Arc::as_ptr(items) as *const () as usize),
            Value::Object(fields) => Some(Arc::as_ptr(fields) as *const () as usize),
            Value::Map(entries) => Some(Arc::as_ptr(entries) as *const () as usize),
            _ => None,
        }
    }

    pub(crate) fn downgrade(&self) -> Option<WeakNode> {
        match self {
            Value::Array(items) | Value::Set(items) => Some(WeakNode::Items(Arc::downgrade(items))),
            Value::Object(fields) => Some(WeakNode::Fields(Arc::downgrade(fields))),
            Value::Map(entries) => Some(WeakNode::Entries(Arc::downgrade(entries))),
            _ => None,
        }
    }

    // ========================================================================
    // Writes (always produce a new tree)
    // ========================================================================

    /// Overwrite top-level keys of `self` with the keys of `partial`.
    ///
    /// Keys absent from `partial` keep their existing value by reference.
    pub fn merge_top_level(&self, partial: &Value) -> Result<Value, ValueError> {
        let updates = partial
            .as_object()
            .ok_or(ValueError::NotAnObject(partial.kind()))?;
        let mut fields = match self {
            Value::Object(fields) => (**fields).clone(),
            Value::Null => Object::new(),
            other => return Err(ValueError::NotAnObject(other.kind())),
        };
        for (key, value) in updates {
            fields.insert(key.clone(), value.clone());
        }
        Ok(Value::Object(Arc::new(fields)))
    }

    /// Return a copy with `value` written at `path`.
    ///
    /// Missing intermediate objects/arrays are created from `Null`; writing
    /// an index past the end of an array pads it with `Null`.
    pub fn with_path(&self, path: &Path, value: Value) -> Result<Value, ValueError> {
        if path.is_wildcard() || path.is_root() {
            return Ok(value);
        }
        write_at(self, path.segments(), value, path)
    }

    // ========================================================================
    // JSON interop
    // ========================================================================

    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as Json;
        match self {
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Number(n) => number_to_json(*n),
            Value::String(s) => Json::String(s.to_string()),
            Value::Array(items) | Value::Set(items) => {
                Json::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Object(fields) => Json::Object(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
            Value::Date(at) => Json::String(at.to_rfc3339()),
            Value::Pattern(pattern) => Json::String(pattern.canonical()),
            Value::Map(entries) => Json::Array(
                entries
                    .iter()
                    .map(|(k, v)| Json::Array(vec![k.to_json(), v.to_json()]))
                    .collect(),
            ),
        }
    }
}

fn write_at(node: &Value, segments: &[Segment], value: Value, path: &Path) -> Result<Value, ValueError> {
    let Some((head, rest)) = segments.split_first() else {
        return Ok(value);
    };

    match head {
        Segment::Key(key) => {
            let mut fields = match node {
                Value::Object(fields) => (**fields).clone(),
                Value::Null => Object::new(),
                Value::Array(_) => {
                    return Err(ValueError::SegmentMismatch {
                        path: path.to_string(),
                        segment: key.clone(),
                        kind: node.kind(),
                    })
                }
                other => {
                    return Err(ValueError::NotAContainer {
                        path: path.to_string(),
                        kind: other.kind(),
                    })
                }
            };
            let current = fields.get(key).cloned().unwrap_or_default();
            let updated = write_at(&current, rest, value, path)?;
            fields.insert(key.clone(), updated);
            Ok(Value::Object(Arc::new(fields)))
        }
        Segment::Index(index) => {
            let mut items = match node {
                Value::Array(items) => (**items).clone(),
                Value::Null => Vec::new(),
                Value::Object(_) => {
                    return Err(ValueError::SegmentMismatch {
                        path: path.to_string(),
                        segment: format!("[{}]", index),
                        kind: node.kind(),
                    })
                }
                other => {
                    return Err(ValueError::NotAContainer {
                        path: path.to_string(),
                        kind: other.kind(),
                    })
                }
            };
            if *index >= items.len() {
                items.resize(*index + 1, Value::Null);
            }
            let updated = write_at(&items[*index], rest, value, path)?;
            items[*index] = updated;
            Ok(Value::Array(Arc::new(items)))
        }
    }
}

fn number_to_json(n: f64) -> serde_json::Value {
    const MAX_SAFE: f64 = 9_007_199_254_740_991.0;
    if n.is_finite() && n.fract() == 0.0 && n.abs() <= MAX_SAFE {
        serde_json::Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null)
    }
}

// ============================================================================
// Equality, formatting, serde
// ============================================================================

/// Structural equality, order-independent for maps and sets.
///
/// Uncached; use [`crate::Comparator`] on hot paths.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        crate::compare::deep_equal(self, other)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Date(at) => write!(f, "Date({})", at.to_rfc3339()),
            Value::Pattern(p) => write!(f, "Pattern({})", p.canonical()),
            Value::Map(entries) => f.debug_map().entries(entries.iter().map(|(k, v)| (k, v))).finish(),
            Value::Set(items) => f.debug_set().entries(items.iter()).finish(),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        serde_json::Value::deserialize(deserializer).map(Value::from)
    }
}

// ============================================================================
// Conversions
// ============================================================================

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        use serde_json::Value as Json;
        match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(b),
            Json::Number(n) => n.as_f64().map(Value::Number).unwrap_or(Value::Null),
            Json::String(s) => Value::String(s.into()),
            Json::Array(items) => Value::array(items.into_iter().map(Value::from).collect()),
            Json::Object(fields) => {
                Value::object(fields.into_iter().map(|(k, v)| (k, Value::from(v))))
            }
        }
    }
}

impl From<Value> for serde_json::Value {
    fn from(value: Value) -> Self {
        value.to_json()
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

macro_rules! impl_from_number {
    ($($t:ty),*) => {
        $(
            impl From<$t> for Value {
                fn from(n: $t) -> Self {
                    Value::Number(n as f64)
                }
            }
        )*
    };
}

impl_from_number!(i8, i16, i32, i64, u8, u16, u32, u64, usize, isize, f32, f64);

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.into())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s.into())
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::array(items)
    }
}

impl From<Object> for Value {
    fn from(fields: Object) -> Self {
        Value::Object(Arc::new(fields))
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(at: DateTime<Utc>) -> Self {
        Value::Date(at)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        opt.map(Into::into).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn path(s: &str) -> Path {
        Path::parse(s).unwrap()
    }

    #[test]
    fn test_json_round_trip_preserves_integers() {
        let value = Value::from(json!({ "count": 5, "ratio": 0.5, "tags": ["a", "b"] }));
        assert_eq!(value.to_json(), json!({ "count": 5, "ratio": 0.5, "tags": ["a", "b"] }));
    }

    #[test]
    fn test_merge_top_level_shares_untouched_keys() {
        let state = Value::from(json!({ "a": { "x": 1 }, "b": { "y": 2 } }));
        let merged = state.merge_top_level(&Value::from(json!({ "a": 3 }))).unwrap();

        assert_eq!(merged.get("a"), Some(&Value::from(3)));
        assert!(Value::identical(state.get("b").unwrap(), merged.get("b").unwrap()));
    }

    #[test]
    fn test_merge_rejects_non_object_partial() {
        let state = Value::empty_object();
        let err = state.merge_top_level(&Value::from(1)).unwrap_err();
        assert_eq!(err, ValueError::NotAnObject(ValueKind::Number));
    }

    #[test]
    fn test_with_path_rebuilds_only_the_spine() {
        let state = Value::from(json!({
            "cart": { "items": [{ "price": 1 }, { "price": 2 }], "owner": { "id": 7 } },
            "user": { "name": "ada" }
        }));

        let updated = state.with_path(&path("cart.items[1].price"), Value::from(9)).unwrap();

        assert_eq!(updated.pointer(&path("cart.items[1].price")), Some(&Value::from(9)));
        assert!(Value::identical(
            state.pointer(&path("cart.owner")).unwrap(),
            updated.pointer(&path("cart.owner")).unwrap()
        ));
        assert!(Value::identical(
            state.pointer(&path("cart.items[0]")).unwrap(),
            updated.pointer(&path("cart.items[0]")).unwrap()
        ));
        assert!(!Value::identical(
            state.pointer(&path("cart")).unwrap(),
            updated.pointer(&path("cart")).unwrap()
        ));
    }

    #[test]
    fn test_with_path_creates_missing_containers() {
        let updated = Value::empty_object()
            .with_path(&path("a.list[2]"), Value::from("z"))
            .unwrap();
        assert_eq!(updated.to_json(), json!({ "a": { "list": [null, null, "z"] } }));
    }

    #[test]
    fn test_with_path_through_scalar_fails() {
        let state = Value::from(json!({ "count": 1 }));
        let err = state.with_path(&path("count.inner"), Value::from(2)).unwrap_err();
        assert!(matches!(err, ValueError::NotAContainer { kind: ValueKind::Number, .. }));
    }

    #[test]
    fn test_identical_is_reference_based_for_composites() {
        let a = Value::from(json!({ "x": 1 }));
        let b = Value::from(json!({ "x": 1 }));
        assert!(Value::identical(&a, &a.clone()));
        assert!(!Value::identical(&a, &b));
        assert_eq!(a, b);
    }

    #[test]
    fn test_set_constructor_drops_duplicates() {
        let set = Value::set(vec![Value::from(1), Value::from(2), Value::from(1)]);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_pattern_flags_are_canonicalized() {
        assert_eq!(Value::pattern("a+", "gi"), Value::pattern("a+", "ig"));
        assert_ne!(Value::pattern("a+", "g"), Value::pattern("a+", "i"));
    }

    #[test]
    fn test_pointer_wildcard_is_self() {
        let state = Value::from(json!({ "a": 1 }));
        assert!(Value::identical(state.pointer(&Path::wildcard()).unwrap(), &state));
    }
}

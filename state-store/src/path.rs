//! Paths and path patterns into the state tree
//!
//! A [`Path`] addresses one location: `.key` for object fields and `[i]` for
//! array elements, e.g. `cart.items[2].price`. The distinguished path `*`
//! means "everything".
//!
//! A [`PathPattern`] is what subscribers register. Besides concrete segments it
//! may contain `*` (exactly one segment) and a trailing `**` (one or more
//! segments). Concrete patterns match their own path and every descendant.
//!
//! ```rust
//! use state_store::{Path, PathPattern};
//!
//! let pattern = PathPattern::parse("todos.*").unwrap();
//! assert!(pattern.matches(&Path::parse("todos.first").unwrap()));
//! assert!(!pattern.matches(&Path::parse("todos.first.done").unwrap()));
//!
//! let deep = PathPattern::parse("todos.**").unwrap();
//! assert!(deep.matches(&Path::parse("todos.first.done").unwrap()));
//! ```

use std::fmt;
use std::str::FromStr;

use crate::error::PathError;

/// Textual form of the "everything" path
pub const WILDCARD: &str = "*";

/// Textual form of the multi-level wildcard
pub const DEEP_WILDCARD: &str = "**";

/// One step of a concrete path
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Segment {
    Key(String),
    Index(usize),
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Key(key) => f.write_str(key),
            Segment::Index(index) => write!(f, "[{}]", index),
        }
    }
}

/// A concrete location in the state tree
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Path {
    segments: Vec<Segment>,
    wildcard: bool,
}

impl Path {
    /// The empty path (the state root itself)
    pub fn root() -> Self {
        Self::default()
    }

    /// The "depends on everything" path
    pub fn wildcard() -> Self {
        Self {
            segments: Vec::new(),
            wildcard: true,
        }
    }

    /// Single top-level key
    pub fn key(key: impl Into<String>) -> Self {
        Self {
            segments: vec![Segment::Key(key.into())],
            wildcard: false,
        }
    }

    pub fn from_segments(segments: Vec<Segment>) -> Self {
        Self {
            segments,
            wildcard: false,
        }
    }

    /// Parse `a.b[2].c`; `""` is the root and `"*"` the wildcard path
    pub fn parse(input: &str) -> Result<Self, PathError> {
        let input = input.trim();
        if input.is_empty() {
            return Ok(Self::root());
        }
        if input == WILDCARD {
            return Ok(Self::wildcard());
        }

        let segments = tokenize(input)?
            .into_iter()
            .map(|raw| match raw {
                RawSegment::Key(key) => Ok(Segment::Key(key)),
                RawSegment::Index(index) => Ok(Segment::Index(index)),
                RawSegment::Wildcard | RawSegment::DeepWildcard => {
                    Err(PathError::UnexpectedWildcard(input.to_string()))
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self::from_segments(segments))
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_root(&self) -> bool {
        !self.wildcard && self.segments.is_empty()
    }

    pub fn is_wildcard(&self) -> bool {
        self.wildcard
    }

    /// The top-level state key this path lives under
    pub fn first_key(&self) -> Option<&str> {
        match self.segments.first() {
            Some(Segment::Key(key)) => Some(key),
            _ => None,
        }
    }

    pub fn child(&self, key: impl Into<String>) -> Path {
        self.join(Segment::Key(key.into()))
    }

    pub fn index(&self, index: usize) -> Path {
        self.join(Segment::Index(index))
    }

    pub fn join(&self, segment: Segment) -> Path {
        let mut segments = self.segments.clone();
        segments.push(segment);
        Path::from_segments(segments)
    }

    /// Parent path; `None` for the root, the wildcard and single-segment paths
    /// return the root.
    pub fn parent(&self) -> Option<Path> {
        if self.wildcard || self.segments.is_empty() {
            return None;
        }
        Some(Path::from_segments(
            self.segments[..self.segments.len() - 1].to_vec(),
        ))
    }

    /// Every proper ancestor, nearest last, excluding the root
    pub fn ancestors(&self) -> Vec<Path> {
        (1..self.segments.len())
            .map(|n| Path::from_segments(self.segments[..n].to_vec()))
            .collect()
    }

    /// `true` if `self` is `other` or one of its ancestors
    pub fn is_prefix_of(&self, other: &Path) -> bool {
        !self.wildcard
            && !other.wildcard
            && self.segments.len() <= other.segments.len()
            && other.segments[..self.segments.len()] == self.segments[..]
    }

    /// `true` if `self` is a proper ancestor of `other`
    pub fn is_ancestor_of(&self, other: &Path) -> bool {
        self.segments.len() < other.segments.len() && self.is_prefix_of(other)
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.wildcard {
            return f.write_str(WILDCARD);
        }
        for (i, segment) in self.segments.iter().enumerate() {
            match segment {
                Segment::Key(key) if i > 0 => write!(f, ".{}", key)?,
                Segment::Key(key) => f.write_str(key)?,
                Segment::Index(index) => write!(f, "[{}]", index)?,
            }
        }
        Ok(())
    }
}

impl FromStr for Path {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Path::parse(s)
    }
}

impl TryFrom<&str> for Path {
    type Error = PathError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Path::parse(s)
    }
}

// ============================================================================
// PathPattern
// ============================================================================

/// One step of a pattern
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PatternSegment {
    Exact(Segment),
    /// `*` - exactly one segment
    Wildcard,
    /// `**` - one or more segments, only as the last step
    DeepWildcard,
}

/// A subscription pattern
///
/// The empty pattern (written `*` or `**`) matches every change.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct PathPattern {
    segments: Vec<PatternSegment>,
}

impl PathPattern {
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn parse(input: &str) -> Result<Self, PathError> {
        let input = input.trim();
        if input.is_empty() || input == WILDCARD || input == DEEP_WILDCARD {
            return Ok(Self::everything());
        }

        let raw = tokenize(input)?;
        let last = raw.len() - 1;
        let mut segments = Vec::with_capacity(raw.len());
        for (i, segment) in raw.into_iter().enumerate() {
            segments.push(match segment {
                RawSegment::Key(key) => PatternSegment::Exact(Segment::Key(key)),
                RawSegment::Index(index) => PatternSegment::Exact(Segment::Index(index)),
                RawSegment::Wildcard => PatternSegment::Wildcard,
                RawSegment::DeepWildcard if i == last => PatternSegment::DeepWildcard,
                RawSegment::DeepWildcard => {
                    return Err(PathError::DeepWildcardNotTerminal(input.to_string()))
                }
            });
        }
        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[PatternSegment] {
        &self.segments
    }

    pub fn is_everything(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn has_wildcards(&self) -> bool {
        self.segments
            .iter()
            .any(|s| !matches!(s, PatternSegment::Exact(_)))
    }

    /// Would a subscriber registered under this pattern care about `changed`?
    ///
    /// - concrete patterns match the same path or any descendant
    /// - a trailing `*` matches exactly one more segment
    /// - a trailing `**` matches one or more further segments
    /// - the wildcard path `*` matches every pattern
    pub fn matches(&self, changed: &Path) -> bool {
        if changed.is_wildcard() || self.is_everything() {
            return true;
        }
        match_segments(&self.segments, changed.segments())
    }
}

fn match_segments(pattern: &[PatternSegment], path: &[Segment]) -> bool {
    let Some((head, rest)) = pattern.split_first() else {
        return true;
    };
    match head {
        PatternSegment::Exact(expected) => match path.split_first() {
            Some((actual, remaining)) if actual == expected => match_segments(rest, remaining),
            _ => false,
        },
        PatternSegment::Wildcard => match path.split_first() {
            Some((_, remaining)) if rest.is_empty() => remaining.is_empty(),
            Some((_, remaining)) => match_segments(rest, remaining),
            None => false,
        },
        PatternSegment::DeepWildcard => !path.is_empty(),
    }
}

impl From<Path> for PathPattern {
    fn from(path: Path) -> Self {
        if path.is_wildcard() {
            return Self::everything();
        }
        Self {
            segments: path
                .segments
                .into_iter()
                .map(PatternSegment::Exact)
                .collect(),
        }
    }
}

impl fmt::Display for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return f.write_str(WILDCARD);
        }
        for (i, segment) in self.segments.iter().enumerate() {
            let dot = if i > 0 { "." } else { "" };
            match segment {
                PatternSegment::Exact(Segment::Index(index)) => write!(f, "[{}]", index)?,
                PatternSegment::Exact(Segment::Key(key)) => write!(f, "{}{}", dot, key)?,
                PatternSegment::Wildcard => write!(f, "{}{}", dot, WILDCARD)?,
                PatternSegment::DeepWildcard => write!(f, "{}{}", dot, DEEP_WILDCARD)?,
            }
        }
        Ok(())
    }
}

impl FromStr for PathPattern {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PathPattern::parse(s)
    }
}

// ============================================================================
// Tokenizer shared by paths and patterns
// ============================================================================

enum RawSegment {
    Key(String),
    Index(usize),
    Wildcard,
    DeepWildcard,
}

fn raw_key(key: String) -> RawSegment {
    match key.as_str() {
        WILDCARD => RawSegment::Wildcard,
        DEEP_WILDCARD => RawSegment::DeepWildcard,
        _ => RawSegment::Key(key),
    }
}

fn tokenize(input: &str) -> Result<Vec<RawSegment>, PathError> {
    let mut segments = Vec::new();
    let mut key = String::new();
    let mut after_bracket = false;
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '.' => {
                if key.is_empty() && !after_bracket {
                    return Err(PathError::EmptySegment(input.to_string()));
                }
                if !key.is_empty() {
                    segments.push(raw_key(std::mem::take(&mut key)));
                }
                if chars.peek().is_none() {
                    return Err(PathError::EmptySegment(input.to_string()));
                }
                after_bracket = false;
            }
            '[' => {
                if !key.is_empty() {
                    segments.push(raw_key(std::mem::take(&mut key)));
                }
                let mut inner = String::new();
                loop {
                    match chars.next() {
                        Some(']') => break,
                        Some(ch) => inner.push(ch),
                        None => return Err(PathError::UnclosedBracket(input.to_string())),
                    }
                }
                let inner = inner.trim();
                let segment = match inner {
                    WILDCARD => RawSegment::Wildcard,
                    DEEP_WILDCARD => RawSegment::DeepWildcard,
                    _ => RawSegment::Index(inner.parse::<usize>().map_err(|_| {
                        PathError::InvalidIndex {
                            path: input.to_string(),
                            index: inner.to_string(),
                        }
                    })?),
                };
                segments.push(segment);
                after_bracket = true;
            }
            ']' => return Err(PathError::UnexpectedBracket(input.to_string())),
            other => {
                if after_bracket {
                    return Err(PathError::MissingSeparator(input.to_string()));
                }
                key.push(other);
            }
        }
    }

    if !key.is_empty() {
        segments.push(raw_key(key));
    }
    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("a", "a")]
    #[case("a.b.c", "a.b.c")]
    #[case("cart.items[2].price", "cart.items[2].price")]
    #[case("matrix[0][1]", "matrix[0][1]")]
    #[case(" spaced.key ", "spaced.key")]
    #[case("*", "*")]
    #[case("", "")]
    fn test_path_round_trip(#[case] input: &str, #[case] rendered: &str) {
        assert_eq!(Path::parse(input).unwrap().to_string(), rendered);
    }

    #[rstest]
    #[case("a..b")]
    #[case(".a")]
    #[case("a.")]
    #[case("a[1")]
    #[case("a]")]
    #[case("a[x]")]
    #[case("a[0]b")]
    #[case("a.*")]
    fn test_invalid_paths(#[case] input: &str) {
        assert!(Path::parse(input).is_err(), "expected {input:?} to be rejected");
    }

    #[test]
    fn test_segments_distinguish_keys_from_indices() {
        let keyed = Path::parse("a.0").unwrap();
        let indexed = Path::parse("a[0]").unwrap();
        assert_ne!(keyed, indexed);
        assert_eq!(indexed.segments()[1], Segment::Index(0));
    }

    #[test]
    fn test_parent_and_ancestors() {
        let path = Path::parse("a.b[1].c").unwrap();
        assert_eq!(path.parent().unwrap().to_string(), "a.b[1]");
        let ancestors: Vec<String> = path.ancestors().iter().map(|p| p.to_string()).collect();
        assert_eq!(ancestors, vec!["a", "a.b", "a.b[1]"]);
        assert!(Path::wildcard().parent().is_none());
    }

    #[test]
    fn test_prefix_relations() {
        let a = Path::parse("a").unwrap();
        let ab = Path::parse("a.b").unwrap();
        let ac = Path::parse("a.c").unwrap();
        assert!(a.is_ancestor_of(&ab));
        assert!(ab.is_prefix_of(&ab));
        assert!(!ab.is_ancestor_of(&ab));
        assert!(!ab.is_prefix_of(&ac));
    }

    #[rstest]
    #[case("a.b", "a.b", true)]
    #[case("a.b", "a.b.c", true)]
    #[case("a.b", "a.c", false)]
    #[case("a.b", "a", false)]
    #[case("a.*", "a.x", true)]
    #[case("a.*", "a.y", true)]
    #[case("a.*", "a.x.y", false)]
    #[case("a.*", "a", false)]
    #[case("a.**", "a.x", true)]
    #[case("a.**", "a.x.y", true)]
    #[case("a.**", "a", false)]
    #[case("a.*.done", "a.x.done", true)]
    #[case("a.*.done", "a.x.title", false)]
    #[case("list[*]", "list[3]", true)]
    #[case("*", "anything.at.all", true)]
    #[case("a.b", "*", true)]
    fn test_pattern_matching(#[case] pattern: &str, #[case] changed: &str, #[case] expected: bool) {
        let pattern = PathPattern::parse(pattern).unwrap();
        let changed = Path::parse(changed).unwrap();
        assert_eq!(pattern.matches(&changed), expected, "{pattern} vs {changed}");
    }

    #[test]
    fn test_deep_wildcard_must_be_last() {
        assert_eq!(
            PathPattern::parse("a.**.b"),
            Err(PathError::DeepWildcardNotTerminal("a.**.b".to_string()))
        );
    }

    #[test]
    fn test_pattern_display() {
        assert_eq!(PathPattern::parse("a.*.b[2]").unwrap().to_string(), "a.*.b[2]");
        assert_eq!(PathPattern::everything().to_string(), "*");
    }
}

//! Error types for the state-store crate.

use crate::value::ValueKind;

/// Errors produced while parsing a path or path pattern string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    /// Two separators in a row, or a leading/trailing separator
    #[error("Empty segment in path: {0}")]
    EmptySegment(String),

    /// A `[` without its matching `]`
    #[error("Unclosed bracket in path: {0}")]
    UnclosedBracket(String),

    /// A `]` with no opening bracket
    #[error("Unexpected closing bracket in path: {0}")]
    UnexpectedBracket(String),

    /// Bracket contents that are not an array index
    #[error("Invalid index '{index}' in path: {path}")]
    InvalidIndex {
        /// The full path being parsed
        path: String,
        /// The offending bracket contents
        index: String,
    },

    /// Text directly after a closing bracket without a `.`
    #[error("Missing separator after index in path: {0}")]
    MissingSeparator(String),

    /// `*` or `**` inside a concrete path
    #[error("Wildcards are only allowed in patterns: {0}")]
    UnexpectedWildcard(String),

    /// `**` followed by further segments
    #[error("Multi-level wildcard must be the last segment: {0}")]
    DeepWildcardNotTerminal(String),
}

/// Errors produced while writing into a value tree.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValueError {
    /// A partial update that is not an object
    #[error("Expected an object, found {0}")]
    NotAnObject(ValueKind),

    /// A write that has to pass through a scalar or opaque value
    #[error("Cannot write through {kind} at '{path}'")]
    NotAContainer {
        /// Path of the write
        path: String,
        /// Kind of the value in the way
        kind: ValueKind,
    },

    /// A key segment applied to an array or an index applied to an object
    #[error("Segment '{segment}' does not address a {kind} at '{path}'")]
    SegmentMismatch {
        /// Path of the write
        path: String,
        /// The mismatching segment
        segment: String,
        /// Kind of the value in the way
        kind: ValueKind,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_error_display() {
        let error = PathError::EmptySegment("a..b".to_string());
        assert_eq!(error.to_string(), "Empty segment in path: a..b");

        let error = PathError::InvalidIndex {
            path: "a[x]".to_string(),
            index: "x".to_string(),
        };
        assert_eq!(error.to_string(), "Invalid index 'x' in path: a[x]");
    }

    #[test]
    fn test_value_error_display() {
        let error = ValueError::NotAnObject(ValueKind::Number);
        assert_eq!(error.to_string(), "Expected an object, found number");

        let error = ValueError::NotAContainer {
            path: "count.x".to_string(),
            kind: ValueKind::Number,
        };
        assert!(error.to_string().contains("count.x"));
    }
}

//! Error types for reactive-state

use std::time::Duration;

use state_store::{Path, PathError, ValueError};

/// Result type for reactive-state operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors surfaced by the engine's public operations
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    /// Invalid configuration provided
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// `get_computed` for a key that was never registered
    #[error("Unknown computed value: {0}")]
    UnknownComputed(String),

    /// `invoke_async` for an operation that was never registered
    #[error("Unknown async operation: {0}")]
    UnknownOperation(String),

    /// A path string that does not parse
    #[error("Invalid path: {0}")]
    InvalidPath(#[from] PathError),

    /// A write the value tree rejected
    #[error("Invalid update: {0}")]
    InvalidUpdate(#[from] ValueError),

    /// A failed async transition
    #[error("Transition error: {0}")]
    Transition(#[from] TransitionError),
}

/// Errors from async transitions
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransitionError {
    /// The operation itself reported a failure
    #[error("Operation failed: {0}")]
    Failed(String),

    /// The watchdog fired before the operation settled
    #[error("Operation '{name}' timed out after {after:?}")]
    Timeout {
        /// Operation name
        name: String,
        /// Watchdog deadline
        after: Duration,
    },

    /// The call was cancelled before it produced a result
    #[error("Operation was cancelled")]
    Cancelled,

    /// The operation panicked
    #[error("Operation panicked: {0}")]
    Panicked(String),

    /// No operation registered under this name
    #[error("Unknown async operation: {0}")]
    UnknownOperation(String),

    /// The operation succeeded but its partial state could not be applied
    #[error("Could not apply result: {0}")]
    Rejected(String),
}

impl TransitionError {
    /// Convenience constructor for operation failures
    pub fn failed(message: impl Into<String>) -> Self {
        TransitionError::Failed(message.into())
    }

    /// Raised by the watchdog rather than by the operation
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransitionError::Timeout { .. })
    }
}

/// Errors from computed values and selectors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ComputeError {
    /// The derivation reported a failure
    #[error("Computation failed: {0}")]
    Failed(String),

    /// A required input was absent
    #[error("Missing input at '{0}'")]
    Missing(Path),

    /// The derivation panicked
    #[error("Computation panicked: {0}")]
    Panicked(String),
}

impl ComputeError {
    pub fn failed(message: impl Into<String>) -> Self {
        ComputeError::Failed(message.into())
    }
}

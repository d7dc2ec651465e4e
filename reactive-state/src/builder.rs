//! Builder for creating and configuring a StateEngine.
//!
//! # Example
//!
//! ```rust,ignore
//! use reactive_state::{operation, StateEngine, StoreConfig, Value};
//!
//! let engine = StateEngine::builder(json!({ "count": 0, "todos": [] }))
//!     .computed("doubled", |s| Ok(Value::from(s.get("count").as_f64().unwrap_or(0.0) * 2.0)))
//!     .operation("load", operation(|_args, _signal| async { fetch_todos().await }))
//!     .config(StoreConfig::default().with_watchdog_timeout(Duration::from_secs(10)))
//!     .build()?;
//! ```

use std::sync::Arc;

use state_store::{Tracked, Value, ValueError};

use crate::computed::ComputeFn;
use crate::config::StoreConfig;
use crate::engine::StateEngine;
use crate::error::{ComputeError, Result, StoreError};
use crate::transition::Operation;

/// Builder for creating and configuring a [`StateEngine`].
///
/// # Validation
///
/// `build()` fails when:
/// - the configuration does not pass [`StoreConfig::validate`]
/// - the initial state is not an object (`Null` is accepted as `{}`)
pub struct EngineBuilder {
    initial: Value,
    computed: Vec<(String, ComputeFn)>,
    operations: Vec<(String, Operation)>,
    config: StoreConfig,
}

impl EngineBuilder {
    /// Create a new builder with default configuration
    pub fn new(initial: impl Into<Value>) -> Self {
        Self {
            initial: initial.into(),
            computed: Vec::new(),
            operations: Vec::new(),
            config: StoreConfig::default(),
        }
    }

    /// Register a computed value.
    ///
    /// Registering the same key twice keeps the last definition. Declaration
    /// order does not matter; evaluation follows the discovered dependencies.
    pub fn computed<F>(mut self, key: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Tracked<'_>) -> std::result::Result<Value, ComputeError> + Send + Sync + 'static,
    {
        let key = key.into();
        self.computed.retain(|(existing, _)| *existing != key);
        self.computed.push((key, Arc::new(f)));
        self
    }

    /// Register a named async operation
    pub fn operation(mut self, name: impl Into<String>, operation: Operation) -> Self {
        let name = name.into();
        self.operations.retain(|(existing, _)| *existing != name);
        self.operations.push((name, operation));
        self
    }

    /// Replace the configuration
    pub fn config(mut self, config: StoreConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the engine, evaluating every computed value once
    pub fn build(self) -> Result<StateEngine> {
        self.config.validate()?;

        let initial = match self.initial {
            Value::Null => Value::empty_object(),
            value @ Value::Object(_) => value,
            other => {
                return Err(StoreError::InvalidUpdate(ValueError::NotAnObject(other.kind())));
            }
        };

        Ok(StateEngine::from_parts(
            initial,
            self.config,
            self.computed,
            self.operations,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_build_with_defaults() {
        let engine = EngineBuilder::new(json!({ "a": 1 })).build().unwrap();
        assert_eq!(engine.get_state(), Value::from(json!({ "a": 1 })));
    }

    #[test]
    fn test_null_initial_state_is_empty_object() {
        let engine = EngineBuilder::new(Value::Null).build().unwrap();
        assert!(engine.get_state().is_empty_object());
    }

    #[test]
    fn test_rejects_scalar_initial_state() {
        let result = EngineBuilder::new(json!(3)).build();
        assert!(matches!(result, Err(StoreError::InvalidUpdate(_))));
    }

    #[test]
    fn test_rejects_invalid_config() {
        let config = StoreConfig {
            max_wrap_depth: 0,
            ..StoreConfig::default()
        };
        let result = EngineBuilder::new(json!({})).config(config).build();
        assert!(matches!(result, Err(StoreError::Configuration(_))));
    }

    #[test]
    fn test_duplicate_computed_keeps_last() {
        let engine = EngineBuilder::new(json!({}))
            .computed("k", |_| Ok(Value::from(1)))
            .computed("k", |_| Ok(Value::from(2)))
            .build()
            .unwrap();
        assert_eq!(engine.computed_keys(), vec!["k".to_string()]);
        assert_eq!(engine.get_computed("k").unwrap(), Value::from(2));
    }
}

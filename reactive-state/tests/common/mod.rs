//! Shared helpers for reactive-state integration tests

#![allow(dead_code)]

use std::sync::Arc;

use parking_lot::Mutex;
use reactive_state::{EngineBuilder, StateEngine, StateEvent, StoreConfig, Value};

/// Builder preconfigured for deterministic tests
pub fn builder(initial: serde_json::Value) -> EngineBuilder {
    StateEngine::builder(initial).config(StoreConfig::testing())
}

pub fn engine(initial: serde_json::Value) -> StateEngine {
    builder(initial).build().expect("valid test engine")
}

pub fn value(json: serde_json::Value) -> Value {
    Value::from(json)
}

/// Collects every delivered event
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<StateEvent>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn callback(&self) -> impl Fn(&StateEvent) + Send + Sync + 'static {
        let events = Arc::clone(&self.events);
        move |event: &StateEvent| events.lock().push(event.clone())
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn last(&self) -> Option<StateEvent> {
        self.events.lock().last().cloned()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

/// Collects values handed to a selector callback
#[derive(Clone, Default)]
pub struct ValueLog {
    values: Arc<Mutex<Vec<Value>>>,
}

impl ValueLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn callback(&self) -> impl Fn(&Value) + Send + Sync + 'static {
        let values = Arc::clone(&self.values);
        move |value: &Value| values.lock().push(value.clone())
    }

    pub fn values(&self) -> Vec<Value> {
        self.values.lock().clone()
    }
}

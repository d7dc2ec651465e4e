//! Reactive State Engine
//!
//! An in-process state container that knows exactly which parts of its state
//! each consumer depends on. Consumers never declare dependencies: computed
//! values and selectors are run against read-tracking views, and the paths
//! they read decide when they are re-run or notified.
//!
//! # Features
//!
//! - **Partial updates**: `set_state` merges and diffs; unchanged subtrees stay shared
//! - **Computed values**: discovered dependencies, topological re-evaluation,
//!   cycle detection
//! - **Path subscriptions**: `a.b`, `a.*`, `a.**` patterns backed by a trie
//! - **Selector subscriptions**: fire only when the selected value changes
//! - **Batching**: updates in one tick produce one notification batch
//! - **Async transitions**: pending/error/loaded status, superseded calls
//!   discarded, watchdog timeouts
//! - **Safe execute**: bounded retry with backoff and a fallback value
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use reactive_state::prelude::*;
//! use serde_json::json;
//!
//! let engine = StateEngine::builder(json!({ "count": 0 }))
//!     .computed("doubled", |s| Ok(Value::from(s.get("count").as_f64().unwrap_or(0.0) * 2.0)))
//!     .build()?;
//!
//! let _sub = engine.subscribe(&["count"], |event| {
//!     println!("count changed: {:?}", event.state.get("count"));
//! })?;
//!
//! engine.set_state(json!({ "count": 5 }), SetStateOptions::default())?;
//! assert_eq!(engine.get_computed("doubled")?, Value::from(10));
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         StateEngine                          │
//! │  snapshot ── Differ ── ComputedGraph ── ChangeFeed           │
//! │                │                                             │
//! │          UpdateScheduler ── PathSubscriptionIndex            │
//! │                                  ├── path subscribers        │
//! │                                  └── selectors               │
//! │  AsyncTransitionManager ── SafeExecutor                      │
//! └──────────────────────────────────────────────────────────────┘
//!                              │
//!                      state-store (Value, Path, Comparator,
//!                      BoundedCache, DependencyTracker)
//! ```
//!
//! # Logging
//!
//! The engine emits `tracing` events only. Hosts opt in with
//! [`logging::init_logging`] or by installing their own subscriber.

// Modules
pub mod builder;
pub mod computed;
pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod retry;
pub mod scheduler;
pub mod selector;
pub mod subscription;
pub mod transition;

// Re-exports - Public API
pub use builder::EngineBuilder;
pub use computed::{ComputeFn, ComputedGraph, GraphBuild};
pub use config::{FlushMode, RetryPolicy, StoreConfig};
pub use engine::{
    async_path, computed_path, SetStateOptions, StateEngine, StateEvent, ASYNC_NAMESPACE, COMPUTED_NAMESPACE,
};
pub use error::{ComputeError, Result, StoreError, TransitionError};
pub use logging::{init_logging, init_logging_from_env, LoggingError, LoggingMode};
pub use retry::{RetryContext, SafeExecutor};
pub use scheduler::{Priority, ScheduleOptions, SchedulerStats, UpdateScheduler};
pub use selector::{Equality, SelectFn, SelectorCallback, SelectorOptions};
pub use subscription::{Callback, Disposer, NotifyReport, PathSubscriptionIndex, SubscribeOptions, SubscriberId};
pub use transition::{
    operation, AsyncOutcome, AsyncStatus, AsyncTransitionManager, CancelReason, CancelSignal, Operation,
    OperationFuture, StateSink,
};

// Re-export the primitives callers work with directly
pub use state_store::{ChangeEvent, ChangeIterator, ChangeSet, Path, PathPattern, Tracked, Value};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::config::{FlushMode, StoreConfig};
    pub use crate::engine::{SetStateOptions, StateEngine, StateEvent};
    pub use crate::error::{ComputeError, Result, StoreError};
    pub use crate::selector::SelectorOptions;
    pub use crate::transition::{operation, AsyncOutcome, AsyncStatus, CancelSignal};
    pub use state_store::{Path, Tracked, Value};
}

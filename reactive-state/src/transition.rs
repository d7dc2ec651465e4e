//! Cancellable async state transitions
//!
//! An operation is a named async function that resolves to a partial state.
//! Per name, at most one call is "current": starting a new call supersedes
//! the previous one, which is signalled to stop and whose result, when it
//! eventually arrives, goes back to its own caller without touching state or
//! status. Recency is decided by invocation order, not completion order.
//!
//! ```text
//!  invoke("load") #1 ──► pending ─────────────── settles ──► discarded (superseded)
//!  invoke("load") #2 ────────► pending ── settles ─────────► merged, loaded
//! ```
//!
//! Every current call also gets a watchdog. If the call is still pending when
//! it fires, the call fails with [`TransitionError::Timeout`], which is
//! distinct from errors the operation returns itself.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;
use state_store::{panic_message, Value};
use tokio::sync::{watch, Notify};
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::error::TransitionError;

// ============================================================================
// Status
// ============================================================================

/// Per-operation status
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AsyncStatus {
    /// A current call is in flight
    pub pending: bool,
    /// Error of the last settled current call
    pub error: Option<TransitionError>,
    /// The last settled current call succeeded
    pub loaded: bool,
}

impl AsyncStatus {
    fn pending(previous: &AsyncStatus) -> Self {
        Self {
            pending: true,
            error: None,
            loaded: previous.loaded,
        }
    }

    fn loaded() -> Self {
        Self {
            pending: false,
            error: None,
            loaded: true,
        }
    }

    fn failed(error: TransitionError) -> Self {
        Self {
            pending: false,
            error: Some(error),
            loaded: false,
        }
    }

    pub fn is_idle(&self) -> bool {
        !self.pending && self.error.is_none() && !self.loaded
    }
}

// ============================================================================
// Cancellation
// ============================================================================

/// Why a call was told to stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// A newer call for the same operation started
    Superseded,
    /// The watchdog fired
    Timeout,
}

struct SignalInner {
    reason: Mutex<Option<CancelReason>>,
    notify: Notify,
}

/// Cooperative cancellation handed to every operation call
///
/// Operations may poll [`is_cancelled`](Self::is_cancelled) or race their
/// work against [`cancelled`](Self::cancelled). Ignoring the signal is
/// allowed; a superseded result is discarded either way.
#[derive(Clone)]
pub struct CancelSignal {
    inner: Arc<SignalInner>,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SignalInner {
                reason: Mutex::new(None),
                notify: Notify::new(),
            }),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.reason.lock().is_some()
    }

    pub fn reason(&self) -> Option<CancelReason> {
        *self.inner.reason.lock()
    }

    /// Resolves once the call is cancelled
    pub async fn cancelled(&self) -> CancelReason {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(reason) = self.reason() {
                return reason;
            }
            notified.await;
        }
    }

    /// Resolves only if the watchdog cancels the call
    async fn timed_out(&self) {
        if self.cancelled().await != CancelReason::Timeout {
            futures::future::pending::<()>().await;
        }
    }

    /// First reason wins; returns `false` if already cancelled
    pub(crate) fn cancel(&self, reason: CancelReason) -> bool {
        {
            let mut current = self.inner.reason.lock();
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
        }
        self.inner.notify.notify_waiters();
        true
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelSignal").field("reason", &self.reason()).finish()
    }
}

// ============================================================================
// Operations and outcomes
// ============================================================================

/// Future returned by an operation
pub type OperationFuture = BoxFuture<'static, Result<Value, TransitionError>>;

/// A registered async operation
pub type Operation = Arc<dyn Fn(Vec<Value>, CancelSignal) -> OperationFuture + Send + Sync>;

/// Wrap an async closure as an [`Operation`]
pub fn operation<F, Fut>(f: F) -> Operation
where
    F: Fn(Vec<Value>, CancelSignal) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, TransitionError>> + Send + 'static,
{
    Arc::new(move |args, signal| f(args, signal).boxed())
}

/// What a settled call reports to its caller
#[derive(Debug, Clone, PartialEq)]
pub enum AsyncOutcome {
    /// For the current call `state` is the full state after the merge; for a
    /// superseded call it is the operation's own, unapplied result.
    Success { state: Value, superseded: bool },
    Failure { error: TransitionError, superseded: bool },
}

impl AsyncOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, AsyncOutcome::Success { .. })
    }

    pub fn is_superseded(&self) -> bool {
        match self {
            AsyncOutcome::Success { superseded, .. } | AsyncOutcome::Failure { superseded, .. } => *superseded,
        }
    }

    pub fn state(&self) -> Option<&Value> {
        match self {
            AsyncOutcome::Success { state, .. } => Some(state),
            AsyncOutcome::Failure { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&TransitionError> {
        match self {
            AsyncOutcome::Success { .. } => None,
            AsyncOutcome::Failure { error, .. } => Some(error),
        }
    }
}

/// Where a current call's effects go
pub trait StateSink: Send + Sync {
    /// Merge a successful result; returns the resulting full state
    fn apply_partial(&self, name: &str, partial: Value) -> Result<Value, TransitionError>;

    /// Status of `name` changed
    fn status_changed(&self, name: &str, status: &AsyncStatus);
}

// ============================================================================
// Manager
// ============================================================================

/// Cleared when the `invoke` future settles or is dropped
struct Listening(Arc<AtomicBool>);

impl Drop for Listening {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct InFlight {
    call_id: u64,
    signal: CancelSignal,
    watchdog: Option<AbortHandle>,
}

struct Slot {
    status: watch::Sender<AsyncStatus>,
    latest: u64,
    in_flight: Option<InFlight>,
}

impl Slot {
    fn new() -> Self {
        let (status, _rx) = watch::channel(AsyncStatus::default());
        Self {
            status,
            latest: 0,
            in_flight: None,
        }
    }
}

struct ManagerInner {
    operations: DashMap<String, Operation>,
    slots: Mutex<HashMap<String, Slot>>,
    next_call: AtomicU64,
    watchdog_timeout: Duration,
}

/// Runs named operations with supersede and watchdog semantics
#[derive(Clone)]
pub struct AsyncTransitionManager {
    inner: Arc<ManagerInner>,
}

impl AsyncTransitionManager {
    pub fn new(watchdog_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                operations: DashMap::new(),
                slots: Mutex::new(HashMap::new()),
                next_call: AtomicU64::new(0),
                watchdog_timeout,
            }),
        }
    }

    pub fn register(&self, name: impl Into<String>, operation: Operation) {
        self.inner.operations.insert(name.into(), operation);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.operations.contains_key(name)
    }

    pub fn watchdog_timeout(&self) -> Duration {
        self.inner.watchdog_timeout
    }

    /// Current status; idle for names never invoked
    pub fn status(&self, name: &str) -> AsyncStatus {
        self.inner
            .slots
            .lock()
            .get(name)
            .map(|slot| slot.status.borrow().clone())
            .unwrap_or_default()
    }

    /// Receiver that observes every status change of `name`
    pub fn watch(&self, name: &str) -> watch::Receiver<AsyncStatus> {
        self.inner
            .slots
            .lock()
            .entry(name.to_string())
            .or_insert_with(Slot::new)
            .status
            .subscribe()
    }

    pub fn is_in_flight(&self, name: &str) -> bool {
        self.inner
            .slots
            .lock()
            .get(name)
            .map(|slot| slot.in_flight.is_some())
            .unwrap_or(false)
    }

    /// Invoke `name` and wait for it to settle.
    ///
    /// Only an unregistered name is an error; everything the operation does
    /// is reported through [`AsyncOutcome`].
    pub async fn invoke(
        &self,
        name: &str,
        args: Vec<Value>,
        sink: &dyn StateSink,
    ) -> Result<AsyncOutcome, TransitionError> {
        let operation = self
            .inner
            .operations
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| TransitionError::UnknownOperation(name.to_string()))?;

        let call_id = self.inner.next_call.fetch_add(1, Ordering::Relaxed) + 1;
        let signal = CancelSignal::new();
        let listening = Listening(Arc::new(AtomicBool::new(true)));
        let pending = self.begin(name, call_id, &signal, &listening.0);
        sink.status_changed(name, &pending);

        let work = AssertUnwindSafe(operation(args, signal.clone())).catch_unwind();
        let result = tokio::select! {
            settled = work => match settled {
                Ok(result) => result,
                Err(payload) => Err(TransitionError::Panicked(panic_message(&*payload))),
            },
            _ = signal.timed_out() => Err(TransitionError::Timeout {
                name: name.to_string(),
                after: self.inner.watchdog_timeout,
            }),
        };

        if !self.settle(name, call_id) {
            debug!(operation = name, call_id, "Superseded call settled, result discarded");
            return Ok(match result {
                Ok(state) => AsyncOutcome::Success { state, superseded: true },
                Err(error) => AsyncOutcome::Failure { error, superseded: true },
            });
        }

        let result = result.and_then(|partial| sink.apply_partial(name, partial));
        let status = match &result {
            Ok(_) => AsyncStatus::loaded(),
            Err(error) => {
                warn!(operation = name, error = %error, "Async operation failed");
                AsyncStatus::failed(error.clone())
            }
        };
        if self.publish(name, call_id, status.clone()) {
            sink.status_changed(name, &status);
        }

        Ok(match result {
            Ok(state) => AsyncOutcome::Success { state, superseded: false },
            Err(error) => AsyncOutcome::Failure { error, superseded: false },
        })
    }

    /// Run `calls` with at most `limit` in flight at once.
    ///
    /// Results are in call order; one call failing does not cancel others.
    pub async fn invoke_parallel(
        &self,
        calls: Vec<(String, Vec<Value>)>,
        limit: usize,
        sink: &dyn StateSink,
    ) -> Vec<(String, Result<AsyncOutcome, TransitionError>)> {
        futures::stream::iter(calls)
            .map(|(name, args)| async move {
                let outcome = self.invoke(&name, args, sink).await;
                (name, outcome)
            })
            .buffered(limit.max(1))
            .collect()
            .await
    }

    /// Supersede any current call, arm the watchdog and mark `name` pending
    fn begin(&self, name: &str, call_id: u64, signal: &CancelSignal, listening: &Arc<AtomicBool>) -> AsyncStatus {
        let mut slots = self.inner.slots.lock();
        let slot = slots.entry(name.to_string()).or_insert_with(Slot::new);

        if let Some(previous) = slot.in_flight.take() {
            previous.signal.cancel(CancelReason::Superseded);
            if let Some(watchdog) = previous.watchdog {
                watchdog.abort();
            }
            debug!(operation = name, superseded = previous.call_id, by = call_id, "Call superseded");
        }

        slot.latest = call_id;
        slot.in_flight = Some(InFlight {
            call_id,
            signal: signal.clone(),
            watchdog: self.spawn_watchdog(name, call_id, signal, listening),
        });

        let status = AsyncStatus::pending(&slot.status.borrow());
        slot.status.send_replace(status.clone());
        status
    }

    /// Fire the timeout signal; `invoke` settles the call while it is still
    /// being awaited, otherwise the watchdog does.
    fn spawn_watchdog(
        &self,
        name: &str,
        call_id: u64,
        signal: &CancelSignal,
        listening: &Arc<AtomicBool>,
    ) -> Option<AbortHandle> {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!(operation = name, "No tokio runtime, watchdog disabled");
            return None;
        };

        let manager = self.clone();
        let name = name.to_string();
        let signal = signal.clone();
        let listening = Arc::clone(listening);
        let after = self.inner.watchdog_timeout;
        let task = handle.spawn(async move {
            tokio::time::sleep(after).await;
            if !signal.cancel(CancelReason::Timeout) {
                return;
            }
            warn!(operation = %name, ?after, "Async operation timed out");
            if listening.load(Ordering::Acquire) {
                return;
            }

            debug!(operation = %name, call_id, "Caller gone, watchdog settles the call");
            let mut slots = manager.inner.slots.lock();
            if let Some(slot) = slots.get_mut(&name) {
                if slot.in_flight.as_ref().map(|f| f.call_id) == Some(call_id) {
                    slot.in_flight = None;
                    slot.status
                        .send_replace(AsyncStatus::failed(TransitionError::Timeout { name: name.clone(), after }));
                }
            }
        });
        Some(task.abort_handle())
    }

    /// Clear bookkeeping for a settled call; `true` if it is still current
    fn settle(&self, name: &str, call_id: u64) -> bool {
        let mut slots = self.inner.slots.lock();
        let Some(slot) = slots.get_mut(name) else {
            return false;
        };
        if slot.in_flight.as_ref().map(|f| f.call_id) == Some(call_id) {
            if let Some(InFlight {
                watchdog: Some(watchdog),
                ..
            }) = slot.in_flight.take()
            {
                watchdog.abort();
            }
        }
        slot.latest == call_id
    }

    /// Store `status` unless a newer call started meanwhile
    fn publish(&self, name: &str, call_id: u64, status: AsyncStatus) -> bool {
        let mut slots = self.inner.slots.lock();
        match slots.get_mut(name) {
            Some(slot) if slot.latest == call_id => {
                slot.status.send_replace(status);
                true
            }
            _ => false,
        }
    }
}

impl std::fmt::Debug for AsyncTransitionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncTransitionManager")
            .field("operations", &self.inner.operations.len())
            .field("watchdog_timeout", &self.inner.watchdog_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct RecordingSink {
        state: Mutex<Value>,
        statuses: Mutex<Vec<(String, AsyncStatus)>>,
    }

    impl RecordingSink {
        fn with_state(state: serde_json::Value) -> Self {
            Self {
                state: Mutex::new(Value::from(state)),
                statuses: Mutex::new(Vec::new()),
            }
        }
    }

    impl StateSink for RecordingSink {
        fn apply_partial(&self, _name: &str, partial: Value) -> Result<Value, TransitionError> {
            let mut state = self.state.lock();
            let next = state
                .merge_top_level(&partial)
                .map_err(|e| TransitionError::Rejected(e.to_string()))?;
            *state = next.clone();
            Ok(next)
        }

        fn status_changed(&self, name: &str, status: &AsyncStatus) {
            self.statuses.lock().push((name.to_string(), status.clone()));
        }
    }

    fn after(delay: Duration, result: Result<Value, TransitionError>) -> Operation {
        operation(move |_args, _signal| {
            let result = result.clone();
            async move {
                tokio::time::sleep(delay).await;
                result
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_merges_and_marks_loaded() {
        let manager = AsyncTransitionManager::new(Duration::from_secs(60));
        manager.register("load", after(Duration::from_millis(10), Ok(Value::from(json!({ "items": [1, 2] })))));
        let sink = RecordingSink::with_state(json!({ "count": 0 }));

        let outcome = manager.invoke("load", vec![], &sink).await.unwrap();

        assert!(outcome.is_success() && !outcome.is_superseded());
        assert_eq!(outcome.state(), Some(&Value::from(json!({ "count": 0, "items": [1, 2] }))));
        assert_eq!(manager.status("load"), AsyncStatus::loaded());

        let statuses = sink.statuses.lock();
        assert_eq!(statuses.len(), 2);
        assert!(statuses[0].1.pending);
        assert!(statuses[1].1.loaded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_leaves_state_alone() {
        let manager = AsyncTransitionManager::new(Duration::from_secs(60));
        manager.register("load", after(Duration::from_millis(100), Err(TransitionError::failed("offline"))));
        let sink = RecordingSink::with_state(json!({ "count": 0 }));

        let outcome = manager.invoke("load", vec![], &sink).await.unwrap();

        assert_eq!(outcome.error(), Some(&TransitionError::failed("offline")));
        assert_eq!(
            manager.status("load"),
            AsyncStatus {
                pending: false,
                error: Some(TransitionError::failed("offline")),
                loaded: false,
            }
        );
        assert_eq!(*sink.state.lock(), Value::from(json!({ "count": 0 })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_latest_call_is_applied() {
        let manager = AsyncTransitionManager::new(Duration::from_secs(60));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        // First call is slow, second is fast
        manager.register(
            "fetch",
            operation(move |_args, _signal| {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    let delay = if n == 0 { 100 } else { 10 };
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    Ok(Value::from(json!({ "v": n + 1 })))
                }
            }),
        );
        let sink = RecordingSink::with_state(json!({}));

        let (first, second) = tokio::join!(
            manager.invoke("fetch", vec![], &sink),
            manager.invoke("fetch", vec![], &sink)
        );

        let first = first.unwrap();
        let second = second.unwrap();
        assert!(first.is_success() && first.is_superseded());
        assert_eq!(first.state(), Some(&Value::from(json!({ "v": 1 }))));
        assert!(second.is_success() && !second.is_superseded());
        assert_eq!(*sink.state.lock(), Value::from(json!({ "v": 2 })));
        assert_eq!(manager.status("fetch"), AsyncStatus::loaded());
        assert!(!manager.is_in_flight("fetch"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_superseded_call_sees_the_signal() {
        let manager = AsyncTransitionManager::new(Duration::from_secs(60));
        manager.register(
            "search",
            operation(|args, signal| async move {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(50)) => Ok(Value::object([("q", args.into_iter().next().unwrap_or_default())])),
                    reason = signal.cancelled() => {
                        assert_eq!(reason, CancelReason::Superseded);
                        Err(TransitionError::Cancelled)
                    }
                }
            }),
        );
        let sink = RecordingSink::with_state(json!({}));

        let (first, second) = tokio::join!(
            manager.invoke("search", vec![Value::from("a")], &sink),
            manager.invoke("search", vec![Value::from("ab")], &sink)
        );

        assert_eq!(
            first.unwrap(),
            AsyncOutcome::Failure {
                error: TransitionError::Cancelled,
                superseded: true
            }
        );
        assert!(second.unwrap().is_success());
        assert_eq!(*sink.state.lock(), Value::from(json!({ "q": "ab" })));
        assert_eq!(manager.status("search"), AsyncStatus::loaded());
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_reports_timeout() {
        let manager = AsyncTransitionManager::new(Duration::from_secs(1));
        manager.register("hang", after(Duration::from_secs(3600), Ok(Value::empty_object())));
        let sink = RecordingSink::with_state(json!({}));

        let outcome = manager.invoke("hang", vec![], &sink).await.unwrap();

        let error = outcome.error().cloned().unwrap();
        assert!(error.is_timeout());
        let status = manager.status("hang");
        assert!(!status.pending);
        assert!(status.error.unwrap().is_timeout());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_status_is_published_once() {
        let manager = AsyncTransitionManager::new(Duration::from_secs(1));
        manager.register("hang", after(Duration::from_secs(3600), Ok(Value::empty_object())));
        let sink = RecordingSink::with_state(json!({}));
        let mut status = manager.watch("hang");

        manager.invoke("hang", vec![], &sink).await.unwrap();

        let statuses = sink.statuses.lock();
        assert_eq!(statuses.len(), 2);
        assert!(statuses[0].1.pending);
        assert!(statuses[1].1.error.as_ref().is_some_and(TransitionError::is_timeout));
        assert!(status.borrow_and_update().error.as_ref().is_some_and(TransitionError::is_timeout));
        assert!(!status.has_changed().unwrap());
        assert!(!manager.is_in_flight("hang"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_settles_abandoned_call() {
        let manager = AsyncTransitionManager::new(Duration::from_secs(1));
        manager.register("hang", after(Duration::from_secs(3600), Ok(Value::empty_object())));
        let sink = RecordingSink::with_state(json!({}));

        let abandoned = tokio::time::timeout(Duration::from_millis(100), manager.invoke("hang", vec![], &sink)).await;
        assert!(abandoned.is_err());
        assert!(manager.status("hang").pending);

        tokio::time::sleep(Duration::from_secs(2)).await;

        let status = manager.status("hang");
        assert!(!status.pending);
        assert!(status.error.unwrap().is_timeout());
        assert!(!manager.is_in_flight("hang"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_operation_is_contained() {
        let manager = AsyncTransitionManager::new(Duration::from_secs(60));
        manager.register(
            "explode",
            operation(|_args, _signal| async move {
                if true {
                    panic!("kaboom");
                }
                Ok(Value::Null)
            }),
        );
        let sink = RecordingSink::with_state(json!({}));

        let outcome = manager.invoke("explode", vec![], &sink).await.unwrap();
        assert_eq!(outcome.error(), Some(&TransitionError::Panicked("kaboom".to_string())));
    }

    #[tokio::test]
    async fn test_unknown_operation() {
        let manager = AsyncTransitionManager::new(Duration::from_secs(60));
        let sink = RecordingSink::default();
        let result = manager.invoke("missing", vec![], &sink).await;
        assert_eq!(result, Err(TransitionError::UnknownOperation("missing".to_string())));
        assert!(manager.status("missing").is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_respects_limit() {
        let manager = AsyncTransitionManager::new(Duration::from_secs(60));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for name in ["a", "b", "c", "d"] {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            manager.register(
                name,
                operation(move |_args, _signal| {
                    let running = Arc::clone(&running);
                    let peak = Arc::clone(&peak);
                    async move {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok(Value::empty_object())
                    }
                }),
            );
        }
        let sink = RecordingSink::with_state(json!({}));
        let calls = ["a", "b", "c", "d"].iter().map(|n| (n.to_string(), vec![])).collect();

        let results = manager.invoke_parallel(calls, 2, &sink).await;

        let names: Vec<&str> = results.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c", "d"]);
        assert!(results.iter().all(|(_, r)| r.as_ref().unwrap().is_success()));
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_watch_observes_transitions() {
        let manager = AsyncTransitionManager::new(Duration::from_secs(60));
        manager.register("ping", after(Duration::ZERO, Ok(Value::empty_object())));
        let mut rx = manager.watch("ping");
        assert!(rx.borrow().is_idle());

        let sink = RecordingSink::with_state(json!({}));
        manager.invoke("ping", vec![], &sink).await.unwrap();

        assert!(rx.has_changed().unwrap());
        assert!(rx.borrow_and_update().loaded);
    }
}

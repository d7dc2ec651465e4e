//! Prioritized batching of notification work
//!
//! Jobs are queued in three lanes and run lane by lane (high, normal, low),
//! first-in first-out within a lane. A job may carry an id; scheduling a
//! second job with a pending id either replaces the pending one or is
//! dropped, which is how several `set_state` calls in one tick collapse into
//! a single notification batch.
//!
//! # Flushing
//!
//! ```text
//! schedule() ──► lanes ──► FlushMode::Sync      flush inline
//!                      └─► FlushMode::Deferred  tokio task (yield, then flush)
//!                      └─► FlushMode::Auto      task if a runtime exists, else inline
//! ```
//!
//! `flush()` is re-entrancy safe: a job that schedules more work while a
//! flush is running has it picked up by the running flush.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use state_store::panic_message;
use tokio::task::AbortHandle;
use tracing::{debug, trace, warn};

use crate::config::FlushMode;

/// Lane a job is queued in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Priority {
    /// Flushed without yielding first
    High,
    #[default]
    Normal,
    Low,
}

/// How a job is queued
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleOptions {
    pub priority: Priority,
    /// Deduplication key
    pub id: Option<String>,
    /// With a pending job under the same id: replace it (`true`) or drop
    /// the new one (`false`)
    pub replace: bool,
}

impl Default for ScheduleOptions {
    fn default() -> Self {
        Self {
            priority: Priority::Normal,
            id: None,
            replace: true,
        }
    }
}

impl ScheduleOptions {
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn keep_existing(mut self) -> Self {
        self.replace = false;
        self
    }
}

/// Scheduler counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub scheduled: u64,
    pub replaced: u64,
    pub dropped: u64,
    pub executed: u64,
    pub panicked: u64,
    pub flushes: u64,
}

type Job = Box<dyn FnOnce() + Send>;

struct Scheduled {
    id: Option<String>,
    job: Job,
}

#[derive(Default)]
struct Lanes {
    high: VecDeque<Scheduled>,
    normal: VecDeque<Scheduled>,
    low: VecDeque<Scheduled>,
}

impl Lanes {
    fn lane_mut(&mut self, priority: Priority) -> &mut VecDeque<Scheduled> {
        match priority {
            Priority::High => &mut self.high,
            Priority::Normal => &mut self.normal,
            Priority::Low => &mut self.low,
        }
    }

    fn take(&mut self, id: &str) -> Option<Scheduled> {
        for lane in [&mut self.high, &mut self.normal, &mut self.low] {
            if let Some(position) = lane.iter().position(|s| s.id.as_deref() == Some(id)) {
                return lane.remove(position);
            }
        }
        None
    }

    fn contains(&self, id: &str) -> bool {
        [&self.high, &self.normal, &self.low]
            .iter()
            .any(|lane| lane.iter().any(|s| s.id.as_deref() == Some(id)))
    }

    fn pop(&mut self) -> Option<Scheduled> {
        self.high
            .pop_front()
            .or_else(|| self.normal.pop_front())
            .or_else(|| self.low.pop_front())
    }

    fn len(&self) -> usize {
        self.high.len() + self.normal.len() + self.low.len()
    }
}

#[derive(Default)]
struct Counters {
    scheduled: AtomicU64,
    replaced: AtomicU64,
    dropped: AtomicU64,
    executed: AtomicU64,
    panicked: AtomicU64,
    flushes: AtomicU64,
}

/// A spawned flush that has not started yet
struct PendingFlush {
    task: AbortHandle,
    /// Spawned for the high lane, so it skips the yield
    urgent: bool,
}

struct SchedulerInner {
    mode: FlushMode,
    lanes: Mutex<Lanes>,
    flushing: AtomicBool,
    pending_task: Mutex<Option<PendingFlush>>,
    counters: Counters,
}

/// Batches and orders deferred work
#[derive(Clone)]
pub struct UpdateScheduler {
    inner: Arc<SchedulerInner>,
}

impl UpdateScheduler {
    pub fn new(mode: FlushMode) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                mode,
                lanes: Mutex::new(Lanes::default()),
                flushing: AtomicBool::new(false),
                pending_task: Mutex::new(None),
                counters: Counters::default(),
            }),
        }
    }

    pub fn mode(&self) -> FlushMode {
        self.inner.mode
    }

    /// Queue `job`. Returns `false` when it was dropped as a duplicate.
    pub fn schedule(&self, options: ScheduleOptions, job: impl FnOnce() + Send + 'static) -> bool {
        let counters = &self.inner.counters;
        {
            let mut lanes = self.inner.lanes.lock();
            if let Some(id) = options.id.as_deref() {
                if lanes.contains(id) {
                    if !options.replace {
                        counters.dropped.fetch_add(1, Ordering::Relaxed);
                        trace!(id, "Duplicate job dropped");
                        return false;
                    }
                    lanes.take(id);
                    counters.replaced.fetch_add(1, Ordering::Relaxed);
                    trace!(id, "Pending job replaced");
                }
            }
            lanes.lane_mut(options.priority).push_back(Scheduled {
                id: options.id,
                job: Box::new(job),
            });
        }
        counters.scheduled.fetch_add(1, Ordering::Relaxed);

        match self.inner.mode {
            FlushMode::Sync => {
                self.flush();
            }
            FlushMode::Deferred => {
                self.spawn_flush(options.priority);
            }
            FlushMode::Auto => {
                if !self.spawn_flush(options.priority) {
                    self.flush();
                }
            }
        }
        true
    }

    /// Spawn a flush task unless one is already pending.
    ///
    /// A high-priority job replaces a pending task that would yield first.
    /// Returns `false` when no tokio runtime is available.
    fn spawn_flush(&self, priority: Priority) -> bool {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return false;
        };

        let urgent = priority == Priority::High;
        let mut pending = self.inner.pending_task.lock();
        if let Some(existing) = pending.as_ref() {
            if existing.urgent || !urgent {
                return true;
            }
            trace!("Promoting pending flush for a high-priority job");
            existing.task.abort();
        }

        let scheduler = self.clone();
        let task = handle.spawn(async move {
            if !urgent {
                tokio::task::yield_now().await;
            }
            scheduler.flush();
        });
        *pending = Some(PendingFlush {
            task: task.abort_handle(),
            urgent,
        });
        true
    }

    /// Run every queued job. Returns the number of jobs run.
    pub fn flush(&self) -> usize {
        let mut executed = 0;
        loop {
            if self.inner.flushing.swap(true, Ordering::AcqRel) {
                // Re-entrant or concurrent call: the running flush drains the lanes
                return executed;
            }
            self.inner.pending_task.lock().take();
            self.inner.counters.flushes.fetch_add(1, Ordering::Relaxed);

            while let Some(scheduled) = self.next_job() {
                executed += 1;
                self.run(scheduled);
            }

            self.inner.flushing.store(false, Ordering::Release);
            // Work queued between the last pop and the release above
            if self.inner.lanes.lock().len() == 0 {
                break;
            }
        }
        if executed > 0 {
            debug!(executed, "Scheduler flushed");
        }
        executed
    }

    /// Cancel a pending flush task and drain the lanes now
    pub fn flush_immediately(&self) -> usize {
        if let Some(pending) = self.inner.pending_task.lock().take() {
            pending.task.abort();
        }
        self.flush()
    }

    fn next_job(&self) -> Option<Scheduled> {
        self.inner.lanes.lock().pop()
    }

    fn run(&self, scheduled: Scheduled) {
        let counters = &self.inner.counters;
        let Scheduled { id, job } = scheduled;
        match panic::catch_unwind(AssertUnwindSafe(job)) {
            Ok(()) => {
                counters.executed.fetch_add(1, Ordering::Relaxed);
            }
            Err(payload) => {
                counters.panicked.fetch_add(1, Ordering::Relaxed);
                warn!(
                    id = id.as_deref().unwrap_or("-"),
                    error = %panic_message(&*payload),
                    "Scheduled job panicked"
                );
            }
        }
    }

    /// Remove a pending job by id
    pub fn cancel(&self, id: &str) -> bool {
        self.inner.lanes.lock().take(id).is_some()
    }

    /// Drop every pending job without running it
    pub fn clear(&self) -> usize {
        let mut lanes = self.inner.lanes.lock();
        let dropped = lanes.len();
        *lanes = Lanes::default();
        dropped
    }

    pub fn pending(&self) -> usize {
        self.inner.lanes.lock().len()
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.inner.lanes.lock().contains(id)
    }

    pub fn is_flushing(&self) -> bool {
        self.inner.flushing.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> SchedulerStats {
        let c = &self.inner.counters;
        SchedulerStats {
            scheduled: c.scheduled.load(Ordering::Relaxed),
            replaced: c.replaced.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            executed: c.executed.load(Ordering::Relaxed),
            panicked: c.panicked.load(Ordering::Relaxed),
            flushes: c.flushes.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for UpdateScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateScheduler")
            .field("mode", &self.inner.mode)
            .field("pending", &self.pending())
            .field("flushing", &self.is_flushing())
            .finish()
    }
}

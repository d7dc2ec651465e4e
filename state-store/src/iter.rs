//! Change feed and blocking iteration over committed changes
//!
//! [`ChangeFeed`] fans every published [`ChangeEvent`] out to each
//! [`ChangeIterator`] created from it. Each iterator owns its own queue, so
//! slow consumers never steal events from each other, and dropping an
//! iterator unregisters it on the next publish.
//!
//! Consumption patterns:
//! - Blocking: `recv()`, `for event in iter`
//! - Non-blocking: `try_recv()`, `try_iter()`, `coalesce()`
//! - Timeout: `recv_timeout()`, `timeout_iter()`

use std::sync::mpsc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::diff::ChangeSet;
use crate::event::ChangeEvent;

/// Sending side of the change feed
#[derive(Debug, Default)]
pub struct ChangeFeed {
    senders: Mutex<Vec<mpsc::Sender<ChangeEvent>>>,
}

impl ChangeFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new consumer; it sees events published from now on
    pub fn subscribe(&self) -> ChangeIterator {
        let (tx, rx) = mpsc::channel();
        self.senders.lock().push(tx);
        ChangeIterator { rx }
    }

    /// Deliver `event` to every live consumer, dropping disconnected ones
    pub fn publish(&self, event: &ChangeEvent) {
        self.senders
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Number of registered consumers (including ones dropped since the last publish)
    pub fn receiver_count(&self) -> usize {
        self.senders.lock().len()
    }
}

/// Blocking iterator over committed state changes
///
/// Receives one event per accepted update, silent updates included.
/// All methods are synchronous - no async/await required.
///
/// # Example
///
/// ```rust,ignore
/// let changes = engine.changes();
///
/// // Blocking iteration
/// for event in changes.timeout_iter(Duration::from_millis(100)) {
///     println!("changed: {:?}", event.changed_keys);
/// }
///
/// // Render loop: one merged change set per frame
/// if let Some(frame) = changes.coalesce() {
///     redraw(&frame.changed_paths);
/// }
/// ```
pub struct ChangeIterator {
    rx: mpsc::Receiver<ChangeEvent>,
}

impl ChangeIterator {
    /// Block until the next event is available
    ///
    /// Returns `None` once the feed has been dropped.
    pub fn recv(&self) -> Option<ChangeEvent> {
        self.rx.recv().ok()
    }

    /// Block until the next event or until `timeout` expires
    pub fn recv_timeout(&self, timeout: Duration) -> Option<ChangeEvent> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// Next queued event, without blocking
    pub fn try_recv(&self) -> Option<ChangeEvent> {
        self.rx.try_recv().ok()
    }

    /// Iterate over the events queued right now
    pub fn try_iter(&self) -> TryIter<'_> {
        TryIter { inner: self }
    }

    /// Iterate, blocking up to `timeout` for each event
    pub fn timeout_iter(&self, timeout: Duration) -> TimeoutIter<'_> {
        TimeoutIter {
            inner: self,
            timeout,
        }
    }

    /// Drain every queued event into a single merged change set
    pub fn coalesce(&self) -> Option<ChangeSet> {
        self.try_iter().fold(None, |merged, event| {
            let mut merged = merged.unwrap_or_else(ChangeSet::new);
            merged.merge(ChangeSet {
                changed_keys: event.changed_keys,
                changed_paths: event.changed_paths,
                structural: event.structural,
            });
            Some(merged)
        })
    }
}

impl Iterator for ChangeIterator {
    type Item = ChangeEvent;

    fn next(&mut self) -> Option<Self::Item> {
        self.recv()
    }
}

/// Non-blocking iterator over currently queued events
pub struct TryIter<'a> {
    inner: &'a ChangeIterator,
}

impl Iterator for TryIter<'_> {
    type Item = ChangeEvent;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.try_recv()
    }
}

/// Blocking iterator with a per-event timeout
pub struct TimeoutIter<'a> {
    inner: &'a ChangeIterator,
    timeout: Duration,
}

impl Iterator for TimeoutIter<'_> {
    type Item = ChangeEvent;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.recv_timeout(self.timeout)
    }
}

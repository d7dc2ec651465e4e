//! Bounded retry around state mutations
//!
//! [`SafeExecutor::run`] retries a fallible operation with exponential
//! backoff. Attempts are counted per [`RetryContext`] (action name plus an
//! optional state path), so two concurrent runs for the same context share
//! one budget. Once the budget is spent the caller's fallback is returned;
//! nothing is raised.

use std::fmt;
use std::future::Future;

use dashmap::DashMap;
use state_store::Path;
use tracing::{debug, warn};

use crate::config::RetryPolicy;

/// What a retried operation is doing, and where
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RetryContext {
    pub action: String,
    pub path: Option<Path>,
}

impl RetryContext {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            path: None,
        }
    }

    pub fn at(mut self, path: Path) -> Self {
        self.path = Some(path);
        self
    }
}

impl fmt::Display for RetryContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.path {
            Some(path) => write!(f, "{}@{}", self.action, path),
            None => f.write_str(&self.action),
        }
    }
}

/// Runs operations under a [`RetryPolicy`]
#[derive(Debug)]
pub struct SafeExecutor {
    policy: RetryPolicy,
    attempts: DashMap<RetryContext, u32>,
}

impl SafeExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            attempts: DashMap::new(),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Failed attempts recorded for `context` by runs still in progress
    pub fn attempts(&self, context: &RetryContext) -> u32 {
        self.attempts.get(context).map(|entry| *entry).unwrap_or(0)
    }

    /// Run `op` until it succeeds or the attempt budget is spent.
    ///
    /// `op` receives the 1-based attempt number. The counter for `context`
    /// is reset on success and when giving up.
    pub async fn run<T, E, F, Fut>(&self, context: &RetryContext, mut op: F, fallback: T) -> T
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        loop {
            let attempt = self.attempts(context) + 1;
            match op(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(context = %context, attempt, "Succeeded after retry");
                    }
                    self.attempts.remove(context);
                    return value;
                }
                Err(error) => {
                    let failed = {
                        let mut entry = self.attempts.entry(context.clone()).or_insert(0);
                        *entry += 1;
                        *entry
                    };
                    warn!(
                        context = %context,
                        attempt = failed,
                        max_attempts,
                        error = %error,
                        "Operation failed"
                    );

                    if failed >= max_attempts {
                        warn!(context = %context, "Giving up, using fallback");
                        self.attempts.remove(context);
                        return fallback;
                    }

                    let delay = self.policy.delay_for(failed);
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
    }
}

impl Default for SafeExecutor {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn no_delay(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::ZERO,
            ..RetryPolicy::default()
        }
    }

    #[test]
    fn test_succeeds_after_transient_failures() {
        let executor = SafeExecutor::new(no_delay(3));
        let context = RetryContext::new("save").at(Path::key("draft"));
        let calls = AtomicU32::new(0);

        let result = tokio_test::block_on(executor.run(
            &context,
            |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(format!("attempt {} failed", attempt))
                    } else {
                        Ok(attempt)
                    }
                }
            },
            0,
        ));

        assert_eq!(result, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(executor.attempts(&context), 0);
    }

    #[test]
    fn test_gives_up_with_fallback() {
        let executor = SafeExecutor::new(no_delay(2));
        let context = RetryContext::new("sync");
        let calls = AtomicU32::new(0);

        let result = tokio_test::block_on(executor.run(
            &context,
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<&str, _>("nope") }
            },
            "fallback",
        ));

        assert_eq!(result, "fallback");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(executor.attempts(&context), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_between_attempts() {
        let executor = SafeExecutor::new(RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            backoff_factor: 2,
            max_delay: Duration::from_secs(5),
        });
        let context = RetryContext::new("slow");
        let start = tokio::time::Instant::now();

        let result = executor
            .run(&context, |_| async { Err::<bool, _>("down") }, false)
            .await;

        assert!(!result);
        // 100ms after the first failure, 200ms after the second
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(300) && elapsed < Duration::from_millis(400));
    }

    #[test]
    fn test_context_display() {
        assert_eq!(RetryContext::new("save").to_string(), "save");
        let context = RetryContext::new("save").at(Path::parse("todos[1].title").unwrap());
        assert_eq!(context.to_string(), "save@todos[1].title");
    }
}

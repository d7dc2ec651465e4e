//! Configuration types for the reactive-state crate
//!
//! `StoreConfig` controls cache sizes, traversal bounds, the flush strategy
//! of the update scheduler, the async watchdog and the retry policy of the
//! safe executor.

use std::time::Duration;

use state_store::{CompareOptions, TrackerOptions};

use crate::error::{Result, StoreError};

/// When scheduled notification flushes run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlushMode {
    /// Defer to a tokio task when a runtime is available, flush inline otherwise
    #[default]
    Auto,
    /// Always flush inline, before `set_state` returns
    Sync,
    /// Always defer; without a runtime updates wait for an explicit `flush()`
    Deferred,
}

/// Bounded retry with exponential backoff
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts per (action, path) before giving up
    /// Default: 3
    pub max_attempts: u32,

    /// Delay before the first retry
    /// Default: 50 ms
    pub base_delay: Duration,

    /// Multiplier applied to the delay after every failed attempt
    /// Default: 2
    pub backoff_factor: u32,

    /// Upper bound for a single delay
    /// Default: 2 seconds
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(50),
            backoff_factor: 2,
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self
            .backoff_factor
            .max(1)
            .saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Single attempt, no delay
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            ..Default::default()
        }
    }
}

/// Configuration for a [`StateEngine`](crate::StateEngine)
#[derive(Debug, Clone, PartialEq)]
pub struct StoreConfig {
    /// Recursion bound for deep comparison
    /// Default: 100
    pub compare_max_depth: usize,

    /// Number of cached comparison results
    /// Default: 1000
    pub compare_cache_capacity: usize,

    /// Lifetime of a cached comparison result
    /// Default: 60 seconds
    pub compare_cache_ttl: Duration,

    /// Composites at or below this size skip the key/length pre-check
    /// Default: 10
    pub small_composite_threshold: usize,

    /// Key-set / length delta above which a change is structural
    /// Default: 3
    pub structural_threshold: usize,

    /// Nesting depth of tracked views
    /// Default: 10
    pub max_wrap_depth: usize,

    /// Child paths recorded once the wrap depth is exceeded
    /// Default: 10
    pub fallback_child_deps: usize,

    /// Async transitions still pending after this long fail with a timeout
    /// Default: 60 seconds
    pub watchdog_timeout: Duration,

    /// How notification flushes are scheduled
    /// Default: Auto
    pub flush_mode: FlushMode,

    /// Safe-execute retry policy
    pub retry: RetryPolicy,

    /// Memoized selector results kept per engine
    /// Default: 256
    pub selector_cache_capacity: usize,

    /// Lifetime of a memoized selector result
    /// Default: none
    pub selector_cache_ttl: Option<Duration>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            compare_max_depth: 100,
            compare_cache_capacity: 1000,
            compare_cache_ttl: Duration::from_secs(60),
            small_composite_threshold: 10,
            structural_threshold: 3,
            max_wrap_depth: 10,
            fallback_child_deps: 10,
            watchdog_timeout: Duration::from_secs(60),
            flush_mode: FlushMode::Auto,
            retry: RetryPolicy::default(),
            selector_cache_capacity: 256,
            selector_cache_ttl: None,
        }
    }
}

impl StoreConfig {
    /// Create a new StoreConfig with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Deterministic settings for tests: inline flushes, short watchdog,
    /// retries without delay
    pub fn testing() -> Self {
        Self {
            flush_mode: FlushMode::Sync,
            watchdog_timeout: Duration::from_secs(1),
            retry: RetryPolicy {
                base_delay: Duration::ZERO,
                ..RetryPolicy::default()
            },
            ..Default::default()
        }
    }

    /// Smaller caches for memory-constrained hosts
    pub fn low_memory() -> Self {
        Self {
            compare_cache_capacity: 100,
            compare_cache_ttl: Duration::from_secs(10),
            selector_cache_capacity: 32,
            selector_cache_ttl: Some(Duration::from_secs(30)),
            ..Default::default()
        }
    }

    pub fn with_flush_mode(mut self, flush_mode: FlushMode) -> Self {
        self.flush_mode = flush_mode;
        self
    }

    pub fn with_watchdog_timeout(mut self, timeout: Duration) -> Self {
        self.watchdog_timeout = timeout;
        self
    }

    /// Validate the configuration and return any issues
    pub fn validate(&self) -> Result<()> {
        if self.compare_max_depth == 0 {
            return Err(StoreError::Configuration(
                "Compare max depth must be greater than 0".to_string(),
            ));
        }

        if self.compare_cache_capacity == 0 {
            return Err(StoreError::Configuration(
                "Compare cache capacity must be greater than 0".to_string(),
            ));
        }

        if self.max_wrap_depth == 0 {
            return Err(StoreError::Configuration(
                "Max wrap depth must be greater than 0".to_string(),
            ));
        }

        if self.selector_cache_capacity == 0 {
            return Err(StoreError::Configuration(
                "Selector cache capacity must be greater than 0".to_string(),
            ));
        }

        if self.watchdog_timeout == Duration::ZERO {
            return Err(StoreError::Configuration(
                "Watchdog timeout must be greater than 0".to_string(),
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(StoreError::Configuration(
                "Retry policy needs at least one attempt".to_string(),
            ));
        }

        Ok(())
    }

    pub(crate) fn compare_options(&self) -> CompareOptions {
        CompareOptions {
            max_depth: self.compare_max_depth,
            small_threshold: self.small_composite_threshold,
            cache_capacity: self.compare_cache_capacity,
            cache_ttl: self.compare_cache_ttl,
        }
    }

    pub(crate) fn tracker_options(&self) -> TrackerOptions {
        TrackerOptions {
            max_wrap_depth: self.max_wrap_depth,
            fallback_child_deps: self.fallback_child_deps,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = StoreConfig::default();
        assert_eq!(config.compare_max_depth, 100);
        assert_eq!(config.compare_cache_ttl, Duration::from_secs(60));
        assert_eq!(config.watchdog_timeout, Duration::from_secs(60));
        assert_eq!(config.flush_mode, FlushMode::Auto);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_presets_validate() {
        assert!(StoreConfig::testing().validate().is_ok());
        assert!(StoreConfig::low_memory().validate().is_ok());
        assert_eq!(StoreConfig::testing().flush_mode, FlushMode::Sync);
    }

    #[test]
    fn test_config_validation() {
        let config = StoreConfig {
            compare_cache_capacity: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(StoreError::Configuration(_))));

        let config = StoreConfig::default().with_watchdog_timeout(Duration::ZERO);
        assert!(config.validate().is_err());

        let config = StoreConfig {
            retry: RetryPolicy {
                max_attempts: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_retry_backoff() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_millis(50));
        assert_eq!(policy.delay_for(2), Duration::from_millis(100));
        assert_eq!(policy.delay_for(3), Duration::from_millis(200));
        assert_eq!(policy.delay_for(20), Duration::from_secs(2));
    }
}

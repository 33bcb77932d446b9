//! Retry logic with exponential backoff.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use r402::Retryable;
use rand::RngExt;
use serde::{Deserialize, Serialize};
use serde_with::{DurationMilliSeconds, serde_as};
use tokio::time::sleep;
use tracing::debug;

/// Retry bounds.
#[serde_as]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt. Total attempts = `max_retries + 1`.
    pub max_retries: u32,
    /// Delay before the first retry.
    #[serde(rename = "base_delay_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    #[serde(rename = "max_delay_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub max_delay: Duration,
    /// Whether to spread delays by +-25%.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            jitter: true,
        }
    }
}

/// Passed to the `on_retry` observer before each backoff wait.
#[derive(Debug, Clone, Copy)]
pub struct RetryAttempt<'a, E> {
    /// 1-indexed retry number.
    pub attempt: u32,
    /// Configured retry bound.
    pub max_retries: u32,
    /// How long the policy is about to wait.
    pub delay: Duration,
    /// The error that triggered the retry.
    pub error: &'a E,
}

/// Retry policy with exponential backoff.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    /// Creates a policy from config.
    #[must_use]
    pub const fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Returns the configured bounds.
    #[must_use]
    pub const fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Calculates the delay before retry `attempt` (1-indexed).
    ///
    /// `min(base_delay * 2^(attempt-1), max_delay)`, then jittered by +-25%
    /// and clamped to `max_delay` again.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let multiplier = 2u32.saturating_pow(attempt - 1);
        let capped = self
            .config
            .base_delay
            .saturating_mul(multiplier)
            .min(self.config.max_delay);

        if !self.config.jitter {
            return capped;
        }

        let capped_ms = u64::try_from(capped.as_millis()).unwrap_or(u64::MAX);
        let jitter_range = capped_ms / 4;
        if jitter_range == 0 {
            return capped;
        }
        let jittered_ms = rand::rng().random_range(
            capped_ms.saturating_sub(jitter_range)..=capped_ms.saturating_add(jitter_range),
        );
        Duration::from_millis(jittered_ms).min(self.config.max_delay)
    }

    /// Executes an async operation with retries.
    ///
    /// Only errors whose [`Retryable::is_retryable`] is `true` are retried.
    /// `on_retry` runs before every backoff wait. When attempts are exhausted,
    /// or on the first terminal error, that error is returned as is.
    ///
    /// # Errors
    ///
    /// Returns the last error produced by `operation`.
    pub async fn execute<F, Fut, T, E, R>(&self, mut operation: F, mut on_retry: R) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display,
        R: FnMut(&RetryAttempt<'_, E>),
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    attempt += 1;
                    let delay = self.delay_for_attempt(attempt);
                    on_retry(&RetryAttempt {
                        attempt,
                        max_retries: self.config.max_retries,
                        delay,
                        error: &e,
                    });
                    debug!(attempt, ?delay, error = %e, "Retrying after delay");
                    sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use r402::TransportError;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_retries,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            jitter: false,
        })
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = RetryPolicy::new(RetryConfig {
            max_retries: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            jitter: false,
        });
        assert_eq!(policy.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy::new(RetryConfig {
            max_retries: 5,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(1100),
            jitter: true,
        });
        for _ in 0..50 {
            let d1 = policy.delay_for_attempt(1);
            assert!(
                d1 >= Duration::from_millis(750) && d1 <= Duration::from_millis(1100),
                "delay {d1:?} out of range"
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_retryable_failure_runs_n_plus_one_times() {
        let attempts = Arc::new(AtomicU32::new(0));
        let mut observed = Vec::new();

        let result: Result<(), TransportError> = policy(3)
            .execute(
                || {
                    let attempts = Arc::clone(&attempts);
                    async move {
                        attempts.fetch_add(1, Ordering::SeqCst);
                        Err(TransportError::network("POST /verify", "connection reset"))
                    }
                },
                |retry| observed.push((retry.attempt, retry.delay)),
            )
            .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        assert_eq!(
            result.unwrap_err(),
            TransportError::network("POST /verify", "connection reset")
        );
        assert_eq!(
            observed,
            vec![
                (1, Duration::from_millis(100)),
                (2, Duration::from_millis(200)),
                (3, Duration::from_millis(400)),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_error_runs_once() {
        let attempts = Arc::new(AtomicU32::new(0));
        let mut retries = 0;

        let result: Result<(), TransportError> = policy(5)
            .execute(
                || {
                    let attempts = Arc::clone(&attempts);
                    async move {
                        attempts.fetch_add(1, Ordering::SeqCst);
                        Err(TransportError::status("POST /verify", 400, "bad payload"))
                    }
                },
                |_| retries += 1,
            )
            .await;

        assert!(matches!(
            result,
            Err(TransportError::Status { status: 400, .. })
        ));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(retries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failures() {
        let attempts = Arc::new(AtomicU32::new(0));

        let result = policy(3)
            .execute(
                || {
                    let attempts = Arc::clone(&attempts);
                    async move {
                        if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                            Err(TransportError::timeout("POST /settle"))
                        } else {
                            Ok(42)
                        }
                    }
                },
                |_| {},
            )
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_retries_means_single_attempt() {
        let attempts = Arc::new(AtomicU32::new(0));

        let result: Result<(), TransportError> = policy(0)
            .execute(
                || {
                    let attempts = Arc::clone(&attempts);
                    async move {
                        attempts.fetch_add(1, Ordering::SeqCst);
                        Err(TransportError::timeout("POST /settle"))
                    }
                },
                |_| {},
            )
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_config_reads_millisecond_fields() {
        let config: RetryConfig =
            toml::from_str("max_retries = 5\nbase_delay_ms = 250\njitter = false").unwrap();
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.base_delay, Duration::from_millis(250));
        assert_eq!(config.max_delay, Duration::from_secs(10));
        assert!(!config.jitter);
    }
}

//! Per-endpoint circuit breaker.
//!
//! Three states:
//!
//! - `Closed`: calls pass through; consecutive failures are counted and
//!   reaching `failure_threshold` opens the circuit.
//! - `Open`: calls are rejected with [`BreakerError::Open`] without running
//!   the operation, until `reset_timeout` has elapsed since the last failure.
//! - `HalfOpen`: a single trial call is admitted. Success closes the
//!   circuit, failure re-opens it.
//!
//! Time is read from [`tokio::time::Instant`], so tests can drive it with a
//! paused runtime.

use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::{DurationMilliSeconds, serde_as};
use tokio::time::Instant;
use tracing::{info, warn};

/// Breaker tuning.
#[serde_as]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Cool-down before a trial call is admitted.
    #[serde(rename = "reset_timeout_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
        }
    }
}

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Calls pass through.
    Closed,
    /// Calls are rejected.
    Open,
    /// One trial call is admitted.
    HalfOpen,
}

/// Snapshot returned by [`CircuitBreaker::state`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerStatus {
    /// Breaker name, usually the endpoint URL.
    pub name: String,
    /// Current state.
    pub state: CircuitState,
    /// Consecutive failures recorded.
    pub failures: u32,
}

/// Error returned by [`CircuitBreaker::execute`].
#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E> {
    /// The circuit rejected the call; the operation was not run.
    #[error("circuit breaker '{name}' is open")]
    Open {
        /// Breaker name.
        name: String,
    },
    /// The operation ran and failed.
    #[error(transparent)]
    Inner(E),
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failures: u32,
    last_failure_time: Option<Instant>,
    trial_in_flight: bool,
}

/// A three-state circuit breaker guarding one endpoint.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Creates a closed breaker.
    #[must_use]
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failures: 0,
                last_failure_time: None,
                trial_in_flight: false,
            }),
        }
    }

    /// Breaker name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns `{name, state, failures}` without changing anything.
    #[must_use]
    pub fn state(&self) -> CircuitBreakerStatus {
        let inner = self.lock();
        CircuitBreakerStatus {
            name: self.name.clone(),
            state: inner.state,
            failures: inner.failures,
        }
    }

    /// Returns `true` while the circuit is open and still cooling down.
    #[must_use]
    pub fn is_open(&self) -> bool {
        let inner = self.lock();
        inner.state == CircuitState::Open && !self.cooled_down(&inner)
    }

    fn cooled_down(&self, inner: &BreakerState) -> bool {
        inner
            .last_failure_time
            .is_none_or(|at| at.elapsed() >= self.config.reset_timeout)
    }

    /// Forces the breaker back to `Closed`.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.failures = 0;
        inner.last_failure_time = None;
        inner.trial_in_flight = false;
    }

    /// Runs `operation` if the circuit admits it and records the outcome.
    ///
    /// # Errors
    ///
    /// Returns [`BreakerError::Open`] when rejected, otherwise wraps the
    /// operation's own error in [`BreakerError::Inner`].
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut trial = self.admit::<E>()?;
        let result = operation().await;
        match &result {
            Ok(_) => self.on_success(),
            Err(_) => self.on_failure(),
        }
        trial.completed = true;
        result.map_err(BreakerError::Inner)
    }

    fn admit<E>(&self) -> Result<TrialGuard<'_>, BreakerError<E>> {
        let mut inner = self.lock();
        let is_trial = match inner.state {
            CircuitState::Closed => false,
            CircuitState::Open if self.cooled_down(&inner) => {
                info!(breaker = %self.name, "Circuit half-open, admitting trial call");
                inner.state = CircuitState::HalfOpen;
                inner.trial_in_flight = true;
                true
            }
            CircuitState::HalfOpen if !inner.trial_in_flight => {
                inner.trial_in_flight = true;
                true
            }
            CircuitState::Open | CircuitState::HalfOpen => {
                return Err(BreakerError::Open {
                    name: self.name.clone(),
                });
            }
        };
        Ok(TrialGuard {
            breaker: self,
            is_trial,
            completed: false,
        })
    }

    fn on_success(&self) {
        let mut inner = self.lock();
        if inner.state != CircuitState::Closed {
            info!(breaker = %self.name, "Circuit closed");
        }
        inner.state = CircuitState::Closed;
        inner.failures = 0;
        inner.trial_in_flight = false;
    }

    fn on_failure(&self) {
        let mut inner = self.lock();
        inner.failures = inner.failures.saturating_add(1);
        inner.last_failure_time = Some(Instant::now());
        inner.trial_in_flight = false;
        let opens = match inner.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => inner.failures >= self.config.failure_threshold,
            CircuitState::Open => false,
        };
        if opens {
            inner.state = CircuitState::Open;
            warn!(
                breaker = %self.name,
                failures = inner.failures,
                reset_timeout = ?self.config.reset_timeout,
                "Circuit opened"
            );
        }
    }
}

/// Releases the half-open trial slot if the trial future is dropped before
/// it reports an outcome.
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    is_trial: bool,
    completed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.is_trial && !self.completed {
            self.breaker.lock().trial_in_flight = false;
        }
    }
}

//! Ordered facilitator failover.
//!
//! [`FacilitatorManager`] holds facilitators in priority order (list order,
//! lowest index first). Each call goes to the first endpoint that is healthy
//! and whose circuit is not open, through that endpoint's own
//! [`CircuitBreaker`]. On failure the next endpoint is tried. When none
//! succeeds a single [`FacilitatorManagerError::AllFailed`] carries every
//! endpoint's reason.
//!
//! This is fail-fast-then-fail-over, not load balancing: the primary always
//! gets traffic as soon as it is eligible again.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use r402::{
    BoxFuture, Facilitator, PaymentPayload, PaymentRequirements, Retryable, SettleResponse,
    TransportError, VerifyResponse,
};
use r402_http::HttpFacilitatorClient;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::circuit_breaker::{
    BreakerError, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStatus,
};
use crate::config::ConfigError;

/// Manager tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FacilitatorManagerConfig {
    /// Consecutive failures after which an endpoint is marked unhealthy.
    pub max_errors: u32,
    /// Breaker settings applied to every endpoint.
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for FacilitatorManagerConfig {
    fn default() -> Self {
        Self {
            max_errors: 3,
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

/// Result of a successful [`FacilitatorManager::execute`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Executed<T> {
    /// Operation output.
    pub result: T,
    /// URL of the facilitator that produced it.
    pub facilitator: String,
}

/// Why one endpoint did not produce a result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointFailure {
    /// Endpoint URL.
    pub url: String,
    /// Human-readable reason.
    pub reason: String,
    /// Whether calling this endpoint again may succeed.
    pub retryable: bool,
}

impl fmt::Display for EndpointFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.url, self.reason)
    }
}

/// Errors raised by [`FacilitatorManager::execute`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FacilitatorManagerError {
    /// No endpoint produced a result.
    #[error("All facilitators failed: {}", join_failures(.failures))]
    AllFailed {
        /// One entry per endpoint, in priority order.
        failures: Vec<EndpointFailure>,
    },
}

impl FacilitatorManagerError {
    /// Per-endpoint reasons.
    #[must_use]
    pub fn failures(&self) -> &[EndpointFailure] {
        match self {
            Self::AllFailed { failures } => failures,
        }
    }
}

/// Retrying makes sense only if at least one endpoint failed transiently.
/// Open circuits and unhealthy endpoints will not recover within a backoff.
impl Retryable for FacilitatorManagerError {
    fn is_retryable(&self) -> bool {
        self.failures().iter().any(|f| f.retryable)
    }
}

fn join_failures(failures: &[EndpointFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Health snapshot returned by [`FacilitatorManager::status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointStatus {
    /// Endpoint URL.
    pub url: String,
    /// Priority, lower is tried first.
    pub priority: usize,
    /// Whether the endpoint is currently healthy.
    pub healthy: bool,
    /// Consecutive failures.
    pub error_count: u32,
    /// Breaker snapshot.
    pub circuit_breaker: CircuitBreakerStatus,
}

#[derive(Debug, Default)]
struct EndpointHealth {
    consecutive_errors: u32,
    unhealthy_since: Option<Instant>,
}

struct FacilitatorEndpoint {
    client: Arc<dyn Facilitator>,
    url: String,
    priority: usize,
    breaker: CircuitBreaker,
    health: Mutex<EndpointHealth>,
}

impl FacilitatorEndpoint {
    fn health(&self) -> MutexGuard<'_, EndpointHealth> {
        self.health.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_healthy(&self) -> bool {
        self.health().unhealthy_since.is_none()
    }

    /// Unhealthy endpoints are skipped until a manual reset, or until the
    /// breaker cool-down has passed, after which one trial call is let through.
    fn is_eligible(&self, retry_after: Duration) -> bool {
        self.health()
            .unhealthy_since
            .is_none_or(|since| since.elapsed() >= retry_after)
    }

    fn record_success(&self) {
        let mut health = self.health();
        if health.unhealthy_since.is_some() {
            info!(facilitator = %self.url, "Facilitator recovered");
        }
        health.consecutive_errors = 0;
        health.unhealthy_since = None;
    }

    fn record_failure(&self, max_errors: u32) {
        let mut health = self.health();
        health.consecutive_errors = health.consecutive_errors.saturating_add(1);
        if health.consecutive_errors >= max_errors {
            if health.unhealthy_since.is_none() {
                warn!(
                    facilitator = %self.url,
                    consecutive_errors = health.consecutive_errors,
                    "Facilitator marked unhealthy"
                );
            }
            // A failed trial call restarts the cool-down.
            health.unhealthy_since = Some(Instant::now());
        }
    }

    fn reset(&self) {
        *self.health() = EndpointHealth::default();
        self.breaker.reset();
    }

    fn status(&self) -> EndpointStatus {
        let health = self.health();
        EndpointStatus {
            url: self.url.clone(),
            priority: self.priority,
            healthy: health.unhealthy_since.is_none(),
            error_count: health.consecutive_errors,
            circuit_breaker: self.breaker.state(),
        }
    }
}

/// Runs facilitator operations with per-endpoint circuit breaking and
/// ordered failover.
pub struct FacilitatorManager {
    endpoints: Vec<FacilitatorEndpoint>,
    config: FacilitatorManagerConfig,
}

impl fmt::Debug for FacilitatorManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FacilitatorManager")
            .field(
                "endpoints",
                &self.endpoints.iter().map(|e| &e.url).collect::<Vec<_>>(),
            )
            .field("config", &self.config)
            .finish()
    }
}

impl FacilitatorManager {
    /// Creates a manager over `facilitators`, in priority order.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if the list is empty.
    pub fn new(
        facilitators: Vec<Arc<dyn Facilitator>>,
        config: FacilitatorManagerConfig,
    ) -> Result<Self, ConfigError> {
        if facilitators.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one facilitator is required".to_owned(),
            ));
        }
        let endpoints = facilitators
            .into_iter()
            .enumerate()
            .map(|(priority, client)| {
                let url = client.url().to_owned();
                FacilitatorEndpoint {
                    breaker: CircuitBreaker::new(url.clone(), config.circuit_breaker),
                    client,
                    url,
                    priority,
                    health: Mutex::new(EndpointHealth::default()),
                }
            })
            .collect();
        Ok(Self { endpoints, config })
    }

    /// Creates a manager of [`HttpFacilitatorClient`]s from base URLs.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the list is empty or a URL does not parse.
    pub fn from_urls<S: AsRef<str>>(
        urls: &[S],
        config: FacilitatorManagerConfig,
        request_timeout: Option<Duration>,
    ) -> Result<Self, ConfigError> {
        let facilitators = urls
            .iter()
            .map(|url| {
                let client = HttpFacilitatorClient::try_from(url.as_ref())?;
                let client = match request_timeout {
                    Some(timeout) => client.with_timeout(timeout),
                    None => client,
                };
                Ok(Arc::new(client) as Arc<dyn Facilitator>)
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;
        Self::new(facilitators, config)
    }

    /// Runs `operation` against the first eligible endpoint, failing over on
    /// errors.
    ///
    /// Every `Err` from `operation` counts as an endpoint failure: it feeds
    /// the endpoint's breaker and error counter. Business verdicts such as
    /// `isValid: false` are `Ok` values and do not.
    ///
    /// # Errors
    ///
    /// Returns [`FacilitatorManagerError::AllFailed`] when no endpoint
    /// produced a result.
    pub async fn execute<'b, T, F>(
        &self,
        operation: F,
    ) -> Result<Executed<T>, FacilitatorManagerError>
    where
        F: Fn(Arc<dyn Facilitator>) -> BoxFuture<'b, Result<T, TransportError>>,
    {
        let retry_after = self.config.circuit_breaker.reset_timeout;
        let mut failures = Vec::with_capacity(self.endpoints.len());

        for endpoint in &self.endpoints {
            if !endpoint.is_eligible(retry_after) {
                debug!(facilitator = %endpoint.url, "Skipping unhealthy facilitator");
                failures.push(EndpointFailure {
                    url: endpoint.url.clone(),
                    reason: "endpoint unhealthy".to_owned(),
                    retryable: false,
                });
                continue;
            }
            if endpoint.breaker.is_open() {
                debug!(facilitator = %endpoint.url, "Skipping facilitator with open circuit");
                failures.push(EndpointFailure {
                    url: endpoint.url.clone(),
                    reason: "circuit open".to_owned(),
                    retryable: false,
                });
                continue;
            }

            let client = Arc::clone(&endpoint.client);
            match endpoint.breaker.execute(|| operation(client)).await {
                Ok(result) => {
                    endpoint.record_success();
                    return Ok(Executed {
                        result,
                        facilitator: endpoint.url.clone(),
                    });
                }
                Err(BreakerError::Open { .. }) => {
                    failures.push(EndpointFailure {
                        url: endpoint.url.clone(),
                        reason: "circuit open".to_owned(),
                        retryable: false,
                    });
                }
                Err(BreakerError::Inner(err)) => {
                    endpoint.record_failure(self.config.max_errors);
                    warn!(
                        facilitator = %endpoint.url,
                        error = %err,
                        "Facilitator call failed, trying next"
                    );
                    failures.push(EndpointFailure {
                        url: endpoint.url.clone(),
                        reason: err.to_string(),
                        retryable: err.is_retryable(),
                    });
                }
            }
        }

        Err(FacilitatorManagerError::AllFailed { failures })
    }

    /// Verifies a payment on the first eligible facilitator.
    ///
    /// # Errors
    ///
    /// See [`Self::execute`].
    pub async fn verify(
        &self,
        payload: &PaymentPayload,
        requirements: &PaymentRequirements,
    ) -> Result<Executed<VerifyResponse>, FacilitatorManagerError> {
        self.execute(|facilitator| {
            Box::pin(async move { facilitator.verify(payload, requirements).await })
        })
        .await
    }

    /// Settles a payment on the first eligible facilitator.
    ///
    /// # Errors
    ///
    /// See [`Self::execute`].
    pub async fn settle(
        &self,
        payload: &PaymentPayload,
        requirements: &PaymentRequirements,
    ) -> Result<Executed<SettleResponse>, FacilitatorManagerError> {
        self.execute(|facilitator| {
            Box::pin(async move { facilitator.settle(payload, requirements).await })
        })
        .await
    }

    /// Health of every endpoint, in priority order.
    #[must_use]
    pub fn status(&self) -> Vec<EndpointStatus> {
        self.endpoints.iter().map(FacilitatorEndpoint::status).collect()
    }

    /// Returns `true` if at least one endpoint is healthy.
    #[must_use]
    pub fn has_healthy_endpoint(&self) -> bool {
        self.endpoints.iter().any(FacilitatorEndpoint::is_healthy)
    }

    /// Marks one endpoint healthy and closes its breaker.
    ///
    /// Returns `false` if no endpoint has that URL.
    pub fn reset_endpoint(&self, url: &str) -> bool {
        let url = url.trim_end_matches('/');
        match self.endpoints.iter().find(|e| e.url == url) {
            Some(endpoint) => {
                endpoint.reset();
                info!(facilitator = %endpoint.url, "Facilitator reset");
                true
            }
            None => false,
        }
    }

    /// Resets every endpoint.
    pub fn reset_all(&self) {
        for endpoint in &self.endpoints {
            endpoint.reset();
        }
        info!(count = self.endpoints.len(), "All facilitators reset");
    }
}

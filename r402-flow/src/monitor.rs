//! Asynchronous confirmation of settled transactions.
//!
//! [`TransactionMonitor`] keeps a set of pending transaction hashes and polls
//! the ledger for them on a fixed interval. Every hash gets exactly one
//! terminal event on the [`EventBus`]: `Confirmed`, `Failed` or `Timeout`.
//!
//! A `Timeout` only means monitoring gave up. The transaction may still be
//! committed afterwards; callers that need certainty must query the ledger.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::future::join_all;
use r402::{LedgerClient, LedgerError, LedgerStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::{DurationMilliSeconds, serde_as};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::{EventBus, FlowEvent, TransactionStatus};

/// Polling bounds.
#[serde_as]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Time between two polling rounds.
    #[serde(rename = "poll_interval_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub poll_interval: Duration,
    /// How long a hash may stay unresolved before it times out.
    #[serde(rename = "max_wait_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub max_wait: Duration,
    /// Number of resolved outcomes remembered for [`TransactionMonitor::wait_for`].
    pub outcome_capacity: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            max_wait: Duration::from_secs(60),
            outcome_capacity: 1024,
        }
    }
}

/// Final result of monitoring one transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionOutcome {
    /// Committed and executed successfully.
    Confirmed {
        /// Ledger version, when reported.
        version: Option<u64>,
    },
    /// Committed but execution failed.
    Failed {
        /// VM status reported by the ledger.
        vm_status: String,
    },
    /// Not resolved within the wait bound. Inconclusive.
    Unknown,
}

impl TransactionOutcome {
    fn from_event(event: &FlowEvent) -> Option<Self> {
        match event {
            FlowEvent::Confirmed { version, .. } => Some(Self::Confirmed { version: *version }),
            FlowEvent::Failed { error, .. } => Some(Self::Failed {
                vm_status: error.clone(),
            }),
            FlowEvent::Timeout { .. } => Some(Self::Unknown),
            FlowEvent::Tracked { .. } | FlowEvent::Retry { .. } => None,
        }
    }

    const fn status(&self) -> TransactionStatus {
        match self {
            Self::Confirmed { .. } => TransactionStatus::Confirmed,
            Self::Failed { .. } => TransactionStatus::Failed,
            Self::Unknown => TransactionStatus::Timeout,
        }
    }
}

/// Snapshot returned by [`TransactionMonitor::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorStats {
    /// Hashes still being polled.
    pub pending: usize,
    /// Whether the polling task is running.
    pub is_running: bool,
}

#[derive(Debug)]
struct PendingTransaction {
    metadata: Value,
    submitted_at: Instant,
}

#[derive(Debug, Default)]
struct OutcomeCache {
    outcomes: HashMap<String, TransactionOutcome>,
    order: VecDeque<String>,
}

struct MonitorInner {
    ledger: Arc<dyn LedgerClient>,
    events: EventBus,
    config: MonitorConfig,
    pending: DashMap<String, PendingTransaction>,
    resolved: Mutex<OutcomeCache>,
}

impl MonitorInner {
    fn resolved(&self) -> MutexGuard<'_, OutcomeCache> {
        self.resolved.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn outcome(&self, hash: &str) -> Option<TransactionOutcome> {
        self.resolved().outcomes.get(hash).cloned()
    }

    fn remember(&self, hash: String, outcome: TransactionOutcome) {
        let mut cache = self.resolved();
        if cache.outcomes.insert(hash.clone(), outcome).is_none() {
            cache.order.push_back(hash);
        }
        while cache.outcomes.len() > self.config.outcome_capacity.max(1) {
            let Some(oldest) = cache.order.pop_front() else {
                break;
            };
            cache.outcomes.remove(&oldest);
        }
    }

    async fn poll_once(&self) -> usize {
        let hashes: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        if hashes.is_empty() {
            return 0;
        }

        let bound = self.config.poll_interval;
        let statuses = join_all(hashes.iter().map(|hash| async move {
            let status = tokio::time::timeout(bound, self.ledger.query_status(hash))
                .await
                .unwrap_or_else(|_| {
                    Err(LedgerError::Unavailable(format!(
                        "status query exceeded {bound:?}"
                    )))
                });
            (hash.as_str(), status)
        }))
        .await;

        let mut resolved = 0;
        for (hash, status) in statuses {
            let outcome = match status {
                Ok(LedgerStatus {
                    found: true,
                    success: true,
                    version,
                    ..
                }) => Some(TransactionOutcome::Confirmed { version }),
                Ok(LedgerStatus {
                    found: true,
                    vm_status,
                    ..
                }) => Some(TransactionOutcome::Failed {
                    vm_status: vm_status.unwrap_or_else(|| "execution failed".to_owned()),
                }),
                Ok(_) => None,
                Err(err) => {
                    warn!(hash, error = %err, "Ledger status query failed");
                    None
                }
            };
            let outcome = outcome.or_else(|| {
                self.pending
                    .get(hash)
                    .filter(|p| p.submitted_at.elapsed() >= self.config.max_wait)
                    .map(|_| TransactionOutcome::Unknown)
            });
            if outcome.is_some_and(|outcome| self.finish(hash, outcome)) {
                resolved += 1;
            }
        }
        resolved
    }

    /// Moves `hash` out of the pending set. Only the caller that removes it
    /// publishes the terminal event.
    ///
    /// The outcome is remembered while the pending entry is still locked, so
    /// [`TransactionMonitor::track`] always sees one or the other.
    fn finish(&self, hash: &str, outcome: TransactionOutcome) -> bool {
        let Entry::Occupied(slot) = self.pending.entry(hash.to_owned()) else {
            return false;
        };
        self.remember(hash.to_owned(), outcome.clone());
        let (hash, pending) = slot.remove_entry();

        let metadata = pending.metadata;
        let event = match outcome {
            TransactionOutcome::Confirmed { version } => {
                info!(%hash, ?version, "Transaction confirmed");
                FlowEvent::Confirmed {
                    hash,
                    version,
                    metadata,
                }
            }
            TransactionOutcome::Failed { vm_status } => {
                warn!(%hash, %vm_status, "Transaction failed on ledger");
                FlowEvent::Failed {
                    hash,
                    error: vm_status,
                    metadata,
                }
            }
            TransactionOutcome::Unknown => {
                warn!(%hash, max_wait = ?self.config.max_wait, "Transaction monitoring timed out");
                FlowEvent::Timeout { hash, metadata }
            }
        };
        self.events.emit(event);
        true
    }
}

/// Polls the ledger for pending transactions.
pub struct TransactionMonitor {
    inner: Arc<MonitorInner>,
    task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl fmt::Debug for TransactionMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionMonitor")
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl TransactionMonitor {
    /// Creates a stopped monitor publishing on `events`.
    #[must_use]
    pub fn new(ledger: Arc<dyn LedgerClient>, events: EventBus, config: MonitorConfig) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                ledger,
                events,
                config,
                pending: DashMap::new(),
                resolved: Mutex::new(OutcomeCache::default()),
            }),
            task: Mutex::new(None),
        }
    }

    /// Returns the polling bounds.
    #[must_use]
    pub fn config(&self) -> &MonitorConfig {
        &self.inner.config
    }

    /// Starts monitoring `hash`.
    ///
    /// Returns `false` and publishes nothing if the hash is already pending or
    /// has already reached a terminal state. Resolved hashes are remembered up
    /// to `outcome_capacity`.
    pub fn track(&self, hash: impl Into<String>, metadata: Value) -> bool {
        let hash = hash.into();
        match self.inner.pending.entry(hash.clone()) {
            Entry::Occupied(_) => {
                debug!(%hash, "Transaction already tracked");
                return false;
            }
            Entry::Vacant(_) if self.inner.outcome(&hash).is_some() => {
                debug!(%hash, "Transaction already resolved");
                return false;
            }
            Entry::Vacant(slot) => {
                slot.insert(PendingTransaction {
                    metadata: metadata.clone(),
                    submitted_at: Instant::now(),
                });
            }
        }
        debug!(%hash, "Tracking transaction");
        self.inner.events.emit(FlowEvent::Tracked { hash, metadata });
        true
    }

    /// Runs one polling round and returns how many hashes reached a terminal
    /// state.
    pub async fn poll_once(&self) -> usize {
        self.inner.poll_once().await
    }

    /// Spawns the polling task. Does nothing if it is already running.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.as_ref().is_some_and(|(_, handle)| !handle.is_finished()) {
            return;
        }

        let token = CancellationToken::new();
        let cancelled = token.clone();
        let inner = Arc::downgrade(&self.inner);
        let period = self.inner.config.poll_interval;
        let handle = tokio::spawn(poll_loop(inner, period, cancelled));
        *task = Some((token, handle));
        info!(poll_interval = ?period, "Transaction monitor started");
    }

    /// Stops the polling task. Pending hashes are kept.
    pub fn stop(&self) {
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some((token, _)) = task {
            token.cancel();
            info!("Transaction monitor stopped");
        }
    }

    /// Waits until `hash` reaches a terminal state, at most `timeout`.
    ///
    /// Returns [`TransactionOutcome::Unknown`] for hashes that are neither
    /// pending nor recently resolved, and when the wait times out.
    pub async fn wait_for(&self, hash: &str, timeout: Duration) -> TransactionOutcome {
        // Subscribe before checking state so no terminal event is missed.
        let mut events = self.inner.events.subscribe();
        if let Some(outcome) = self.inner.outcome(hash) {
            return outcome;
        }
        if !self.inner.pending.contains_key(hash) {
            return TransactionOutcome::Unknown;
        }

        let wait = async {
            loop {
                match events.recv().await {
                    Ok(event) if event.is_terminal() && event.hash() == Some(hash) => {
                        return TransactionOutcome::from_event(&event)
                            .unwrap_or(TransactionOutcome::Unknown);
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(hash, skipped, "Confirmation waiter lagged");
                        if let Some(outcome) = self.inner.outcome(hash) {
                            return outcome;
                        }
                    }
                    Err(RecvError::Closed) => return TransactionOutcome::Unknown,
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .unwrap_or(TransactionOutcome::Unknown)
    }

    /// Current status of `hash`, if it is pending or recently resolved.
    #[must_use]
    pub fn status(&self, hash: &str) -> Option<TransactionStatus> {
        if self.inner.pending.contains_key(hash) {
            return Some(TransactionStatus::Pending);
        }
        self.inner.outcome(hash).map(|o| o.status())
    }

    /// Number of hashes still pending.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Pending count and run state.
    #[must_use]
    pub fn stats(&self) -> MonitorStats {
        let is_running = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|(_, handle)| !handle.is_finished());
        MonitorStats {
            pending: self.pending_count(),
            is_running,
        }
    }
}

impl Drop for TransactionMonitor {
    fn drop(&mut self) {
        if let Some((token, _)) = self
            .task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            token.cancel();
        }
    }
}

async fn poll_loop(inner: Weak<MonitorInner>, period: Duration, cancelled: CancellationToken) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = cancelled.cancelled() => break,
            _ = ticker.tick() => {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                let resolved = inner.poll_once().await;
                if resolved > 0 {
                    debug!(resolved, pending = inner.pending.len(), "Polling round finished");
                }
            }
        }
    }
}

//! Observability events.
//!
//! Components publish [`FlowEvent`]s on a shared [`EventBus`]; dashboards and
//! loggers subscribe to it instead of being called directly.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

/// Default number of events buffered per subscriber before it lags.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Lifecycle status of a tracked ledger transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    /// Submitted, not yet resolved.
    Pending,
    /// Executed successfully on the ledger.
    Confirmed,
    /// Found on the ledger but execution failed.
    Failed,
    /// Monitoring gave up. The transaction may still land later.
    Timeout,
}

/// An event published by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowEvent {
    /// A transaction hash started being monitored.
    Tracked {
        /// Transaction hash.
        hash: String,
        /// Caller-supplied metadata.
        metadata: Value,
    },
    /// A monitored transaction executed successfully.
    Confirmed {
        /// Transaction hash.
        hash: String,
        /// Ledger version it was committed at.
        version: Option<u64>,
        /// Caller-supplied metadata.
        metadata: Value,
    },
    /// A monitored transaction was found but failed.
    Failed {
        /// Transaction hash.
        hash: String,
        /// VM status or failure reason.
        error: String,
        /// Caller-supplied metadata.
        metadata: Value,
    },
    /// Monitoring gave up on a transaction.
    Timeout {
        /// Transaction hash.
        hash: String,
        /// Caller-supplied metadata.
        metadata: Value,
    },
    /// A facilitator operation is about to be retried.
    Retry {
        /// Operation name, e.g. `"verify"`.
        operation: String,
        /// 1-indexed retry number.
        attempt: u32,
        /// Configured retry bound.
        max_retries: u32,
        /// Wait before the next attempt, in milliseconds.
        delay_ms: u64,
        /// Error that triggered the retry.
        error: String,
    },
}

impl FlowEvent {
    /// Returns the transaction hash for monitor events.
    #[must_use]
    pub fn hash(&self) -> Option<&str> {
        match self {
            Self::Tracked { hash, .. }
            | Self::Confirmed { hash, .. }
            | Self::Failed { hash, .. }
            | Self::Timeout { hash, .. } => Some(hash),
            Self::Retry { .. } => None,
        }
    }

    /// Returns the transaction status this event reports, if any.
    #[must_use]
    pub const fn status(&self) -> Option<TransactionStatus> {
        match self {
            Self::Tracked { .. } => Some(TransactionStatus::Pending),
            Self::Confirmed { .. } => Some(TransactionStatus::Confirmed),
            Self::Failed { .. } => Some(TransactionStatus::Failed),
            Self::Timeout { .. } => Some(TransactionStatus::Timeout),
            Self::Retry { .. } => None,
        }
    }

    /// Returns `true` for `Confirmed`, `Failed` and `Timeout`.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Confirmed { .. } | Self::Failed { .. } | Self::Timeout { .. }
        )
    }
}

/// Fan-out channel for [`FlowEvent`]s.
///
/// Cloning yields another handle to the same bus. Publishing never blocks and
/// never fails; events published while nobody is subscribed are dropped.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<FlowEvent>,
}

impl EventBus {
    /// Creates a bus buffering up to `capacity` events per subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribes to all events published from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<FlowEvent> {
        self.sender.subscribe()
    }

    /// Publishes an event to every current subscriber.
    pub fn emit(&self, event: FlowEvent) {
        tracing::trace!(?event, "x402.event");
        // No subscribers is fine.
        let _ = self.sender.send(event);
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_subscribers_receive_events_in_order() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.emit(FlowEvent::Tracked {
            hash: "0x1".into(),
            metadata: Value::Null,
        });
        bus.emit(FlowEvent::Timeout {
            hash: "0x1".into(),
            metadata: Value::Null,
        });

        let first = rx.recv().await.unwrap();
        assert_eq!(first.status(), Some(TransactionStatus::Pending));
        assert!(!first.is_terminal());
        let second = rx.recv().await.unwrap();
        assert!(second.is_terminal());
        assert_eq!(second.hash(), Some("0x1"));
    }

    #[test]
    fn test_emit_without_subscribers_is_silent() {
        let bus = EventBus::new(0);
        assert_eq!(bus.subscriber_count(), 0);
        bus.emit(FlowEvent::Retry {
            operation: "verify".into(),
            attempt: 1,
            max_retries: 3,
            delay_ms: 1000,
            error: "timeout".into(),
        });
    }

    #[test]
    fn test_event_wire_format() {
        let event = FlowEvent::Confirmed {
            hash: "0xabc".into(),
            version: Some(42),
            metadata: json!({ "requestId": "r1" }),
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({
                "type": "confirmed",
                "hash": "0xabc",
                "version": 42,
                "metadata": { "requestId": "r1" }
            })
        );
    }
}

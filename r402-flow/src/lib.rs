#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Resilient client-side payment flows for x402.
//!
//! This crate drives the pay-per-request round-trip against unreliable
//! facilitators: it requests a resource, parses the 402 challenge, checks the
//! payer's budget, has the ledger client sign a transfer, verifies and settles
//! it through the first available facilitator, issues a tamper-evident
//! receipt and optionally watches the ledger for confirmation.
//!
//! # Overview
//!
//! ```text
//! PaymentFlow::pay(url)
//!   -> ResourceTransport request -> 402 + PaymentRequirements
//!   -> BudgetGuard::validate
//!   -> LedgerClient::build_and_sign
//!   -> RetryPolicy( FacilitatorManager::verify )
//!   -> RetryPolicy( FacilitatorManager::settle )
//!   -> BudgetGuard::record_spend -> ReceiptGenerator::generate_receipt
//!   -> TransactionMonitor::track -> paid re-request
//! ```
//!
//! Every facilitator endpoint has its own [`CircuitBreaker`]. Observability
//! consumers subscribe to the [`EventBus`].
//!
//! # Modules
//!
//! - [`retry`] - Exponential backoff driven by [`r402::Retryable`]
//! - [`circuit_breaker`] - Three-state breaker, one per endpoint
//! - [`manager`] - Ordered facilitator failover
//! - [`monitor`] - Ledger confirmation polling
//! - [`budget`] - Per-payer spending limits
//! - [`receipt`] - Signed payment receipts
//! - [`flow`] - The payment state machine
//! - [`events`] - Event channel
//! - [`config`] - TOML configuration

pub mod budget;
pub mod circuit_breaker;
pub mod config;
pub mod events;
pub mod flow;
pub mod manager;
pub mod monitor;
pub mod receipt;
pub mod retry;

pub use budget::{BudgetCheck, BudgetConfig, BudgetGuard, BudgetViolation, atomic_to_decimal};
pub use circuit_breaker::{
    BreakerError, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStatus, CircuitState,
};
pub use config::{ConfigError, FlowConfig};
pub use events::{EventBus, FlowEvent, TransactionStatus};
pub use flow::{
    ExecuteOptions, FailureCode, FlowFailure, FlowStatus, PayOptions, PaymentFlow,
    PaymentFlowRecord, PaymentResult, RequestOptions, RequirementsOutcome,
};
pub use manager::{
    EndpointFailure, EndpointStatus, Executed, FacilitatorManager, FacilitatorManagerConfig,
    FacilitatorManagerError,
};
pub use monitor::{MonitorConfig, MonitorStats, TransactionMonitor, TransactionOutcome};
pub use receipt::{Receipt, ReceiptConfig, ReceiptData, ReceiptError, ReceiptGenerator};
pub use retry::{RetryAttempt, RetryConfig, RetryPolicy};

//! The payment flow state machine.
//!
//! A flow moves through
//! `INIT -> REQUIREMENTS_RECEIVED -> VALIDATED -> EXECUTING -> {COMPLETED | FAILED}`.
//! [`PaymentFlow::pay`] chains the three caller-facing steps:
//!
//! 1. [`PaymentFlow::get_requirements`] requests the resource and parses the
//!    402 challenge.
//! 2. [`PaymentFlow::validate_payment`] checks the amount against the budget.
//! 3. [`PaymentFlow::execute_payment`] signs, verifies, settles, records the
//!    spend, issues a receipt, optionally tracks the transaction and fetches
//!    the paid resource.
//!
//! Expected failures (budget, verification, settlement, unreachable
//! facilitators) come back as a [`PaymentResult`] with `success: false`, never
//! as a panic or an `Err`.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use r402::{
    LedgerClient, LedgerError, PaymentPayload, PaymentRequired, PaymentRequirements,
    PaymentSigner, ResourceInfo, ResourceRequest, ResourceResponse, ResourceTransport,
    SettleResponse, Transfer, UnixTimestamp, VerifyResponse,
};
use r402_http::HttpResourceClient;
use r402_http::constants::{
    PAYMENT_REQUIRED_HEADER, PAYMENT_SIGNATURE_HEADER, PAYMENT_TRANSACTION_HEADER,
};
use r402_http::headers::{decode_payment_required, encode_payment_signature};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::budget::{BudgetCheck, BudgetGuard, BudgetViolation, atomic_to_decimal};
use crate::config::{ConfigError, FlowConfig};
use crate::events::{EventBus, FlowEvent};
use crate::manager::{Executed, FacilitatorManager, FacilitatorManagerError};
use crate::monitor::{TransactionMonitor, TransactionOutcome};
use crate::receipt::{ReceiptData, ReceiptGenerator};
use crate::retry::RetryPolicy;

/// Where a flow is in the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowStatus {
    /// Not requested yet.
    Init,
    /// A challenge was parsed.
    RequirementsReceived,
    /// The budget accepted the payment.
    Validated,
    /// Signing, verification or settlement is in progress.
    Executing,
    /// Settled and receipted.
    Completed,
    /// Ended without settlement.
    Failed,
}

impl FlowStatus {
    /// Returns `true` for `Completed` and `Failed`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Machine-readable failure code in a [`PaymentResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureCode {
    /// Unknown or expired `request_id`.
    NotFound,
    /// The flow is not in a state that allows the operation.
    InvalidState,
    /// The single payment is above the configured ceiling.
    AmountExceedsMax,
    /// The payment would exceed the payer's daily budget.
    DailyBudgetExceeded,
    /// The transaction could not be built or signed.
    SigningFailed,
    /// The facilitator rejected the payment.
    VerificationFailed,
    /// The facilitator could not settle the payment.
    SettlementFailed,
    /// No facilitator produced an answer.
    FacilitatorUnavailable,
    /// Verify and settle did not finish within `maxTimeoutSeconds`.
    Timeout,
    /// The caller cancelled the flow.
    Cancelled,
    /// The 402 response did not carry usable requirements.
    InvalidChallenge,
    /// The resource could not be reached.
    NetworkError,
}

impl FailureCode {
    /// Wire code, e.g. `DAILY_BUDGET_EXCEEDED`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "NOT_FOUND",
            Self::InvalidState => "INVALID_STATE",
            Self::AmountExceedsMax => "AMOUNT_EXCEEDS_MAX",
            Self::DailyBudgetExceeded => "DAILY_BUDGET_EXCEEDED",
            Self::SigningFailed => "SIGNING_FAILED",
            Self::VerificationFailed => "VERIFICATION_FAILED",
            Self::SettlementFailed => "SETTLEMENT_FAILED",
            Self::FacilitatorUnavailable => "FACILITATOR_UNAVAILABLE",
            Self::Timeout => "TIMEOUT",
            Self::Cancelled => "CANCELLED",
            Self::InvalidChallenge => "INVALID_CHALLENGE",
            Self::NetworkError => "NETWORK_ERROR",
        }
    }
}

impl fmt::Display for FailureCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<BudgetViolation> for FailureCode {
    fn from(violation: BudgetViolation) -> Self {
        match violation {
            BudgetViolation::AmountExceedsMax => Self::AmountExceedsMax,
            BudgetViolation::DailyBudgetExceeded => Self::DailyBudgetExceeded,
        }
    }
}

/// A step of the flow could not proceed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct FlowFailure {
    /// Failure code.
    pub code: FailureCode,
    /// Human-readable reason.
    pub message: String,
}

impl FlowFailure {
    /// Creates a failure.
    #[must_use]
    pub fn new(code: FailureCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn not_found(request_id: &str) -> Self {
        Self::new(
            FailureCode::NotFound,
            format!("payment request {request_id} not found or expired"),
        )
    }

    fn cancelled() -> Self {
        Self::new(FailureCode::Cancelled, "payment cancelled")
    }
}

/// Snapshot of a stored flow, returned by [`PaymentFlow::flow_status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentFlowRecord {
    /// Flow identifier.
    pub request_id: String,
    /// Resource URL.
    pub url: String,
    /// HTTP method of the resource request.
    pub method: String,
    /// The requirement selected from the challenge.
    pub requirements: PaymentRequirements,
    /// Current state.
    pub status: FlowStatus,
    /// When the challenge was received.
    pub created_at: UnixTimestamp,
    /// Whether the budget accepted the payment.
    pub validated: bool,
    /// Payer the flow was validated for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payer: Option<String>,
    /// Settled transaction hash.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction: Option<String>,
    /// Receipt issued for the settlement.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt_id: Option<String>,
    /// Failure reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Failure code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<FailureCode>,
}

#[derive(Debug)]
struct FlowEntry {
    record: PaymentFlowRecord,
    request: ResourceRequest,
    resource: Option<ResourceInfo>,
    created: Instant,
}

/// How to request the resource.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestOptions {
    /// HTTP method; `GET` when unset.
    pub method: Option<String>,
    /// Extra request headers, sent on the unpaid request and the paid retry.
    pub headers: Vec<(String, String)>,
    /// Request body.
    pub body: Option<Vec<u8>>,
}

impl RequestOptions {
    /// Sets the HTTP method.
    #[must_use]
    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    /// Adds a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Sets the body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    fn into_request(self, url: &str) -> ResourceRequest {
        ResourceRequest {
            url: url.to_owned(),
            method: self
                .method
                .map_or_else(|| "GET".to_owned(), |m| m.to_ascii_uppercase()),
            headers: self.headers,
            body: self.body,
        }
    }
}

/// Outcome of [`PaymentFlow::get_requirements`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequirementsOutcome {
    /// The resource answered without a challenge.
    Unprotected {
        /// The resource response.
        response: ResourceResponse,
    },
    /// The resource demands payment; a flow was stored.
    Protected {
        /// Identifier of the stored flow.
        request_id: String,
        /// The selected requirement.
        requirements: PaymentRequirements,
    },
}

/// Knobs for [`PaymentFlow::execute_payment`].
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    /// Aborts the flow before settlement starts.
    pub cancel: Option<CancellationToken>,
    /// Hand the settled transaction to the monitor.
    pub track: bool,
    /// Wait this long for ledger confirmation. Implies `track`.
    pub wait_for_confirmation: Option<Duration>,
    /// Re-request the resource with the payment headers.
    pub fetch_resource: bool,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            cancel: None,
            track: true,
            wait_for_confirmation: None,
            fetch_resource: true,
        }
    }
}

impl ExecuteOptions {
    /// Sets the cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Waits up to `timeout` for ledger confirmation.
    #[must_use]
    pub const fn wait_for_confirmation(mut self, timeout: Duration) -> Self {
        self.wait_for_confirmation = Some(timeout);
        self.track = true;
        self
    }

    /// Skips transaction monitoring.
    #[must_use]
    pub const fn without_tracking(mut self) -> Self {
        self.track = false;
        self.wait_for_confirmation = None;
        self
    }

    /// Skips the paid re-request.
    #[must_use]
    pub const fn without_fetch(mut self) -> Self {
        self.fetch_resource = false;
        self
    }
}

/// Knobs for [`PaymentFlow::pay`].
#[derive(Debug, Clone, Default)]
pub struct PayOptions {
    /// How to request the resource.
    pub request: RequestOptions,
    /// How to execute the payment.
    pub execute: ExecuteOptions,
}

/// What a caller gets back from [`PaymentFlow::pay`] and
/// [`PaymentFlow::execute_payment`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PaymentResult {
    /// Whether the resource was obtained, paid or not.
    pub success: bool,
    /// Whether the resource demanded payment.
    pub protected: bool,
    /// Flow identifier, for protected resources.
    pub request_id: Option<String>,
    /// Receipt issued for the settlement.
    pub receipt_id: Option<String>,
    /// Settled transaction hash.
    pub transaction: Option<String>,
    /// Facilitator that settled the payment.
    pub facilitator: Option<String>,
    /// Resource response: the first response for unprotected resources, the paid
    /// retry otherwise.
    pub response: Option<ResourceResponse>,
    /// Failure reason. On a successful payment, a failed paid retry.
    pub error: Option<String>,
    /// Failure code.
    pub code: Option<FailureCode>,
    /// Ledger confirmation, when waited for.
    pub outcome: Option<TransactionOutcome>,
}

impl PaymentResult {
    fn unprotected(response: ResourceResponse) -> Self {
        Self {
            success: true,
            protected: false,
            response: Some(response),
            ..Self::default()
        }
    }

    fn failure(request_id: Option<String>, protected: bool, failure: FlowFailure) -> Self {
        Self {
            success: false,
            protected,
            request_id,
            error: Some(failure.message),
            code: Some(failure.code),
            ..Self::default()
        }
    }
}

/// Orchestrates pay-per-request round-trips.
///
/// All methods take `&self`; share one instance across tasks with `Arc`.
pub struct PaymentFlow {
    transport: Arc<dyn ResourceTransport>,
    ledger: Arc<dyn LedgerClient>,
    manager: FacilitatorManager,
    retry: RetryPolicy,
    monitor: TransactionMonitor,
    budget: BudgetGuard,
    receipts: ReceiptGenerator,
    events: EventBus,
    flows: DashMap<String, FlowEntry>,
    flow_ttl: Duration,
    preferred_network: Option<String>,
}

impl fmt::Debug for PaymentFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PaymentFlow")
            .field("manager", &self.manager)
            .field("flows", &self.flows.len())
            .field("flow_ttl", &self.flow_ttl)
            .field("preferred_network", &self.preferred_network)
            .finish_non_exhaustive()
    }
}

impl PaymentFlow {
    /// Assembles an engine from explicit collaborators.
    ///
    /// `config.facilitators` is ignored; `manager` is used as given.
    #[must_use]
    pub fn new(
        config: FlowConfig,
        manager: FacilitatorManager,
        transport: Arc<dyn ResourceTransport>,
        ledger: Arc<dyn LedgerClient>,
    ) -> Self {
        let events = EventBus::new(config.event_capacity);
        let monitor = TransactionMonitor::new(Arc::clone(&ledger), events.clone(), config.monitor);
        Self {
            transport,
            ledger,
            manager,
            retry: RetryPolicy::new(config.retry),
            monitor,
            budget: BudgetGuard::new(config.budget),
            receipts: ReceiptGenerator::new(config.receipts),
            events,
            flows: DashMap::new(),
            flow_ttl: config.flow_ttl,
            preferred_network: config.preferred_network,
        }
    }

    /// Builds HTTP facilitator and resource clients from `config`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the config is invalid, lists no
    /// facilitator, or a client cannot be built.
    pub fn from_config(
        config: FlowConfig,
        ledger: Arc<dyn LedgerClient>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let manager = FacilitatorManager::from_urls(
            &config.facilitators,
            config.manager,
            Some(config.request_timeout),
        )?;
        let transport: Arc<dyn ResourceTransport> =
            Arc::new(HttpResourceClient::with_timeout(config.request_timeout)?);
        Ok(Self::new(config, manager, transport, ledger))
    }

    /// Requests `url` and, if it answers with a 402 challenge, stores a new
    /// flow for it.
    ///
    /// # Errors
    ///
    /// Returns [`FailureCode::NetworkError`] if the resource could not be
    /// reached and [`FailureCode::InvalidChallenge`] if the 402 response did
    /// not carry a usable requirement.
    #[instrument(name = "x402.flow.get_requirements", skip_all, fields(url = %url))]
    pub async fn get_requirements(
        &self,
        url: &str,
        options: RequestOptions,
    ) -> Result<RequirementsOutcome, FlowFailure> {
        self.purge_expired();

        let request = options.into_request(url);
        let response = self
            .transport
            .fetch(&request)
            .await
            .map_err(|e| FlowFailure::new(FailureCode::NetworkError, e.to_string()))?;
        if !response.is_payment_required() {
            debug!(status = response.status, "Resource is not protected");
            return Ok(RequirementsOutcome::Unprotected { response });
        }

        let challenge = parse_challenge(&response)?;
        let requirements = challenge
            .select(self.preferred_network.as_deref())
            .cloned()
            .ok_or_else(|| {
                FlowFailure::new(
                    FailureCode::InvalidChallenge,
                    "challenge lists no payment requirements",
                )
            })?;
        if requirements.amount_atomic().is_none() {
            return Err(FlowFailure::new(
                FailureCode::InvalidChallenge,
                format!("invalid amount {:?}", requirements.amount),
            ));
        }

        let request_id = Uuid::new_v4().to_string();
        let record = PaymentFlowRecord {
            request_id: request_id.clone(),
            url: request.url.clone(),
            method: request.method.clone(),
            requirements: requirements.clone(),
            status: FlowStatus::RequirementsReceived,
            created_at: UnixTimestamp::now(),
            validated: false,
            payer: None,
            transaction: None,
            receipt_id: None,
            error: None,
            code: None,
        };
        self.flows.insert(
            request_id.clone(),
            FlowEntry {
                record,
                request,
                resource: challenge.resource,
                created: Instant::now(),
            },
        );
        info!(
            request_id,
            network = %requirements.network,
            amount = %requirements.amount,
            "Payment required"
        );
        Ok(RequirementsOutcome::Protected {
            request_id,
            requirements,
        })
    }

    /// Checks the flow's amount against `payer`'s budget.
    ///
    /// A passing check moves the flow to `VALIDATED`. A failing one leaves it
    /// unvalidated; [`Self::execute_payment`] will then refuse to run.
    ///
    /// # Errors
    ///
    /// Returns [`FailureCode::NotFound`] for unknown flows and
    /// [`FailureCode::InvalidState`] for flows already executing or finished.
    pub fn validate_payment(
        &self,
        request_id: &str,
        payer: &str,
    ) -> Result<BudgetCheck, FlowFailure> {
        let mut guard = self
            .flows
            .get_mut(request_id)
            .ok_or_else(|| FlowFailure::not_found(request_id))?;
        let entry = &mut *guard;
        let record = &mut entry.record;
        if !matches!(
            record.status,
            FlowStatus::RequirementsReceived | FlowStatus::Validated
        ) {
            return Err(FlowFailure::new(
                FailureCode::InvalidState,
                format!("cannot validate a flow in state {:?}", record.status),
            ));
        }

        let amount = self.amount_of(&record.requirements)?;
        let check = self.budget.validate(payer, amount);
        record.payer = Some(payer.to_owned());
        record.validated = check.valid;
        if check.valid {
            record.status = FlowStatus::Validated;
            record.error = None;
            record.code = None;
        } else {
            record.status = FlowStatus::RequirementsReceived;
            record.error.clone_from(&check.reason);
            record.code = check.code.map(FailureCode::from);
            info!(request_id, payer, reason = ?check.reason, "Payment rejected by budget");
        }
        Ok(check)
    }

    /// Pays for a validated flow.
    ///
    /// Never returns an error: every failure is reported in the result and
    /// marks the flow `FAILED`. Cancellation is honoured until settlement
    /// starts. A `TIMEOUT` during settlement is inconclusive: the facilitator
    /// may still have settled the payment.
    #[instrument(name = "x402.flow.execute_payment", skip_all, fields(request_id = %request_id))]
    pub async fn execute_payment(
        &self,
        request_id: &str,
        signer: &dyn PaymentSigner,
        options: ExecuteOptions,
    ) -> PaymentResult {
        match self.run_payment(request_id, signer, &options).await {
            Ok(result) => result,
            Err(failure) => {
                warn!(request_id, code = %failure.code, error = %failure.message, "Payment failed");
                PaymentResult::failure(Some(request_id.to_owned()), true, failure)
            }
        }
    }

    /// Claims the flow, then settles it. Any failure after the claim marks
    /// the flow `FAILED`, including the future being dropped mid-payment.
    async fn run_payment(
        &self,
        request_id: &str,
        signer: &dyn PaymentSigner,
        options: &ExecuteOptions,
    ) -> Result<PaymentResult, FlowFailure> {
        let (requirements, request, resource) =
            self.begin_execution(request_id, signer.address())?;
        let guard = ExecutionGuard {
            flows: &self.flows,
            request_id,
        };
        let result = self
            .settle_flow(request_id, signer, options, requirements, request, resource)
            .await;
        if let Err(failure) = &result {
            self.mark_failed(request_id, failure);
        }
        drop(guard);
        result
    }

    async fn settle_flow(
        &self,
        request_id: &str,
        signer: &dyn PaymentSigner,
        options: &ExecuteOptions,
        requirements: PaymentRequirements,
        request: ResourceRequest,
        resource: Option<ResourceInfo>,
    ) -> Result<PaymentResult, FlowFailure> {
        let payer = signer.address();
        let cancel = options.cancel.as_ref();
        let amount = self.amount_of(&requirements)?;
        let atomic = requirements.amount_atomic().ok_or_else(|| {
            FlowFailure::new(FailureCode::InvalidChallenge, "invalid amount")
        })?;

        let transfer = Transfer {
            recipient: requirements.pay_to.clone(),
            asset: requirements.asset.clone(),
            amount: atomic,
            network: requirements.network.clone(),
        };
        let signed = until_cancelled(cancel, self.ledger.build_and_sign(signer, &transfer))
            .await
            .ok_or_else(FlowFailure::cancelled)?
            .map_err(signing_failure)?;
        let payload = PaymentPayload::new(requirements.clone(), signed.blob.clone(), resource);

        let deadline =
            Instant::now() + Duration::from_secs(requirements.max_timeout_seconds.max(1));

        let verified = self
            .round_trip("verify", deadline, cancel, || {
                self.manager.verify(&payload, &requirements)
            })
            .await?;
        match verified.result {
            VerifyResponse::Valid { .. } => {
                debug!(facilitator = %verified.facilitator, "Payment verified");
            }
            VerifyResponse::Invalid { reason, .. } => {
                return Err(FlowFailure::new(FailureCode::VerificationFailed, reason));
            }
        }

        if cancel.is_some_and(CancellationToken::is_cancelled) {
            return Err(FlowFailure::cancelled());
        }

        let settled = self
            .round_trip("settle", deadline, None, || {
                self.manager.settle(&payload, &requirements)
            })
            .await?;
        let transaction = match settled.result {
            SettleResponse::Success { transaction, .. } => transaction,
            SettleResponse::Error { reason, .. } => {
                return Err(FlowFailure::new(FailureCode::SettlementFailed, reason));
            }
        };
        let facilitator = settled.facilitator;

        self.budget.record_spend(payer, amount);
        let receipt = self.receipts.generate_receipt(ReceiptData {
            transaction: transaction.clone(),
            payer: payer.to_owned(),
            payee: requirements.pay_to.clone(),
            amount: requirements.amount.clone(),
            asset: requirements.asset.clone(),
            network: requirements.network.clone(),
            resource_url: request.url.clone(),
            method: request.method.clone(),
            verified_by: facilitator.clone(),
            timestamp: None,
        });
        info!(
            request_id,
            %transaction,
            %facilitator,
            receipt_id = %receipt.receipt_id,
            "Payment settled"
        );
        self.complete(request_id, &transaction, &receipt.receipt_id);

        let mut result = PaymentResult {
            success: true,
            protected: true,
            request_id: Some(request_id.to_owned()),
            receipt_id: Some(receipt.receipt_id.clone()),
            transaction: Some(transaction.clone()),
            facilitator: Some(facilitator),
            ..PaymentResult::default()
        };

        if options.track || options.wait_for_confirmation.is_some() {
            self.monitor.track(
                transaction.as_str(),
                json!({ "requestId": request_id, "receiptId": receipt.receipt_id }),
            );
            self.monitor.start();
            if let Some(timeout) = options.wait_for_confirmation {
                result.outcome = Some(self.monitor.wait_for(&transaction, timeout).await);
            }
        }

        if options.fetch_resource {
            match self.fetch_paid(&request, &payload, &transaction).await {
                Ok(response) => result.response = Some(response),
                Err(failure) => {
                    warn!(request_id, error = %failure.message, "Paid resource request failed");
                    result.error = Some(failure.message);
                    result.code = Some(failure.code);
                }
            }
        }

        Ok(result)
    }

    /// Requests, validates and pays in one call.
    #[instrument(name = "x402.flow.pay", skip_all, fields(url = %url))]
    pub async fn pay(
        &self,
        url: &str,
        signer: &dyn PaymentSigner,
        options: PayOptions,
    ) -> PaymentResult {
        let request_id = match self.get_requirements(url, options.request).await {
            Ok(RequirementsOutcome::Unprotected { response }) => {
                return PaymentResult::unprotected(response);
            }
            Ok(RequirementsOutcome::Protected { request_id, .. }) => request_id,
            Err(failure) => {
                let protected = failure.code == FailureCode::InvalidChallenge;
                return PaymentResult::failure(None, protected, failure);
            }
        };

        let check = match self.validate_payment(&request_id, signer.address()) {
            Ok(check) => check,
            Err(failure) => return PaymentResult::failure(Some(request_id), true, failure),
        };
        if !check.valid {
            let failure = FlowFailure::new(
                check
                    .code
                    .map_or(FailureCode::DailyBudgetExceeded, FailureCode::from),
                check.reason.unwrap_or_else(|| "budget exceeded".to_owned()),
            );
            self.mark_failed(&request_id, &failure);
            return PaymentResult::failure(Some(request_id), true, failure);
        }

        self.execute_payment(&request_id, signer, options.execute).await
    }

    /// Snapshot of a stored flow.
    #[must_use]
    pub fn flow_status(&self, request_id: &str) -> Option<PaymentFlowRecord> {
        self.flows.get(request_id).map(|entry| entry.record.clone())
    }

    /// Drops flows older than the configured TTL, except those executing.
    /// Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let before = self.flows.len();
        self.flows.retain(|_, entry| {
            entry.record.status == FlowStatus::Executing || entry.created.elapsed() < self.flow_ttl
        });
        let purged = before.saturating_sub(self.flows.len());
        if purged > 0 {
            debug!(purged, "Expired payment flows purged");
        }
        purged
    }

    /// Number of stored flows.
    #[must_use]
    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }

    /// The facilitator manager.
    #[must_use]
    pub const fn manager(&self) -> &FacilitatorManager {
        &self.manager
    }

    /// The transaction monitor.
    #[must_use]
    pub const fn monitor(&self) -> &TransactionMonitor {
        &self.monitor
    }

    /// The budget guard.
    #[must_use]
    pub const fn budget(&self) -> &BudgetGuard {
        &self.budget
    }

    /// The receipt store.
    #[must_use]
    pub const fn receipts(&self) -> &ReceiptGenerator {
        &self.receipts
    }

    /// The event bus shared by every component.
    #[must_use]
    pub const fn events(&self) -> &EventBus {
        &self.events
    }

    /// Stops background monitoring.
    pub fn shutdown(&self) {
        self.monitor.stop();
    }

    fn amount_of(&self, requirements: &PaymentRequirements) -> Result<Decimal, FlowFailure> {
        requirements
            .amount_atomic()
            .and_then(|atomic| atomic_to_decimal(atomic, self.budget.decimals_for(requirements)))
            .ok_or_else(|| {
                FlowFailure::new(
                    FailureCode::InvalidChallenge,
                    format!("invalid amount {:?}", requirements.amount),
                )
            })
    }

    /// Moves a validated flow to `EXECUTING`. The check and the transition
    /// happen under the entry lock, so a flow executes at most once.
    fn begin_execution(
        &self,
        request_id: &str,
        payer: &str,
    ) -> Result<(PaymentRequirements, ResourceRequest, Option<ResourceInfo>), FlowFailure> {
        let mut guard = self
            .flows
            .get_mut(request_id)
            .ok_or_else(|| FlowFailure::not_found(request_id))?;
        let entry = &mut *guard;
        let record = &mut entry.record;
        if record.status != FlowStatus::Validated || !record.validated {
            return Err(FlowFailure::new(
                FailureCode::InvalidState,
                format!("cannot execute a flow in state {:?}", record.status),
            ));
        }
        if record.payer.as_deref() != Some(payer) {
            return Err(FlowFailure::new(
                FailureCode::InvalidState,
                "flow was validated for a different payer",
            ));
        }
        record.status = FlowStatus::Executing;
        Ok((
            record.requirements.clone(),
            entry.request.clone(),
            entry.resource.clone(),
        ))
    }

    fn complete(&self, request_id: &str, transaction: &str, receipt_id: &str) {
        if let Some(mut entry) = self.flows.get_mut(request_id) {
            entry.record.status = FlowStatus::Completed;
            entry.record.transaction = Some(transaction.to_owned());
            entry.record.receipt_id = Some(receipt_id.to_owned());
        }
    }

    fn mark_failed(&self, request_id: &str, failure: &FlowFailure) {
        if let Some(mut entry) = self.flows.get_mut(request_id) {
            entry.record.status = FlowStatus::Failed;
            entry.record.error = Some(failure.message.clone());
            entry.record.code = Some(failure.code);
        }
    }

    /// Runs one facilitator operation with retries, bounded by `deadline`.
    async fn round_trip<T, F, Fut>(
        &self,
        operation: &'static str,
        deadline: Instant,
        cancel: Option<&CancellationToken>,
        call: F,
    ) -> Result<Executed<T>, FlowFailure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Executed<T>, FacilitatorManagerError>>,
    {
        let retried = self.retry.execute(call, |retry| {
            warn!(
                operation,
                attempt = retry.attempt,
                max_retries = retry.max_retries,
                delay = ?retry.delay,
                error = %retry.error,
                "Retrying facilitator call"
            );
            self.events.emit(FlowEvent::Retry {
                operation: operation.to_owned(),
                attempt: retry.attempt,
                max_retries: retry.max_retries,
                delay_ms: u64::try_from(retry.delay.as_millis()).unwrap_or(u64::MAX),
                error: retry.error.to_string(),
            });
        });
        let bounded = tokio::time::timeout_at(deadline, retried);

        let outcome = match until_cancelled(cancel, bounded).await {
            Some(outcome) => outcome,
            None => return Err(FlowFailure::cancelled()),
        };
        match outcome {
            Ok(Ok(executed)) => Ok(executed),
            Ok(Err(err)) => Err(FlowFailure::new(
                FailureCode::FacilitatorUnavailable,
                err.to_string(),
            )),
            Err(_) => Err(FlowFailure::new(
                FailureCode::Timeout,
                format!("{operation} did not finish within maxTimeoutSeconds"),
            )),
        }
    }

    async fn fetch_paid(
        &self,
        original: &ResourceRequest,
        payload: &PaymentPayload,
        transaction: &str,
    ) -> Result<ResourceResponse, FlowFailure> {
        let signature = encode_payment_signature(payload)
            .map_err(|e| FlowFailure::new(FailureCode::NetworkError, e.to_string()))?;
        let request = original
            .clone()
            .with_header(PAYMENT_SIGNATURE_HEADER, signature)
            .with_header(PAYMENT_TRANSACTION_HEADER, transaction);
        self.transport
            .fetch(&request)
            .await
            .map_err(|e| FlowFailure::new(FailureCode::NetworkError, e.to_string()))
    }
}

/// Fails a claimed flow that is still `EXECUTING` when dropped, which only
/// happens when the payment future is abandoned before it finishes.
struct ExecutionGuard<'a> {
    flows: &'a DashMap<String, FlowEntry>,
    request_id: &'a str,
}

impl Drop for ExecutionGuard<'_> {
    fn drop(&mut self) {
        let executing = self
            .flows
            .get_mut(self.request_id)
            .filter(|entry| entry.record.status == FlowStatus::Executing);
        if let Some(mut entry) = executing {
            warn!(request_id = self.request_id, "Payment abandoned before completion");
            entry.record.status = FlowStatus::Failed;
            entry.record.error = Some("payment abandoned before completion".to_owned());
            entry.record.code = Some(FailureCode::Cancelled);
        }
    }
}

/// Runs `future` unless `cancel` fires first. `None` means cancelled.
async fn until_cancelled<F: Future>(
    cancel: Option<&CancellationToken>,
    future: F,
) -> Option<F::Output> {
    match cancel {
        Some(token) => tokio::select! {
            biased;
            () = token.cancelled() => None,
            output = future => Some(output),
        },
        None => Some(future.await),
    }
}

fn signing_failure(err: LedgerError) -> FlowFailure {
    let code = match err {
        LedgerError::Unavailable(_) => FailureCode::NetworkError,
        _ => FailureCode::SigningFailed,
    };
    FlowFailure::new(code, err.to_string())
}

/// Reads the challenge from the `PAYMENT-REQUIRED` header, falling back to
/// the JSON body.
fn parse_challenge(response: &ResourceResponse) -> Result<PaymentRequired, FlowFailure> {
    let from_header = response
        .header(PAYMENT_REQUIRED_HEADER)
        .map(decode_payment_required);
    match from_header {
        Some(Ok(challenge)) => return Ok(challenge),
        Some(Err(err)) => debug!(error = %err, "Unreadable challenge header, trying body"),
        None => {}
    }
    serde_json::from_slice::<PaymentRequired>(&response.body).map_err(|e| {
        FlowFailure::new(
            FailureCode::InvalidChallenge,
            format!("no readable payment challenge: {e}"),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use r402_http::headers::encode_payment_required;

    fn challenge_json() -> serde_json::Value {
        json!({
            "x402Version": 2,
            "accepts": [{
                "scheme": "exact",
                "network": "aptos:2",
                "amount": "10000",
                "asset": "0x1::aptos_coin::AptosCoin",
                "payTo": "0xmerchant",
                "maxTimeoutSeconds": 60
            }]
        })
    }

    fn response(headers: Vec<(String, String)>, body: &[u8]) -> ResourceResponse {
        ResourceResponse {
            status: 402,
            headers,
            body: body.to_vec(),
        }
    }

    #[test]
    fn test_challenge_from_header() {
        let challenge: PaymentRequired = serde_json::from_value(challenge_json()).unwrap();
        let header = encode_payment_required(&challenge).unwrap();
        let parsed =
            parse_challenge(&response(vec![("payment-required".into(), header)], b"")).unwrap();
        assert_eq!(parsed, challenge);
    }

    #[test]
    fn test_challenge_falls_back_to_body() {
        let body = serde_json::to_vec(&challenge_json()).unwrap();
        let parsed = parse_challenge(&response(
            vec![(PAYMENT_REQUIRED_HEADER.into(), "%%%".into())],
            &body,
        ))
        .unwrap();
        assert_eq!(parsed.accepts[0].amount, "10000");
    }

    #[test]
    fn test_missing_challenge_is_invalid() {
        let err = parse_challenge(&response(Vec::new(), b"<html>pay up</html>")).unwrap_err();
        assert_eq!(err.code, FailureCode::InvalidChallenge);
    }

    #[test]
    fn test_request_options_default_to_get() {
        let request = RequestOptions::default().into_request("https://api.example/x");
        assert_eq!(request.method, "GET");
        let request = RequestOptions::default()
            .with_method("post")
            .with_body("{}")
            .into_request("https://api.example/x");
        assert_eq!(request.method, "POST");
        assert_eq!(request.body.as_deref(), Some(&b"{}"[..]));
    }

    #[test]
    fn test_failure_codes_render_as_wire_strings() {
        assert_eq!(
            FailureCode::from(BudgetViolation::DailyBudgetExceeded).to_string(),
            "DAILY_BUDGET_EXCEEDED"
        );
        assert_eq!(
            serde_json::to_value(FailureCode::FacilitatorUnavailable).unwrap(),
            json!("FACILITATOR_UNAVAILABLE")
        );
        assert_eq!(
            serde_json::to_value(FlowStatus::RequirementsReceived).unwrap(),
            json!("REQUIREMENTS_RECEIVED")
        );
    }
}

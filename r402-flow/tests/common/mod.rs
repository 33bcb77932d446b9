//! In-memory collaborators shared by the integration tests.

#![allow(dead_code, missing_docs)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use r402::{
    BoxFuture, Facilitator, LedgerClient, LedgerError, LedgerStatus, PaymentPayload,
    PaymentRequired, PaymentRequirements, PaymentSigner, ResourceRequest, ResourceResponse,
    ResourceTransport, SettleResponse, SignedTransaction, Transfer, TransportError,
    VerifyResponse,
};
use r402_flow::{
    BudgetConfig, FacilitatorManager, FacilitatorManagerConfig, FlowConfig, PaymentFlow,
    RetryConfig,
};
use r402_http::constants::{PAYMENT_REQUIRED_HEADER, PAYMENT_SIGNATURE_HEADER};
use r402_http::headers::encode_payment_required;
use rust_decimal::Decimal;
use serde_json::json;

pub const PAYER: &str = "0xpayer";
pub const RESOURCE_URL: &str = "https://api.example/weather";
pub const PAID_BODY: &[u8] = br#"{"weather":"sunny"}"#;

pub fn challenge(amount: &str) -> PaymentRequired {
    serde_json::from_value(json!({
        "x402Version": 2,
        "resource": { "url": RESOURCE_URL },
        "accepts": [{
            "scheme": "exact",
            "network": "aptos:2",
            "amount": amount,
            "asset": "0x1::aptos_coin::AptosCoin",
            "payTo": "0xmerchant",
            "maxTimeoutSeconds": 60,
            "extra": { "decimals": 6 }
        }]
    }))
    .unwrap()
}

/// Budget of 100000 tokens, 10 per payment, fast non-jittered retries.
pub fn config() -> FlowConfig {
    FlowConfig::default()
        .with_budget(BudgetConfig {
            daily_budget: Decimal::from(100_000),
            max_payment_amount: Decimal::from(10),
            asset_decimals: 6,
        })
        .with_retry(RetryConfig {
            max_retries: 2,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            jitter: false,
        })
}

pub struct MockSigner {
    pub address: String,
}

impl MockSigner {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_owned(),
        }
    }
}

impl PaymentSigner for MockSigner {
    fn address(&self) -> &str {
        &self.address
    }

    fn sign<'a>(&'a self, message: &'a [u8]) -> BoxFuture<'a, Result<Vec<u8>, LedgerError>> {
        Box::pin(async move { Ok(message.iter().rev().copied().collect()) })
    }
}

#[derive(Default)]
pub struct MockLedger {
    pub built: AtomicU32,
    pub refuse_signing: bool,
    pub statuses: DashMap<String, LedgerStatus>,
}

impl MockLedger {
    pub fn built(&self) -> u32 {
        self.built.load(Ordering::SeqCst)
    }

    pub fn confirm(&self, hash: &str, version: u64) {
        self.statuses.insert(
            hash.to_owned(),
            LedgerStatus {
                found: true,
                success: true,
                vm_status: Some("Executed successfully".into()),
                version: Some(version),
            },
        );
    }
}

impl LedgerClient for MockLedger {
    fn build_and_sign<'a>(
        &'a self,
        signer: &'a dyn PaymentSigner,
        transfer: &'a Transfer,
    ) -> BoxFuture<'a, Result<SignedTransaction, LedgerError>> {
        Box::pin(async move {
            self.built.fetch_add(1, Ordering::SeqCst);
            if self.refuse_signing {
                return Err(LedgerError::Signing("hardware wallet locked".into()));
            }
            let message = format!("{}:{}:{}", transfer.recipient, transfer.asset, transfer.amount);
            let signature = signer.sign(message.as_bytes()).await?;
            Ok(SignedTransaction {
                blob: format!("{message}:{}", signature.len()),
                hash: None,
            })
        })
    }

    fn submit<'a>(
        &'a self,
        _transaction: &'a SignedTransaction,
    ) -> BoxFuture<'a, Result<String, LedgerError>> {
        Box::pin(async { Err(LedgerError::Rejected("submitted through facilitator".into())) })
    }

    fn query_status<'a>(
        &'a self,
        hash: &'a str,
    ) -> BoxFuture<'a, Result<LedgerStatus, LedgerError>> {
        Box::pin(async move {
            Ok(self
                .statuses
                .get(hash)
                .map_or_else(LedgerStatus::not_found, |s| s.value().clone()))
        })
    }
}

/// How a [`MockFacilitator`] answers.
#[derive(Debug, Clone)]
pub enum Reply {
    Accept,
    Reject(&'static str),
    Fail(TransportError),
    Hang(Duration),
}

pub struct MockFacilitator {
    pub url: String,
    pub verify: Reply,
    pub settle: Reply,
    pub verify_calls: AtomicU32,
    pub settle_calls: AtomicU32,
}

impl MockFacilitator {
    pub fn new(url: &str, verify: Reply, settle: Reply) -> Arc<Self> {
        Arc::new(Self {
            url: url.to_owned(),
            verify,
            settle,
            verify_calls: AtomicU32::new(0),
            settle_calls: AtomicU32::new(0),
        })
    }

    pub fn healthy(url: &str) -> Arc<Self> {
        Self::new(url, Reply::Accept, Reply::Accept)
    }

    pub fn down(url: &str) -> Arc<Self> {
        let error = TransportError::status("POST /verify", 503, "maintenance");
        Self::new(url, Reply::Fail(error.clone()), Reply::Fail(error))
    }

    pub fn verify_calls(&self) -> u32 {
        self.verify_calls.load(Ordering::SeqCst)
    }

    pub fn settle_calls(&self) -> u32 {
        self.settle_calls.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> u32 {
        self.verify_calls() + self.settle_calls()
    }
}

impl Facilitator for MockFacilitator {
    fn url(&self) -> &str {
        &self.url
    }

    fn verify<'a>(
        &'a self,
        _payload: &'a PaymentPayload,
        _requirements: &'a PaymentRequirements,
    ) -> BoxFuture<'a, Result<VerifyResponse, TransportError>> {
        Box::pin(async move {
            self.verify_calls.fetch_add(1, Ordering::SeqCst);
            match &self.verify {
                Reply::Accept => Ok(VerifyResponse::valid(Some(PAYER.into()))),
                Reply::Reject(reason) => Ok(VerifyResponse::invalid(None, (*reason).to_owned())),
                Reply::Fail(error) => Err(error.clone()),
                Reply::Hang(duration) => {
                    tokio::time::sleep(*duration).await;
                    Ok(VerifyResponse::valid(None))
                }
            }
        })
    }

    fn settle<'a>(
        &'a self,
        _payload: &'a PaymentPayload,
        requirements: &'a PaymentRequirements,
    ) -> BoxFuture<'a, Result<SettleResponse, TransportError>> {
        Box::pin(async move {
            let n = self.settle_calls.fetch_add(1, Ordering::SeqCst);
            let success = SettleResponse::Success {
                transaction: format!("0xtx{n}"),
                payer: Some(PAYER.into()),
                network: Some(requirements.network.clone()),
            };
            match &self.settle {
                Reply::Accept => Ok(success),
                Reply::Reject(reason) => Ok(SettleResponse::Error {
                    reason: (*reason).to_owned(),
                    transaction: None,
                }),
                Reply::Fail(error) => Err(error.clone()),
                Reply::Hang(duration) => {
                    tokio::time::sleep(*duration).await;
                    Ok(success)
                }
            }
        })
    }
}

/// Answers 402 until the request carries a payment signature.
pub struct MockTransport {
    pub challenge: Option<PaymentRequired>,
    pub requests: Mutex<Vec<ResourceRequest>>,
}

impl MockTransport {
    pub fn protected(challenge: PaymentRequired) -> Arc<Self> {
        Arc::new(Self {
            challenge: Some(challenge),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn open() -> Arc<Self> {
        Arc::new(Self {
            challenge: None,
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<ResourceRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl ResourceTransport for MockTransport {
    fn fetch<'a>(
        &'a self,
        request: &'a ResourceRequest,
    ) -> BoxFuture<'a, Result<ResourceResponse, TransportError>> {
        Box::pin(async move {
            self.requests.lock().unwrap().push(request.clone());
            let paid = request
                .headers
                .iter()
                .any(|(k, _)| k.eq_ignore_ascii_case(PAYMENT_SIGNATURE_HEADER));
            match &self.challenge {
                Some(challenge) if !paid => Ok(ResourceResponse {
                    status: 402,
                    headers: vec![(
                        PAYMENT_REQUIRED_HEADER.to_owned(),
                        encode_payment_required(challenge).unwrap(),
                    )],
                    body: Vec::new(),
                }),
                _ => Ok(ResourceResponse {
                    status: 200,
                    headers: vec![("content-type".into(), "application/json".into())],
                    body: PAID_BODY.to_vec(),
                }),
            }
        })
    }
}

pub struct Harness {
    pub flow: PaymentFlow,
    pub ledger: Arc<MockLedger>,
    pub transport: Arc<MockTransport>,
    pub facilitators: Vec<Arc<MockFacilitator>>,
    pub signer: MockSigner,
}

pub fn harness(
    config: FlowConfig,
    transport: Arc<MockTransport>,
    facilitators: Vec<Arc<MockFacilitator>>,
    ledger: MockLedger,
) -> Harness {
    let ledger = Arc::new(ledger);
    let manager = FacilitatorManager::new(
        facilitators
            .iter()
            .map(|f| Arc::clone(f) as Arc<dyn Facilitator>)
            .collect(),
        config.manager,
    )
    .unwrap();
    let flow = PaymentFlow::new(
        config,
        manager,
        Arc::clone(&transport) as Arc<dyn ResourceTransport>,
        Arc::clone(&ledger) as Arc<dyn LedgerClient>,
    );
    Harness {
        flow,
        ledger,
        transport,
        facilitators,
        signer: MockSigner::new(PAYER),
    }
}

pub fn manager_config(max_errors: u32) -> FacilitatorManagerConfig {
    FacilitatorManagerConfig {
        max_errors,
        ..FacilitatorManagerConfig::default()
    }
}

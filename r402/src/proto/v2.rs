//! V2 payment messages: requirements, the 402 challenge, and payloads.
//!
//! These types use CAIP-2 style network identifiers and atomic-unit amounts
//! encoded as base-10 strings.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The x402 protocol version produced by this crate.
pub const X402_VERSION: u32 = 2;

/// Describes the resource being paid for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceInfo {
    /// The URL of the resource.
    pub url: String,

    /// Optional human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Optional MIME type of the resource.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// What a resource server charges for one request.
///
/// Parsed from a 402 challenge and never mutated afterwards.
///
/// # JSON Format
///
/// ```json
/// {
///   "scheme": "exact",
///   "network": "aptos:2",
///   "amount": "10000",
///   "asset": "0x1::aptos_coin::AptosCoin",
///   "payTo": "0xabc...",
///   "maxTimeoutSeconds": 60,
///   "extra": { "decimals": 6 }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequirements {
    /// Payment scheme identifier (e.g. `"exact"`).
    pub scheme: String,

    /// Network identifier (e.g. `"aptos:2"`).
    pub network: String,

    /// Amount in atomic units, as a base-10 string.
    pub amount: String,

    /// Opaque asset identifier.
    pub asset: String,

    /// Recipient identifier.
    pub pay_to: String,

    /// Upper bound, in seconds, for the facilitator round-trips of one payment.
    pub max_timeout_seconds: u64,

    /// Additional scheme-specific data.
    #[serde(default = "default_empty_object")]
    pub extra: Value,
}

impl PaymentRequirements {
    /// Parses [`Self::amount`] as an unsigned integer of atomic units.
    ///
    /// Returns `None` for anything that is not a plain base-10 integer.
    #[must_use]
    pub fn amount_atomic(&self) -> Option<u128> {
        self.amount.parse::<u128>().ok()
    }

    /// Returns the asset decimals advertised in `extra.decimals`, if any.
    #[must_use]
    pub fn decimals(&self) -> Option<u32> {
        self.extra
            .get("decimals")
            .and_then(Value::as_u64)
            .and_then(|d| u32::try_from(d).ok())
    }
}

/// The 402 challenge body.
///
/// # JSON Format
///
/// ```json
/// {
///   "x402Version": 2,
///   "error": "payment required",
///   "resource": { "url": "https://api.example/data" },
///   "accepts": [{ "scheme": "exact", ... }]
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequired {
    /// Protocol version.
    #[serde(default = "default_v2")]
    pub x402_version: u32,

    /// Optional error message from the resource server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Optional resource description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<ResourceInfo>,

    /// Accepted payment options, in the server's order of preference.
    pub accepts: Vec<PaymentRequirements>,
}

impl PaymentRequired {
    /// Picks the requirement to pay.
    ///
    /// When `preferred_network` is given the first option on that network
    /// wins; otherwise, or when no option matches, the first option is used.
    #[must_use]
    pub fn select(&self, preferred_network: Option<&str>) -> Option<&PaymentRequirements> {
        preferred_network
            .and_then(|network| self.accepts.iter().find(|r| r.network == network))
            .or_else(|| self.accepts.first())
    }
}

/// Scheme payload carrying the signed ledger transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionPayload {
    /// Opaque, facilitator-verifiable signed transaction blob.
    pub transaction: String,
}

/// Proof of intent to pay, sent to facilitators for verify and settle.
///
/// Produced once per payment attempt; never mutated after signing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentPayload {
    /// Protocol version.
    #[serde(default = "default_v2")]
    pub x402_version: u32,

    /// The requirements this payment fulfils.
    pub accepted: PaymentRequirements,

    /// The signed transaction.
    pub payload: TransactionPayload,

    /// Optional resource information echoed from the challenge.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<ResourceInfo>,
}

impl PaymentPayload {
    /// Wraps a signed transaction blob for the given requirements.
    #[must_use]
    pub fn new(
        accepted: PaymentRequirements,
        transaction: impl Into<String>,
        resource: Option<ResourceInfo>,
    ) -> Self {
        Self {
            x402_version: X402_VERSION,
            accepted,
            payload: TransactionPayload {
                transaction: transaction.into(),
            },
            resource,
        }
    }

    /// Returns the signed transaction blob.
    #[must_use]
    pub fn signed_transaction(&self) -> &str {
        &self.payload.transaction
    }
}

/// Body of `POST /verify` and `POST /settle`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FacilitatorRequest {
    /// Protocol version.
    pub x402_version: u32,

    /// The payment to verify or settle.
    pub payment_payload: PaymentPayload,

    /// The requirements to check it against.
    pub payment_requirements: PaymentRequirements,
}

impl FacilitatorRequest {
    /// Builds a request body from a payload and its requirements.
    #[must_use]
    pub fn new(payload: &PaymentPayload, requirements: &PaymentRequirements) -> Self {
        Self {
            x402_version: payload.x402_version,
            payment_payload: payload.clone(),
            payment_requirements: requirements.clone(),
        }
    }
}

const fn default_v2() -> u32 {
    X402_VERSION
}

fn default_empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

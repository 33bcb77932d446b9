//! Tamper-evident payment receipts.
//!
//! A receipt is identified by a content hash over the transaction hash, the
//! payer and the timestamp. Its integrity signature is an HMAC-SHA256 over
//! every field (plain SHA-256 when no secret is configured), so editing any
//! field of an exported receipt makes [`ReceiptGenerator::validate_receipt`]
//! fail.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use hmac::{Hmac, Mac};
use r402::UnixTimestamp;
use serde::{Deserialize, Serialize};
use serde_json::json;
use serde_with::{DurationSeconds, serde_as};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tokio::time::Instant;
use tracing::{debug, warn};

type HmacSha256 = Hmac<Sha256>;

/// Length of a receipt id, in hex characters.
pub const RECEIPT_ID_LEN: usize = 16;

/// Receipt store settings.
#[serde_as]
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiptConfig {
    /// Maximum receipts kept in memory; the oldest is evicted first.
    pub capacity: usize,
    /// How long a receipt stays retrievable.
    #[serde(rename = "ttl_secs")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub ttl: Duration,
    /// HMAC key for integrity signatures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

impl Default for ReceiptConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            ttl: Duration::from_secs(86_400),
            secret: None,
        }
    }
}

impl fmt::Debug for ReceiptConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceiptConfig")
            .field("capacity", &self.capacity)
            .field("ttl", &self.ttl)
            .field("has_secret", &self.secret.is_some())
            .finish()
    }
}

/// Everything needed to issue a receipt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiptData {
    /// Settled transaction hash.
    pub transaction: String,
    /// Payer address.
    pub payer: String,
    /// Recipient (`payTo`).
    pub payee: String,
    /// Amount in atomic units.
    pub amount: String,
    /// Asset identifier.
    pub asset: String,
    /// Network identifier.
    pub network: String,
    /// URL of the paid resource.
    pub resource_url: String,
    /// HTTP method used for the resource.
    pub method: String,
    /// Facilitator that settled the payment.
    pub verified_by: String,
    /// Issue time; defaults to now.
    pub timestamp: Option<UnixTimestamp>,
}

/// Payment section of a [`Receipt`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptPayment {
    /// Transaction hash.
    pub transaction: String,
    /// Payer address.
    pub payer: String,
    /// Recipient.
    pub payee: String,
    /// Amount in atomic units.
    pub amount: String,
    /// Asset identifier.
    pub asset: String,
    /// Network identifier.
    pub network: String,
}

/// Resource section of a [`Receipt`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptResource {
    /// Resource URL.
    pub url: String,
    /// HTTP method.
    pub method: String,
}

/// Verification section of a [`Receipt`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptVerification {
    /// Facilitator URL.
    pub verified_by: String,
    /// Hex HMAC-SHA256 (or SHA-256) over all other fields.
    pub integrity_signature: String,
}

/// An immutable record of a settled payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    /// Content hash identifying the receipt.
    pub receipt_id: String,
    /// Issue time.
    pub timestamp: UnixTimestamp,
    /// What was paid.
    pub payment: ReceiptPayment,
    /// What was paid for.
    pub resource: ReceiptResource,
    /// Who settled it, and the integrity signature.
    pub verification: ReceiptVerification,
}

/// Errors raised when importing receipts.
#[derive(Debug, thiserror::Error)]
pub enum ReceiptError {
    /// The JSON did not describe a receipt.
    #[error("malformed receipt: {0}")]
    Malformed(#[from] serde_json::Error),
    /// The receipt's fields do not match its id or signature.
    #[error("receipt {receipt_id} failed integrity validation")]
    Integrity {
        /// Claimed receipt id.
        receipt_id: String,
    },
}

#[derive(Debug, Default)]
struct ReceiptStore {
    receipts: HashMap<String, (Receipt, Instant)>,
    order: VecDeque<String>,
}

impl ReceiptStore {
    fn insert(&mut self, receipt: Receipt, capacity: usize) {
        let id = receipt.receipt_id.clone();
        if self.receipts.insert(id.clone(), (receipt, Instant::now())).is_none() {
            self.order.push_back(id);
        }
        while self.receipts.len() > capacity.max(1) {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.receipts.remove(&oldest);
        }
    }

    fn purge_expired(&mut self, ttl: Duration) {
        while let Some(oldest) = self.order.front() {
            let expired = self
                .receipts
                .get(oldest)
                .is_none_or(|(_, stored_at)| stored_at.elapsed() >= ttl);
            if !expired {
                break;
            }
            if let Some(id) = self.order.pop_front() {
                self.receipts.remove(&id);
            }
        }
    }
}

/// Issues, stores and validates receipts.
pub struct ReceiptGenerator {
    config: ReceiptConfig,
    store: Mutex<ReceiptStore>,
}

impl fmt::Debug for ReceiptGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceiptGenerator")
            .field("config", &self.config)
            .field("stored", &self.len())
            .finish()
    }
}

impl Default for ReceiptGenerator {
    fn default() -> Self {
        Self::new(ReceiptConfig::default())
    }
}

impl ReceiptGenerator {
    /// Creates a generator with an empty store.
    #[must_use]
    pub fn new(config: ReceiptConfig) -> Self {
        if config.secret.is_none() {
            debug!("No receipt secret configured, integrity signatures use plain SHA-256");
        }
        Self {
            config,
            store: Mutex::new(ReceiptStore::default()),
        }
    }

    fn store(&self) -> MutexGuard<'_, ReceiptStore> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Issues and stores a receipt for a settled payment.
    pub fn generate_receipt(&self, data: ReceiptData) -> Receipt {
        let timestamp = data.timestamp.unwrap_or_else(UnixTimestamp::now);
        let receipt_id = receipt_id(&data.transaction, &data.payer, timestamp);
        let mut receipt = Receipt {
            receipt_id,
            timestamp,
            payment: ReceiptPayment {
                transaction: data.transaction,
                payer: data.payer,
                payee: data.payee,
                amount: data.amount,
                asset: data.asset,
                network: data.network,
            },
            resource: ReceiptResource {
                url: data.resource_url,
                method: data.method,
            },
            verification: ReceiptVerification {
                verified_by: data.verified_by,
                integrity_signature: String::new(),
            },
        };
        receipt.verification.integrity_signature = self.sign(&receipt);

        let mut store = self.store();
        store.purge_expired(self.config.ttl);
        store.insert(receipt.clone(), self.config.capacity);
        debug!(receipt_id = %receipt.receipt_id, "Receipt issued");
        receipt
    }

    /// Looks up a stored, unexpired receipt.
    #[must_use]
    pub fn get_receipt(&self, receipt_id: &str) -> Option<Receipt> {
        let mut store = self.store();
        store.purge_expired(self.config.ttl);
        store.receipts.get(receipt_id).map(|(r, _)| r.clone())
    }

    /// Serializes a stored receipt to JSON.
    #[must_use]
    pub fn export_receipt(&self, receipt_id: &str) -> Option<String> {
        self.get_receipt(receipt_id)
            .and_then(|receipt| serde_json::to_string(&receipt).ok())
    }

    /// Parses, validates and stores a receipt exported earlier.
    ///
    /// # Errors
    ///
    /// Returns [`ReceiptError::Malformed`] for invalid JSON and
    /// [`ReceiptError::Integrity`] if any field was altered.
    pub fn import_receipt(&self, json: &str) -> Result<Receipt, ReceiptError> {
        let receipt: Receipt = serde_json::from_str(json)?;
        if !self.validate_receipt(&receipt) {
            warn!(receipt_id = %receipt.receipt_id, "Rejected tampered receipt");
            return Err(ReceiptError::Integrity {
                receipt_id: receipt.receipt_id,
            });
        }
        let mut store = self.store();
        store.purge_expired(self.config.ttl);
        store.insert(receipt.clone(), self.config.capacity);
        Ok(receipt)
    }

    /// Recomputes the id and signature from the receipt's own fields.
    #[must_use]
    pub fn validate_receipt(&self, receipt: &Receipt) -> bool {
        let expected_id = receipt_id(
            &receipt.payment.transaction,
            &receipt.payment.payer,
            receipt.timestamp,
        );
        let expected_signature = self.sign(receipt);
        let id_ok = expected_id.as_bytes().ct_eq(receipt.receipt_id.as_bytes());
        let signature_ok = expected_signature
            .as_bytes()
            .ct_eq(receipt.verification.integrity_signature.as_bytes());
        (id_ok & signature_ok).into()
    }

    /// Number of receipts currently stored.
    #[must_use]
    pub fn len(&self) -> usize {
        self.store().receipts.len()
    }

    /// Returns `true` if no receipts are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn sign(&self, receipt: &Receipt) -> String {
        let message = canonical_message(receipt);
        match &self.config.secret {
            Some(secret) => {
                let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
                    .expect("HMAC accepts any key length");
                mac.update(message.as_bytes());
                hex::encode(mac.finalize().into_bytes())
            }
            None => hex::encode(Sha256::digest(message.as_bytes())),
        }
    }
}

fn receipt_id(transaction: &str, payer: &str, timestamp: UnixTimestamp) -> String {
    let digest = Sha256::digest(format!("{transaction}|{payer}|{}", timestamp.as_secs()));
    let mut id = hex::encode(digest);
    id.truncate(RECEIPT_ID_LEN);
    id
}

/// `[tx, payer, amount, timestamp]` followed by every remaining field, as a
/// JSON array so no field can absorb its neighbour.
fn canonical_message(receipt: &Receipt) -> String {
    let payment = &receipt.payment;
    json!([
        payment.transaction,
        payment.payer,
        payment.amount,
        receipt.timestamp.as_secs(),
        receipt.receipt_id,
        payment.payee,
        payment.asset,
        payment.network,
        receipt.resource.url,
        receipt.resource.method,
        receipt.verification.verified_by,
    ])
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data() -> ReceiptData {
        ReceiptData {
            transaction: "0xhash".into(),
            payer: "0xpayer".into(),
            payee: "0xmerchant".into(),
            amount: "10000".into(),
            asset: "0x1::aptos_coin::AptosCoin".into(),
            network: "aptos:2".into(),
            resource_url: "https://api.example/weather".into(),
            method: "GET".into(),
            verified_by: "https://facilitator.example".into(),
            timestamp: Some(UnixTimestamp::from_secs(1_700_000_000)),
        }
    }

    fn with_secret() -> ReceiptGenerator {
        ReceiptGenerator::new(ReceiptConfig {
            secret: Some("receipt-secret".into()),
            ..ReceiptConfig::default()
        })
    }

    #[test]
    fn test_receipt_id_is_deterministic_content_hash() {
        let a = with_secret().generate_receipt(data());
        let b = ReceiptGenerator::default().generate_receipt(data());
        assert_eq!(a.receipt_id.len(), RECEIPT_ID_LEN);
        assert_eq!(a.receipt_id, b.receipt_id);
        assert_ne!(
            a.verification.integrity_signature,
            b.verification.integrity_signature
        );
    }

    #[tokio::test]
    async fn test_generated_receipts_validate_and_are_retrievable() {
        for generator in [with_secret(), ReceiptGenerator::default()] {
            let receipt = generator.generate_receipt(data());
            assert!(generator.validate_receipt(&receipt));
            assert_eq!(generator.get_receipt(&receipt.receipt_id), Some(receipt));
        }
    }

    #[tokio::test]
    async fn test_mutating_any_field_breaks_validation() {
        let generator = with_secret();
        let receipt = generator.generate_receipt(data());

        let mutations: Vec<fn(&mut Receipt)> = vec![
            |r| r.receipt_id = "0000000000000000".into(),
            |r| r.timestamp = UnixTimestamp::from_secs(1),
            |r| r.payment.transaction.push('0'),
            |r| r.payment.payer.push('0'),
            |r| r.payment.payee.push('0'),
            |r| r.payment.amount = "99999999".into(),
            |r| r.payment.asset.push('0'),
            |r| r.payment.network = "aptos:1".into(),
            |r| r.resource.url.push('/'),
            |r| r.resource.method = "POST".into(),
            |r| r.verification.verified_by.push('/'),
            |r| r.verification.integrity_signature.replace_range(0..2, "zz"),
        ];
        for mutate in mutations {
            let mut tampered = receipt.clone();
            mutate(&mut tampered);
            assert!(!generator.validate_receipt(&tampered), "{tampered:?}");
        }
    }

    #[tokio::test]
    async fn test_shifting_separators_between_fields_breaks_validation() {
        let generator = with_secret();
        let mut data = data();
        data.resource_url = "https://api.example/x?q=a|b".into();
        let receipt = generator.generate_receipt(data);
        assert!(generator.validate_receipt(&receipt));

        let mut tampered = receipt.clone();
        tampered.resource.url = "https://api.example/x?q=a".into();
        tampered.resource.method = "b|GET".into();
        assert!(!generator.validate_receipt(&tampered));

        let mut tampered = receipt;
        tampered.payment.payee.push('|');
        tampered.payment.asset.insert(0, '|');
        assert!(!generator.validate_receipt(&tampered));
    }

    #[tokio::test]
    async fn test_export_import() {
        let issuer = with_secret();
        let receipt = issuer.generate_receipt(data());
        let json = issuer.export_receipt(&receipt.receipt_id).unwrap();
        assert!(json.contains("\"integritySignature\""));

        let verifier = with_secret();
        assert_eq!(verifier.import_receipt(&json).unwrap(), receipt);
        assert!(verifier.get_receipt(&receipt.receipt_id).is_some());

        let tampered = json.replace("\"10000\"", "\"1\"");
        assert!(matches!(
            verifier.import_receipt(&tampered),
            Err(ReceiptError::Integrity { .. })
        ));
        assert!(matches!(
            verifier.import_receipt("{}"),
            Err(ReceiptError::Malformed(_))
        ));
        assert!(issuer.export_receipt("missing").is_none());
    }

    #[tokio::test]
    async fn test_store_is_bounded() {
        let generator = ReceiptGenerator::new(ReceiptConfig {
            capacity: 2,
            ..ReceiptConfig::default()
        });
        let ids: Vec<_> = (0..3)
            .map(|i| {
                let mut data = data();
                data.transaction = format!("0x{i}");
                generator.generate_receipt(data).receipt_id
            })
            .collect();
        assert_eq!(generator.len(), 2);
        assert!(generator.get_receipt(&ids[0]).is_none());
        assert!(generator.get_receipt(&ids[2]).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_receipts_expire() {
        let generator = ReceiptGenerator::new(ReceiptConfig {
            ttl: Duration::from_secs(60),
            ..ReceiptConfig::default()
        });
        let receipt = generator.generate_receipt(data());
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(generator.get_receipt(&receipt.receipt_id).is_none());
        assert!(generator.is_empty());
    }
}

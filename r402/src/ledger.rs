//! The ledger collaborators.
//!
//! Building, signing and submitting transactions is chain specific and lives
//! outside the payment engine. The engine only sees these traits.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::LedgerError;
use crate::facilitator::BoxFuture;

/// A transfer the payer agreed to make, derived from the selected
/// [`PaymentRequirements`](crate::PaymentRequirements).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transfer {
    /// Recipient identifier (`payTo`).
    pub recipient: String,
    /// Opaque asset identifier.
    pub asset: String,
    /// Amount in atomic units.
    pub amount: u128,
    /// Network the transfer is built for.
    pub network: String,
}

/// A signed, not yet submitted, ledger transaction.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedTransaction {
    /// Encoded transaction blob, as expected by facilitators.
    pub blob: String,
    /// Transaction hash, when the ledger can derive it before submission.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

impl fmt::Debug for SignedTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignedTransaction")
            .field("blob_len", &self.blob.len())
            .field("hash", &self.hash)
            .finish()
    }
}

/// Status of a submitted transaction as reported by the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerStatus {
    /// Whether the ledger knows the transaction at all.
    pub found: bool,
    /// Whether execution succeeded. Meaningless when `found` is false.
    pub success: bool,
    /// VM status or failure reason reported by the ledger.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_status: Option<String>,
    /// Ledger version the transaction was committed at.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
}

impl LedgerStatus {
    /// A status for a transaction the ledger has not seen yet.
    #[must_use]
    pub const fn not_found() -> Self {
        Self {
            found: false,
            success: false,
            vm_status: None,
            version: None,
        }
    }
}

/// Holds the payer's key material and signs transactions built by a
/// [`LedgerClient`].
pub trait PaymentSigner: Send + Sync {
    /// The payer address. Budgets and receipts are keyed on it.
    fn address(&self) -> &str;

    /// Signs the raw signing message of a transaction.
    fn sign<'a>(&'a self, message: &'a [u8]) -> BoxFuture<'a, Result<Vec<u8>, LedgerError>>;
}

/// Chain access used by the engine.
pub trait LedgerClient: Send + Sync {
    /// Builds the transfer transaction for `signer` and signs it.
    fn build_and_sign<'a>(
        &'a self,
        signer: &'a dyn PaymentSigner,
        transfer: &'a Transfer,
    ) -> BoxFuture<'a, Result<SignedTransaction, LedgerError>>;

    /// Submits a signed transaction directly, returning its hash.
    fn submit<'a>(
        &'a self,
        transaction: &'a SignedTransaction,
    ) -> BoxFuture<'a, Result<String, LedgerError>>;

    /// Queries the status of a transaction by hash.
    fn query_status<'a>(&'a self, hash: &'a str)
    -> BoxFuture<'a, Result<LedgerStatus, LedgerError>>;
}

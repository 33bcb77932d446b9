//! The facilitator collaborator.
//!
//! A facilitator validates a signed payment (`verify`) and finalizes it on
//! the ledger (`settle`) on behalf of the caller. Implementations typically
//! make HTTP calls to a remote service; see `r402-http`.

use std::future::Future;
use std::pin::Pin;

use crate::error::TransportError;
use crate::proto::{PaymentPayload, PaymentRequirements, SettleResponse, VerifyResponse};

/// A boxed, `Send` future, used to keep the collaborator traits dyn-compatible.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A remote facilitator endpoint.
///
/// `Err` is reserved for transport-level failures. A facilitator that
/// answers "invalid" or "not settled" returns `Ok` with the corresponding
/// verdict so callers never retry business rejections.
pub trait Facilitator: Send + Sync {
    /// The base URL identifying this facilitator.
    fn url(&self) -> &str;

    /// Verifies a payment without settling it.
    fn verify<'a>(
        &'a self,
        payload: &'a PaymentPayload,
        requirements: &'a PaymentRequirements,
    ) -> BoxFuture<'a, Result<VerifyResponse, TransportError>>;

    /// Settles a verified payment.
    fn settle<'a>(
        &'a self,
        payload: &'a PaymentPayload,
        requirements: &'a PaymentRequirements,
    ) -> BoxFuture<'a, Result<SettleResponse, TransportError>>;
}

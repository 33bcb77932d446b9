#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Core types for client-side x402 payment flows.
//!
//! This crate holds the wire types exchanged during a pay-per-request
//! round-trip and the traits through which the payment engine talks to the
//! outside world. It performs no I/O itself.
//!
//! # Overview
//!
//! A client requests a resource and receives `402 Payment Required` together
//! with one or more [`PaymentRequirements`]. The client builds and signs a
//! ledger transaction, wraps it into a [`PaymentPayload`], and asks a
//! facilitator to verify and then settle it.
//!
//! # Modules
//!
//! - [`proto`] - Wire format types (requirements, payloads, verify/settle responses)
//! - [`error`] - Typed transport and ledger errors with retry classification
//! - [`facilitator`] - The [`Facilitator`] collaborator trait
//! - [`ledger`] - The [`LedgerClient`] and [`PaymentSigner`] collaborator traits
//! - [`transport`] - The [`ResourceTransport`] collaborator trait
//! - [`timestamp`] - Unix timestamps and UTC day arithmetic

pub mod error;
pub mod facilitator;
pub mod ledger;
pub mod proto;
pub mod timestamp;
pub mod transport;

pub use error::{LedgerError, Retryable, TransportError};
pub use facilitator::{BoxFuture, Facilitator};
pub use ledger::{LedgerClient, LedgerStatus, PaymentSigner, SignedTransaction, Transfer};
pub use proto::{
    PaymentPayload, PaymentRequired, PaymentRequirements, ResourceInfo, SettleResponse,
    VerifyResponse,
};
pub use timestamp::UnixTimestamp;
pub use transport::{ResourceRequest, ResourceResponse, ResourceTransport};

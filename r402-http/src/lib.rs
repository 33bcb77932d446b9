//! HTTP collaborators for client-side x402 payment flows.
//!
//! Implements the [`r402::Facilitator`] and [`r402::ResourceTransport`]
//! traits on top of `reqwest`, and provides the Base64 header codecs used
//! by the 402 challenge and the paid retry.
//!
//! # Modules
//!
//! - [`constants`] - HTTP header names and status codes
//! - [`headers`] - Base64 encoding/decoding for x402 HTTP headers
//! - [`error`] - Construction and codec errors
//! - [`facilitator`] - [`HttpFacilitatorClient`], a remote facilitator over HTTP
//! - [`client`] - [`HttpResourceClient`], the protected-resource transport
//!
//! Enable the `telemetry` feature to get `tracing` spans around every
//! outgoing request.

pub mod client;
pub mod constants;
pub mod error;
pub mod facilitator;
pub mod headers;

pub use client::HttpResourceClient;
pub use error::HttpError;
pub use facilitator::HttpFacilitatorClient;

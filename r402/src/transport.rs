//! The protected-resource transport.
//!
//! A fetch-like capability: the engine requests a URL, reads the 402 challenge,
//! and after payment fetches the resource again with payment headers.

use crate::error::TransportError;
use crate::facilitator::BoxFuture;

/// HTTP status code signalling a payment challenge.
pub const PAYMENT_REQUIRED_STATUS: u16 = 402;

/// An outgoing request for a protected resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRequest {
    /// Absolute URL of the resource.
    pub url: String,
    /// HTTP method, upper case.
    pub method: String,
    /// Extra request headers.
    pub headers: Vec<(String, String)>,
    /// Optional request body.
    pub body: Option<Vec<u8>>,
}

impl ResourceRequest {
    /// Creates a `GET` request for `url`.
    #[must_use]
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: "GET".to_owned(),
            headers: Vec::new(),
            body: None,
        }
    }

    /// Adds a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// A response from a protected resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response headers, in arrival order.
    pub headers: Vec<(String, String)>,
    /// Raw body.
    pub body: Vec<u8>,
}

impl ResourceResponse {
    /// Returns `true` for a 402 challenge.
    #[must_use]
    pub const fn is_payment_required(&self) -> bool {
        self.status == PAYMENT_REQUIRED_STATUS
    }

    /// Looks up a header value, ignoring ASCII case in the name.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Returns the body as UTF-8 text, replacing invalid sequences.
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Fetches protected resources.
pub trait ResourceTransport: Send + Sync {
    /// Performs `request` and returns the raw response, whatever its status.
    ///
    /// `Err` means no response was obtained at all.
    fn fetch<'a>(
        &'a self,
        request: &'a ResourceRequest,
    ) -> BoxFuture<'a, Result<ResourceResponse, TransportError>>;
}

//! Error types shared by the x402 collaborators.
//!
//! Retry decisions are made on the error *type*, never on message text:
//! every error that may cross a retry boundary implements [`Retryable`].

/// Classifies an error as transient (worth retrying) or terminal.
pub trait Retryable {
    /// Returns `true` if repeating the failed operation may succeed.
    fn is_retryable(&self) -> bool;
}

/// Errors raised while talking to a remote HTTP party (facilitator or
/// protected resource).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum TransportError {
    /// The connection could not be established or was reset.
    #[error("network error: {context}: {message}")]
    Network {
        /// Human-readable context (e.g. `"POST /verify"`).
        context: String,
        /// Underlying error text.
        message: String,
    },

    /// The remote party did not answer in time.
    #[error("timeout: {context}")]
    Timeout {
        /// Human-readable context.
        context: String,
    },

    /// The host name could not be resolved.
    #[error("DNS resolution failed: {context}: {message}")]
    Dns {
        /// Human-readable context.
        context: String,
        /// Underlying error text.
        message: String,
    },

    /// The remote party answered with an unexpected HTTP status.
    #[error("unexpected HTTP status {status}: {context}: {body}")]
    Status {
        /// Human-readable context.
        context: String,
        /// HTTP status code.
        status: u16,
        /// Response body, possibly truncated.
        body: String,
    },

    /// The response could not be decoded.
    #[error("failed to decode response: {context}: {message}")]
    Decode {
        /// Human-readable context.
        context: String,
        /// Underlying error text.
        message: String,
    },

    /// The request itself was malformed (bad URL, unserializable body).
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl TransportError {
    /// Creates a [`TransportError::Network`].
    #[must_use]
    pub fn network(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Network {
            context: context.into(),
            message: message.into(),
        }
    }

    /// Creates a [`TransportError::Timeout`].
    #[must_use]
    pub fn timeout(context: impl Into<String>) -> Self {
        Self::Timeout {
            context: context.into(),
        }
    }

    /// Creates a [`TransportError::Status`].
    #[must_use]
    pub fn status(context: impl Into<String>, status: u16, body: impl Into<String>) -> Self {
        Self::Status {
            context: context.into(),
            status,
            body: body.into(),
        }
    }

    /// Creates a [`TransportError::Decode`].
    #[must_use]
    pub fn decode(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Decode {
            context: context.into(),
            message: message.into(),
        }
    }
}

impl Retryable for TransportError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Network { .. } | Self::Timeout { .. } | Self::Dns { .. } => true,
            // 408 Request Timeout and 429 Too Many Requests are transient too.
            Self::Status { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            Self::Decode { .. } | Self::InvalidRequest(_) => false,
        }
    }
}

/// Errors raised by a [`LedgerClient`](crate::LedgerClient) or
/// [`PaymentSigner`](crate::PaymentSigner).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum LedgerError {
    /// The ledger node could not be reached.
    #[error("ledger unavailable: {0}")]
    Unavailable(String),

    /// The transaction could not be built (bad recipient, asset, amount).
    #[error("failed to build transaction: {0}")]
    Build(String),

    /// The signer refused or failed to sign.
    #[error("failed to sign transaction: {0}")]
    Signing(String),

    /// The ledger rejected a submitted transaction.
    #[error("transaction rejected: {0}")]
    Rejected(String),
}

impl Retryable for LedgerError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

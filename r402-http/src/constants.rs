//! HTTP-specific constants for the x402 protocol.

/// HTTP header carrying the Base64 payment payload (client to server).
pub const PAYMENT_SIGNATURE_HEADER: &str = "PAYMENT-SIGNATURE";

/// HTTP header carrying the Base64 402 challenge (server to client).
pub const PAYMENT_REQUIRED_HEADER: &str = "PAYMENT-REQUIRED";

/// HTTP header carrying the Base64 settlement result (server to client).
pub const PAYMENT_RESPONSE_HEADER: &str = "PAYMENT-RESPONSE";

/// HTTP header carrying the settled transaction hash on the paid retry.
pub const PAYMENT_TRANSACTION_HEADER: &str = "X-PAYMENT-TRANSACTION";

/// HTTP 402 Payment Required status code.
pub const HTTP_STATUS_PAYMENT_REQUIRED: u16 = r402::transport::PAYMENT_REQUIRED_STATUS;

/// Maximum number of response body bytes kept in a status error.
pub const MAX_ERROR_BODY_LEN: usize = 512;

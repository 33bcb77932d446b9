//! HTTP header encoding and decoding for x402 protocol messages.
//!
//! Handles Base64-encoded JSON payloads in the `PAYMENT-SIGNATURE`,
//! `PAYMENT-REQUIRED` and `PAYMENT-RESPONSE` headers.

use base64::prelude::*;
use r402::{PaymentPayload, PaymentRequired, SettleResponse};

use crate::error::HttpError;

/// Encodes a [`PaymentPayload`] as a Base64 string for the
/// `PAYMENT-SIGNATURE` header.
///
/// # Errors
///
/// Returns [`HttpError::Serialize`] if JSON serialization fails.
pub fn encode_payment_signature(payload: &PaymentPayload) -> Result<String, HttpError> {
    let json = serde_json::to_vec(payload)?;
    Ok(BASE64_STANDARD.encode(&json))
}

/// Encodes a [`PaymentRequired`] challenge for the `PAYMENT-REQUIRED` header.
///
/// # Errors
///
/// Returns [`HttpError::Serialize`] if JSON serialization fails.
pub fn encode_payment_required(required: &PaymentRequired) -> Result<String, HttpError> {
    let json = serde_json::to_vec(required)?;
    Ok(BASE64_STANDARD.encode(&json))
}

/// Decodes a `PAYMENT-REQUIRED` header value.
///
/// # Errors
///
/// Returns [`HttpError`] on Base64 or JSON decode failure.
pub fn decode_payment_required(header_value: &str) -> Result<PaymentRequired, HttpError> {
    let bytes = BASE64_STANDARD.decode(header_value.trim())?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Decodes a `PAYMENT-RESPONSE` header value into a [`SettleResponse`].
///
/// # Errors
///
/// Returns [`HttpError`] on Base64 or JSON decode failure.
pub fn decode_payment_response(header_value: &str) -> Result<SettleResponse, HttpError> {
    let bytes = BASE64_STANDARD.decode(header_value.trim())?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn challenge() -> PaymentRequired {
        serde_json::from_value(json!({
            "x402Version": 2,
            "accepts": [{
                "scheme": "exact",
                "network": "aptos:2",
                "amount": "10000",
                "asset": "0x1::aptos_coin::AptosCoin",
                "payTo": "0xmerchant",
                "maxTimeoutSeconds": 60
            }]
        }))
        .unwrap()
    }

    #[test]
    fn test_payment_required_header_roundtrip() {
        let encoded = encode_payment_required(&challenge()).unwrap();
        let decoded = decode_payment_required(&format!("  {encoded}\n")).unwrap();
        assert_eq!(decoded, challenge());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            decode_payment_required("not base64!"),
            Err(HttpError::Base64(_))
        ));
        let not_json = BASE64_STANDARD.encode(b"hello");
        assert!(matches!(
            decode_payment_required(&not_json),
            Err(HttpError::Serialize(_))
        ));
    }

    #[test]
    fn test_decode_payment_response() {
        let encoded = BASE64_STANDARD.encode(br#"{"success":true,"transaction":"0xabc"}"#);
        let response = decode_payment_response(&encoded).unwrap();
        assert!(response.is_success());
    }
}

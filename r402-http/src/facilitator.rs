//! A [`r402::Facilitator`] implementation that talks to a _remote_ x402
//! facilitator over HTTP.
//!
//! [`HttpFacilitatorClient`] handles the `/verify` and `/settle` endpoints.
//!
//! ## Error Handling
//!
//! Every failure is reported as a [`TransportError`] so the retry layer can
//! tell transient failures (connect errors, timeouts, 5xx, 408, 429) from
//! terminal ones (other 4xx, undecodable bodies). A facilitator answering
//! `200 OK` with `isValid: false` or `success: false` is not an error.

use std::fmt::Display;
use std::time::Duration;

use http::{HeaderMap, StatusCode};
use r402::proto::FacilitatorRequest;
use r402::{
    BoxFuture, Facilitator, PaymentPayload, PaymentRequirements, SettleResponse, TransportError,
    VerifyResponse,
};
use reqwest::Client;
use url::Url;

#[cfg(feature = "telemetry")]
use tracing::{Span, instrument};

use crate::constants::MAX_ERROR_BODY_LEN;
use crate::error::{HttpError, classify_reqwest_error, truncate_body};

/// A client for communicating with a remote x402 facilitator.
#[derive(Clone, Debug)]
pub struct HttpFacilitatorClient {
    /// Base URL as configured, without trailing slash
    url: String,
    /// Full URL to `POST /verify` requests
    verify_url: Url,
    /// Full URL to `POST /settle` requests
    settle_url: Url,
    /// Shared Reqwest HTTP client
    client: Client,
    /// Optional custom headers sent with each request
    headers: HeaderMap,
    /// Optional request timeout
    timeout: Option<Duration>,
}

impl HttpFacilitatorClient {
    /// Constructs a new client from a base URL.
    ///
    /// `./verify` and `./settle` are resolved relative to the base.
    ///
    /// # Errors
    ///
    /// Returns [`HttpError::UrlParse`] if URL construction fails.
    pub fn try_new(base_url: Url) -> Result<Self, HttpError> {
        let verify_url = base_url
            .join("./verify")
            .map_err(|e| HttpError::UrlParse {
                context: "Failed to construct ./verify URL",
                source: e,
            })?;
        let settle_url = base_url
            .join("./settle")
            .map_err(|e| HttpError::UrlParse {
                context: "Failed to construct ./settle URL",
                source: e,
            })?;
        Ok(Self {
            url: base_url.as_str().trim_end_matches('/').to_owned(),
            verify_url,
            settle_url,
            client: Client::new(),
            headers: HeaderMap::new(),
            timeout: None,
        })
    }

    /// Returns the computed `./verify` URL.
    pub const fn verify_url(&self) -> &Url {
        &self.verify_url
    }

    /// Returns the computed `./settle` URL.
    pub const fn settle_url(&self) -> &Url {
        &self.settle_url
    }

    /// Returns the configured timeout, if any.
    pub const fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Attaches custom headers (e.g. an API key) to all future requests.
    #[must_use]
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Sets a per-request timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Replaces the underlying `reqwest` client.
    #[must_use]
    pub fn with_http_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    /// Sends a `POST /verify` request to the facilitator.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if the request does not produce a
    /// decodable `200 OK` answer.
    #[cfg_attr(
        feature = "telemetry",
        instrument(
            name = "x402.facilitator_client.verify",
            skip_all,
            fields(
                facilitator = %self.url,
                otel.status_code = tracing::field::Empty,
                error.message = tracing::field::Empty
            )
        )
    )]
    pub async fn verify(
        &self,
        payload: &PaymentPayload,
        requirements: &PaymentRequirements,
    ) -> Result<VerifyResponse, TransportError> {
        let body = FacilitatorRequest::new(payload, requirements);
        self.post_json(&self.verify_url, "POST /verify", &body)
            .await
    }

    /// Sends a `POST /settle` request to the facilitator.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if the request does not produce a
    /// decodable `200 OK` answer.
    #[cfg_attr(
        feature = "telemetry",
        instrument(
            name = "x402.facilitator_client.settle",
            skip_all,
            fields(
                facilitator = %self.url,
                otel.status_code = tracing::field::Empty,
                error.message = tracing::field::Empty
            )
        )
    )]
    pub async fn settle(
        &self,
        payload: &PaymentPayload,
        requirements: &PaymentRequirements,
    ) -> Result<SettleResponse, TransportError> {
        let body = FacilitatorRequest::new(payload, requirements);
        self.post_json(&self.settle_url, "POST /settle", &body)
            .await
    }

    /// POST helper that handles JSON serialization, error mapping, timeout
    /// application, and telemetry integration.
    async fn post_json<T, R>(
        &self,
        url: &Url,
        context: &'static str,
        payload: &T,
    ) -> Result<R, TransportError>
    where
        T: serde::Serialize + Sync + ?Sized,
        R: serde::de::DeserializeOwned,
    {
        let result = self.send_json(url, context, payload).await;
        record_result_on_span(&result);
        result
    }

    async fn send_json<T, R>(
        &self,
        url: &Url,
        context: &'static str,
        payload: &T,
    ) -> Result<R, TransportError>
    where
        T: serde::Serialize + Sync + ?Sized,
        R: serde::de::DeserializeOwned,
    {
        let mut req = self.client.post(url.clone()).json(payload);
        for (key, value) in &self.headers {
            req = req.header(key, value);
        }
        if let Some(timeout) = self.timeout {
            req = req.timeout(timeout);
        }
        let http_response = req
            .send()
            .await
            .map_err(|e| classify_reqwest_error(context, &e))?;

        let status = http_response.status();
        let bytes = http_response
            .bytes()
            .await
            .map_err(|e| classify_reqwest_error(context, &e))?;

        if status == StatusCode::OK {
            serde_json::from_slice::<R>(&bytes)
                .map_err(|e| TransportError::decode(context, e.to_string()))
        } else {
            let body = truncate_body(
                String::from_utf8_lossy(&bytes).into_owned(),
                MAX_ERROR_BODY_LEN,
            );
            Err(TransportError::status(context, status.as_u16(), body))
        }
    }
}

impl Facilitator for HttpFacilitatorClient {
    fn url(&self) -> &str {
        &self.url
    }

    fn verify<'a>(
        &'a self,
        payload: &'a PaymentPayload,
        requirements: &'a PaymentRequirements,
    ) -> BoxFuture<'a, Result<VerifyResponse, TransportError>> {
        Box::pin(Self::verify(self, payload, requirements))
    }

    fn settle<'a>(
        &'a self,
        payload: &'a PaymentPayload,
        requirements: &'a PaymentRequirements,
    ) -> BoxFuture<'a, Result<SettleResponse, TransportError>> {
        Box::pin(Self::settle(self, payload, requirements))
    }
}

/// Converts a string URL into a client, normalizing the trailing slash.
impl TryFrom<&str> for HttpFacilitatorClient {
    type Error = HttpError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let mut normalized = value.trim_end_matches('/').to_string();
        normalized.push('/');
        let url = Url::parse(&normalized).map_err(|e| HttpError::UrlParse {
            context: "Failed to parse base url",
            source: e,
        })?;
        Self::try_new(url)
    }
}

impl TryFrom<String> for HttpFacilitatorClient {
    type Error = HttpError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::try_from(value.as_str())
    }
}

/// Records the outcome of a request on the current span.
#[cfg(feature = "telemetry")]
fn record_result_on_span<R, E: Display>(result: &Result<R, E>) {
    let span = Span::current();
    match result {
        Ok(_) => {
            span.record("otel.status_code", "OK");
        }
        Err(err) => {
            span.record("otel.status_code", "ERROR");
            span.record("error.message", tracing::field::display(err));
            tracing::event!(tracing::Level::WARN, error = %err, "Request to facilitator failed");
        }
    }
}

/// Noop if telemetry feature is off.
#[cfg(not(feature = "telemetry"))]
fn record_result_on_span<R, E: Display>(_result: &Result<R, E>) {}

#[cfg(test)]
mod tests {
    use super::*;
    use r402::Retryable;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn requirements() -> PaymentRequirements {
        serde_json::from_value(json!({
            "scheme": "exact",
            "network": "aptos:2",
            "amount": "10000",
            "asset": "0x1::aptos_coin::AptosCoin",
            "payTo": "0xmerchant",
            "maxTimeoutSeconds": 60
        }))
        .unwrap()
    }

    fn payload() -> PaymentPayload {
        PaymentPayload::new(requirements(), "0xsigned", None)
    }

    #[test]
    fn test_try_from_normalizes_trailing_slash() {
        let client = HttpFacilitatorClient::try_from("https://facilitator.example/api//").unwrap();
        assert_eq!(Facilitator::url(&client), "https://facilitator.example/api");
        assert_eq!(
            client.verify_url().as_str(),
            "https://facilitator.example/api/verify"
        );
        assert_eq!(
            client.settle_url().as_str(),
            "https://facilitator.example/api/settle"
        );
    }

    #[test]
    fn test_try_from_rejects_invalid_url() {
        assert!(matches!(
            HttpFacilitatorClient::try_from("not a url"),
            Err(HttpError::UrlParse { .. })
        ));
    }

    #[tokio::test]
    async fn test_verify_posts_request_body() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/verify"))
            .and(body_partial_json(json!({
                "x402Version": 2,
                "paymentPayload": { "payload": { "transaction": "0xsigned" } },
                "paymentRequirements": { "payTo": "0xmerchant" }
            })))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "isValid": true, "payer": "0xp" })),
            )
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = HttpFacilitatorClient::try_from(mock_server.uri()).unwrap();
        let response = client.verify(&payload(), &requirements()).await.unwrap();
        assert_eq!(response, VerifyResponse::valid(Some("0xp".into())));
    }

    #[tokio::test]
    async fn test_settle_business_failure_is_not_an_error() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/settle"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "success": false, "errorReason": "insufficient_funds" })),
            )
            .mount(&mock_server)
            .await;

        let client = HttpFacilitatorClient::try_from(mock_server.uri()).unwrap();
        let response = client.settle(&payload(), &requirements()).await.unwrap();
        assert!(!response.is_success());
    }

    #[tokio::test]
    async fn test_server_error_is_retryable_client_error_is_not() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/verify"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&mock_server)
            .await;
        Mock::given(method("POST"))
            .and(path("/settle"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad payload"))
            .mount(&mock_server)
            .await;

        let client = HttpFacilitatorClient::try_from(mock_server.uri()).unwrap();

        let err = client.verify(&payload(), &requirements()).await.unwrap_err();
        assert!(matches!(err, TransportError::Status { status: 503, .. }));
        assert!(err.is_retryable());

        let err = client.settle(&payload(), &requirements()).await.unwrap_err();
        assert!(matches!(err, TransportError::Status { status: 400, .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_undecodable_body_is_terminal() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/verify"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&mock_server)
            .await;

        let client = HttpFacilitatorClient::try_from(mock_server.uri()).unwrap();
        let err = client.verify(&payload(), &requirements()).await.unwrap_err();
        assert!(matches!(err, TransportError::Decode { .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_slow_facilitator_times_out() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/verify"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "isValid": true }))
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&mock_server)
            .await;

        let client = HttpFacilitatorClient::try_from(mock_server.uri())
            .unwrap()
            .with_timeout(Duration::from_millis(50));
        let err = client.verify(&payload(), &requirements()).await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_connection_refused_is_retryable() {
        let mock_server = MockServer::start().await;
        let uri = mock_server.uri();
        drop(mock_server);

        let client = HttpFacilitatorClient::try_from(uri).unwrap();
        let err = client.verify(&payload(), &requirements()).await.unwrap_err();
        assert!(err.is_retryable(), "unexpected error: {err:?}");
    }
}

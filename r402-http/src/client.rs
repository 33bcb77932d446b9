//! The protected-resource transport over `reqwest`.
//!
//! [`HttpResourceClient`] performs the unpaid request and the paid retry of a
//! protected resource. Unlike the facilitator client it never treats a
//! non-2xx status as an error: a `402` is the challenge the engine expects.

use std::time::Duration;

use http::Method;
use r402::{BoxFuture, ResourceRequest, ResourceResponse, ResourceTransport, TransportError};
use reqwest::Client;

#[cfg(feature = "telemetry")]
use tracing::instrument;

use crate::error::{HttpError, classify_reqwest_error};

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Fetches protected resources over HTTP.
#[derive(Clone, Debug)]
pub struct HttpResourceClient {
    client: Client,
}

impl HttpResourceClient {
    /// Creates a client with [`DEFAULT_TIMEOUT`] and a bounded redirect policy.
    ///
    /// # Errors
    ///
    /// Returns [`HttpError::ClientBuild`] if the TLS backend fails to
    /// initialize.
    pub fn try_new() -> Result<Self, HttpError> {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    /// Creates a client with the given per-request timeout.
    ///
    /// # Errors
    ///
    /// Returns [`HttpError::ClientBuild`] if the TLS backend fails to
    /// initialize.
    pub fn with_timeout(timeout: Duration) -> Result<Self, HttpError> {
        let client = Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .map_err(HttpError::ClientBuild)?;
        Ok(Self { client })
    }

    /// Wraps an existing `reqwest` client.
    #[must_use]
    pub const fn from_client(client: Client) -> Self {
        Self { client }
    }

    /// Performs `request` and collects the full response.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] when no response could be obtained.
    #[cfg_attr(
        feature = "telemetry",
        instrument(
            name = "x402.resource_client.fetch",
            skip_all,
            fields(url = %request.url, method = %request.method),
            err
        )
    )]
    pub async fn fetch(&self, request: &ResourceRequest) -> Result<ResourceResponse, TransportError> {
        let context = format!("{} {}", request.method, request.url);
        let method = Method::from_bytes(request.method.as_bytes())
            .map_err(|e| TransportError::InvalidRequest(format!("{context}: {e}")))?;

        let mut req = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            req = req.header(name, value);
        }
        if let Some(body) = &request.body {
            req = req.body(body.clone());
        }

        let response = req
            .send()
            .await
            .map_err(|e| classify_reqwest_error(&context, &e))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_owned(), v.to_owned()))
            })
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|e| classify_reqwest_error(&context, &e))?
            .to_vec();

        #[cfg(feature = "telemetry")]
        tracing::debug!(status, body_len = body.len(), "resource fetched");

        Ok(ResourceResponse {
            status,
            headers,
            body,
        })
    }
}

impl ResourceTransport for HttpResourceClient {
    fn fetch<'a>(
        &'a self,
        request: &'a ResourceRequest,
    ) -> BoxFuture<'a, Result<ResourceResponse, TransportError>> {
        Box::pin(Self::fetch(self, request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{PAYMENT_REQUIRED_HEADER, PAYMENT_SIGNATURE_HEADER};
    use r402::Retryable;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_payment_required_is_returned_not_raised() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/weather"))
            .respond_with(
                ResponseTemplate::new(402)
                    .insert_header(PAYMENT_REQUIRED_HEADER, "eyJ9")
                    .set_body_string("{}"),
            )
            .mount(&mock_server)
            .await;

        let client = HttpResourceClient::try_new().unwrap();
        let request = ResourceRequest::get(format!("{}/weather", mock_server.uri()));
        let response = client.fetch(&request).await.unwrap();
        assert!(response.is_payment_required());
        assert_eq!(response.header("payment-required"), Some("eyJ9"));
    }

    #[tokio::test]
    async fn test_request_headers_are_forwarded() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/weather"))
            .and(header(PAYMENT_SIGNATURE_HEADER, "c2lnbmVk"))
            .respond_with(ResponseTemplate::new(200).set_body_string("sunny"))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = HttpResourceClient::try_new().unwrap();
        let request = ResourceRequest::get(format!("{}/weather", mock_server.uri()))
            .with_header(PAYMENT_SIGNATURE_HEADER, "c2lnbmVk");
        let response = client.fetch(&request).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.text(), "sunny");
    }

    #[tokio::test]
    async fn test_invalid_method_is_terminal() {
        let client = HttpResourceClient::try_new().unwrap();
        let mut request = ResourceRequest::get("http://127.0.0.1:1/");
        request.method = "NOT A METHOD".into();
        let err = client.fetch(&request).await.unwrap_err();
        assert!(matches!(err, TransportError::InvalidRequest(_)));
        assert!(!err.is_retryable());
    }
}

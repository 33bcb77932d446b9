//! Error types for the HTTP transport layer.

/// Errors raised while constructing HTTP clients or decoding x402 headers.
///
/// Request-time failures are reported as [`r402::TransportError`] so the
/// retry layer can classify them.
#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Base64 decoding failed.
    #[error("Base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    /// URL parse error.
    #[error("URL parse error: {context}: {source}")]
    UrlParse {
        /// Human-readable context.
        context: &'static str,
        /// The underlying parse error.
        #[source]
        source: url::ParseError,
    },

    /// The underlying HTTP client could not be built.
    #[error("failed to build HTTP client: {0}")]
    ClientBuild(#[source] reqwest::Error),
}

/// Maps a `reqwest` failure onto the retry-aware [`r402::TransportError`].
pub(crate) fn classify_reqwest_error(
    context: &str,
    err: &reqwest::Error,
) -> r402::TransportError {
    use r402::TransportError;

    if err.is_timeout() {
        TransportError::timeout(context)
    } else if err.is_builder() {
        TransportError::InvalidRequest(format!("{context}: {err}"))
    } else if err.is_decode() {
        TransportError::decode(context, err.to_string())
    } else if is_dns_failure(err) {
        TransportError::Dns {
            context: context.to_owned(),
            message: err.to_string(),
        }
    } else {
        TransportError::network(context, error_chain(err))
    }
}

/// Resolver failures surface from hyper only as a `"dns error"` message in
/// the source chain.
fn is_dns_failure(err: &reqwest::Error) -> bool {
    let mut source = std::error::Error::source(err);
    while let Some(inner) = source {
        if inner.to_string().starts_with("dns error") {
            return true;
        }
        source = inner.source();
    }
    false
}

fn error_chain(err: &reqwest::Error) -> String {
    let mut message = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(inner) = source {
        message.push_str(": ");
        message.push_str(&inner.to_string());
        source = inner.source();
    }
    message
}

/// Truncates a response body for inclusion in an error.
pub(crate) fn truncate_body(mut body: String, max: usize) -> String {
    if body.len() > max {
        let mut cut = max;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    body
}

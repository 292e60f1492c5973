//! Error types for the serving path.

use axum::body::Body;
use http::{Response, StatusCode};
use thiserror::Error;

/// Errors that can occur while serving a client request.
///
/// Nothing in the shadow path is allowed to surface here: comparison jobs
/// report their failures through metrics and logs only, so every variant in
/// this enum maps to a client-visible status code.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Reading the client's request body failed mid-stream (maps to 500).
    #[error("failed to read request body: {0}")]
    BodyRead(String),

    /// Request body exceeds the configured buffer cap (maps to 413).
    #[error("request body exceeds limit of {0} bytes")]
    PayloadTooLarge(usize),

    /// Transport-level failure talking to an upstream (maps to 502).
    #[error("upstream {upstream} request failed: {source}")]
    Upstream {
        upstream: &'static str,
        #[source]
        source: reqwest::Error,
    },

    /// Reading an upstream response body failed (maps to 502).
    #[error("upstream {upstream} response body read failed: {source}")]
    UpstreamBody {
        upstream: &'static str,
        #[source]
        source: reqwest::Error,
    },

    /// The upstream base address and request target do not form a valid URL
    /// (maps to 500; configured addresses are checked at startup).
    #[error("invalid upstream URL: {0}")]
    InvalidUrl(String),

    /// Building the reqwest client failed at startup.
    #[error("failed to build HTTP client: {0}")]
    ClientBuild(reqwest::Error),
}

impl ProxyError {
    /// Map the error to the HTTP response returned to the client.
    pub fn to_response(&self) -> Response<Body> {
        let (status, message) = match self {
            ProxyError::BodyRead(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "500 Internal Server Error\n\nFailed to read request body.",
            ),
            ProxyError::PayloadTooLarge(_) => (
                StatusCode::PAYLOAD_TOO_LARGE,
                "413 Payload Too Large\n\nRequest body exceeds the configured limit.",
            ),
            ProxyError::Upstream { .. } | ProxyError::UpstreamBody { .. } => (
                StatusCode::BAD_GATEWAY,
                "502 Bad Gateway\n\nFailed to reach the main upstream.",
            ),
            ProxyError::InvalidUrl(_) | ProxyError::ClientBuild(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "500 Internal Server Error\n\nAn internal error occurred.",
            ),
        };

        Response::builder()
            .status(status)
            .header(http::header::CONTENT_TYPE, "text/plain")
            .body(Body::from(message))
            .unwrap_or_else(|_| {
                let mut res = Response::new(Body::from("500 Internal Server Error"));
                *res.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                res
            })
    }

    /// Whether this error indicates a failure reaching or reading an upstream.
    pub fn is_upstream_error(&self) -> bool {
        matches!(
            self,
            ProxyError::Upstream { .. } | ProxyError::UpstreamBody { .. }
        )
    }
}

/// Result type alias for proxy operations.
pub type ProxyResult<T> = Result<T, ProxyError>;

//! Upstream HTTP clients.
//!
//! One client per upstream (main and test), each with its own connection
//! pool. Requests carry the original method, target, headers, and body;
//! hop-by-hop headers and `host` are stripped because the client manages the
//! connection and authority itself. Redirects are never followed: the proxy
//! relays whatever the upstream answered.

use std::time::{Duration, Instant};

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};

use crate::error::{ProxyError, ProxyResult};

/// Label values for the two upstreams, also used in metrics.
pub const MAIN_UPSTREAM: &str = "main_upstream";
pub const TEST_UPSTREAM: &str = "test_upstream";

/// A pooled client bound to one upstream base address.
#[derive(Clone)]
pub struct UpstreamClient {
    client: reqwest::Client,
    base_url: String,
    name: &'static str,
}

/// A fully buffered upstream response.
pub struct BufferedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub elapsed: Duration,
}

impl UpstreamClient {
    /// Build a client for the given upstream. The address must be an
    /// absolute http(s) URL (validated at config load).
    pub fn new(name: &'static str, base_url: &str) -> ProxyResult<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .pool_max_idle_per_host(32)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_nodelay(true)
            .build()
            .map_err(ProxyError::ClientBuild)?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            name,
        })
    }

    /// The metrics label for this upstream.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Issue a request and return the response with its body still
    /// streaming. The elapsed time covers the round trip to response
    /// headers, matching what the duration histogram reports.
    pub async fn send(
        &self,
        method: &Method,
        target: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> ProxyResult<(reqwest::Response, Duration)> {
        let url = format!("{}{}", self.base_url, target);
        let start = Instant::now();
        let response = self
            .client
            .request(method.clone(), &url)
            .headers(forwardable_headers(headers))
            .body(body)
            .send()
            .await
            .map_err(|source| ProxyError::Upstream {
                upstream: self.name,
                source,
            })?;
        Ok((response, start.elapsed()))
    }

    /// Issue a request with a streaming body. Used on the skip fast path
    /// where the request body never needs replaying.
    pub async fn send_streaming(
        &self,
        method: &Method,
        target: &str,
        headers: &HeaderMap,
        body: reqwest::Body,
    ) -> ProxyResult<(reqwest::Response, Duration)> {
        let url = format!("{}{}", self.base_url, target);
        let start = Instant::now();
        let response = self
            .client
            .request(method.clone(), &url)
            .headers(forwardable_headers(headers))
            .body(body)
            .send()
            .await
            .map_err(|source| ProxyError::Upstream {
                upstream: self.name,
                source,
            })?;
        Ok((response, start.elapsed()))
    }

    /// Issue a request and buffer the whole response body. Used by the
    /// comparison job, which always needs the bytes in memory.
    pub async fn send_buffered(
        &self,
        method: &Method,
        target: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> ProxyResult<BufferedResponse> {
        let (response, elapsed) = self.send(method, target, headers, body).await?;
        let status = response.status();
        let response_headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|source| ProxyError::UpstreamBody {
                upstream: self.name,
                source,
            })?;
        Ok(BufferedResponse {
            status,
            headers: response_headers,
            body,
            elapsed,
        })
    }
}

/// Copy of the request headers safe to forward upstream: hop-by-hop headers
/// and `host` are dropped, everything else passes through including
/// multi-valued headers.
fn forwardable_headers(headers: &HeaderMap) -> HeaderMap {
    let mut forwarded = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if !is_hop_by_hop_header(name.as_str()) && name != &http::header::HOST {
            forwarded.append(name.clone(), value.clone());
        }
    }
    forwarded
}

/// Connection-management headers that must not cross the proxy.
pub fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name.to_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

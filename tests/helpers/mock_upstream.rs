//! Configurable mock upstream for integration testing.
//!
//! Answers any method and path with a preconfigured response (exact path
//! match, with a default fallback) and records what it received so tests can
//! assert on replayed traffic.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::response::Response;
use axum::Router;
use http_body_util::BodyExt;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// A canned response.
#[derive(Debug, Clone)]
pub struct MockResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub delay: Option<Duration>,
}

impl MockResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
            delay: None,
        }
    }

    pub fn json(status: u16, body: &str) -> Self {
        Self::new(status)
            .with_header("content-type", "application/json")
            .with_body(body.as_bytes())
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_body(mut self, body: &[u8]) -> Self {
        self.body = body.to_vec();
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// Builder for a mock upstream server.
#[derive(Debug, Clone)]
pub struct MockUpstream {
    responses: Vec<(String, MockResponse)>,
    default: MockResponse,
}

impl MockUpstream {
    pub fn new() -> Self {
        Self {
            responses: Vec::new(),
            default: MockResponse::new(200),
        }
    }

    /// Respond to an exact path with the given response.
    #[must_use]
    pub fn with_response(mut self, path: &str, response: MockResponse) -> Self {
        self.responses.push((path.to_string(), response));
        self
    }

    /// Response for paths without a specific entry.
    #[must_use]
    pub fn with_default(mut self, response: MockResponse) -> Self {
        self.default = response;
        self
    }

    /// Start the server on an ephemeral port.
    pub async fn start(self) -> (SocketAddr, MockHandle) {
        let state = Arc::new(MockState {
            responses: self.responses,
            default: self.default,
            request_count: AtomicU32::new(0),
            last_request: Mutex::new(None),
        });

        let app = Router::new()
            .fallback(handle)
            .with_state(Arc::clone(&state));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (
            addr,
            MockHandle {
                state,
                _handle: handle,
            },
        )
    }
}

impl Default for MockUpstream {
    fn default() -> Self {
        Self::new()
    }
}

/// What one received request looked like.
#[derive(Debug, Clone)]
pub struct ReceivedRequest {
    pub method: String,
    pub target: String,
    pub body: Vec<u8>,
}

#[derive(Debug)]
struct MockState {
    responses: Vec<(String, MockResponse)>,
    default: MockResponse,
    request_count: AtomicU32,
    last_request: Mutex<Option<ReceivedRequest>>,
}

/// Handle to a running mock server.
pub struct MockHandle {
    state: Arc<MockState>,
    _handle: JoinHandle<()>,
}

impl MockHandle {
    pub fn request_count(&self) -> u32 {
        self.state.request_count.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<ReceivedRequest> {
        self.state.last_request.lock().unwrap().clone()
    }
}

async fn handle(State(state): State<Arc<MockState>>, req: Request) -> Response {
    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let target = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| path.clone());

    let body = req
        .into_body()
        .collect()
        .await
        .map(|collected| collected.to_bytes())
        .unwrap_or_else(|_| Bytes::new());

    state.request_count.fetch_add(1, Ordering::SeqCst);
    *state.last_request.lock().unwrap() = Some(ReceivedRequest {
        method,
        target,
        body: body.to_vec(),
    });

    let response = state
        .responses
        .iter()
        .find(|(p, _)| *p == path)
        .map(|(_, r)| r)
        .unwrap_or(&state.default)
        .clone();

    if let Some(delay) = response.delay {
        tokio::time::sleep(delay).await;
    }

    let mut out = Response::new(Body::from(response.body));
    *out.status_mut() = http::StatusCode::from_u16(response.status).unwrap();
    for (name, value) in &response.headers {
        out.headers_mut().append(
            name.parse::<http::header::HeaderName>().unwrap(),
            value.parse::<http::header::HeaderValue>().unwrap(),
        );
    }
    out
}

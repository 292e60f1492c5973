//! Client-facing proxy service.
//!
//! Every request is forwarded to the main upstream and the main response is
//! returned to the client. Requests on skipped routes stream straight
//! through. Everything else is buffered so the request can be replayed: once
//! the main reply is ready the sampler decides whether to build a comparison
//! job, and the job is handed to the worker queue only after the client
//! reply has been written (the dispatch guard rides on the response body).

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::extract::{Request, State};
use axum::response::Response;
use axum::Router;
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use http_body::{Frame, SizeHint};
use http_body_util::{BodyExt, LengthLimitError, Limited};
use tracing::{debug, error, info, warn};

use crate::config::{Config, LimitsConfig};
use crate::error::{ProxyError, ProxyResult};
use crate::metrics::ProxyMetrics;
use crate::policy::RouteTable;
use crate::route::route_key;
use crate::sampler::Sampler;
use crate::shadow::{CompareJob, ShadowContext};
use crate::storage::Storage;
use crate::upstream::{is_hop_by_hop_header, UpstreamClient, MAIN_UPSTREAM, TEST_UPSTREAM};
use crate::worker::{EnqueueError, WorkerPool};

/// Shared state behind the axum service.
pub struct ProxyState {
    main_client: UpstreamClient,
    table: Arc<RouteTable>,
    sampler: Sampler,
    pool: Arc<WorkerPool>,
    metrics: Arc<ProxyMetrics>,
    limits: LimitsConfig,
}

/// The assembled proxy: a router to serve and the worker pool to drain on
/// shutdown.
pub struct ProxyApp {
    pub router: Router,
    pub pool: Arc<WorkerPool>,
}

impl ProxyApp {
    /// Wire clients, sampler, worker pool, and routing state together.
    pub fn new(
        config: &Config,
        table: RouteTable,
        storage: Arc<dyn Storage>,
        metrics: Arc<ProxyMetrics>,
    ) -> ProxyResult<Self> {
        let main_client = UpstreamClient::new(MAIN_UPSTREAM, &config.upstreams.main.address)?;
        let test_client = UpstreamClient::new(TEST_UPSTREAM, &config.upstreams.test.address)?;

        let ctx = Arc::new(ShadowContext {
            test_client,
            storage,
            metrics: Arc::clone(&metrics),
        });
        let pool = Arc::new(WorkerPool::start(
            config.worker.count,
            config.worker.queue_size,
            ctx,
        ));

        let state = Arc::new(ProxyState {
            main_client,
            table: Arc::new(table),
            sampler: Sampler::new(),
            pool: Arc::clone(&pool),
            metrics,
            limits: config.limits.clone(),
        });

        Ok(Self {
            router: Router::new().fallback(handle).with_state(state),
            pool,
        })
    }
}

/// Top-level request handler.
async fn handle(State(state): State<Arc<ProxyState>>, req: Request) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let target = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| path.clone());
    let route = route_key(method.as_str(), &path);

    let resolution = state.table.resolve(method.as_str(), &path);

    let result = if resolution.skip {
        serve_skipped(&state, req, &method, &target, &route).await
    } else {
        serve_shadowed(&state, req, &method, &target, &route, resolution.policy).await
    };

    result.unwrap_or_else(|e| {
        error!(
            method = %method,
            url = %target,
            route = %route,
            error = %e,
            "request failed"
        );
        e.to_response()
    })
}

/// Fast path for skipped routes: stream the request to the main upstream and
/// the response back, with no buffering, sampling, or sink involvement.
async fn serve_skipped(
    state: &ProxyState,
    req: Request,
    method: &Method,
    target: &str,
    route: &str,
) -> ProxyResult<Response> {
    state
        .metrics
        .record_route_skip(route, method.as_str(), "config");

    let (parts, body) = req.into_parts();
    let body = reqwest::Body::wrap_stream(body.into_data_stream());

    let (response, elapsed) = match state
        .main_client
        .send_streaming(method, target, &parts.headers, body)
        .await
    {
        Ok(r) => r,
        Err(e) => {
            state.metrics.record_upstream(
                "client_error",
                method.as_str(),
                MAIN_UPSTREAM,
                route,
                "skipped",
                None,
            );
            return Err(e);
        }
    };

    state.metrics.record_upstream(
        response.status().as_str(),
        method.as_str(),
        MAIN_UPSTREAM,
        route,
        "skipped",
        Some(elapsed.as_secs_f64()),
    );

    let status = response.status();
    let headers = response.headers().clone();
    Ok(client_response(
        status,
        &headers,
        Body::from_stream(response.bytes_stream()),
    ))
}

/// Serving path for shadow-tested routes: buffer the request body, call the
/// main upstream, reply to the client, and hand a comparison job to the
/// worker queue once the reply is written.
async fn serve_shadowed(
    state: &ProxyState,
    req: Request,
    method: &Method,
    target: &str,
    route: &str,
    policy: Arc<crate::policy::EffectivePolicy>,
) -> ProxyResult<Response> {
    let (parts, body) = req.into_parts();

    // The request body must be replayable, so it is buffered up front.
    let req_body = Limited::new(body, state.limits.max_request_body_bytes)
        .collect()
        .await
        .map(|collected| collected.to_bytes())
        .map_err(|e| {
            if e.downcast_ref::<LengthLimitError>().is_some() {
                ProxyError::PayloadTooLarge(state.limits.max_request_body_bytes)
            } else {
                ProxyError::BodyRead(e.to_string())
            }
        })?;

    let (response, elapsed) = match state
        .main_client
        .send(method, target, &parts.headers, req_body.clone())
        .await
    {
        Ok(r) => r,
        Err(e) => {
            state.metrics.record_upstream(
                "client_error",
                method.as_str(),
                MAIN_UPSTREAM,
                route,
                "error",
                None,
            );
            return Err(e);
        }
    };

    let main_status = response.status();
    let main_headers = response.headers().clone();
    state.metrics.record_upstream(
        main_status.as_str(),
        method.as_str(),
        MAIN_UPSTREAM,
        route,
        "success",
        Some(elapsed.as_secs_f64()),
    );

    // A response that advertises more than the buffer cap streams through
    // uncompared; buffering it would defeat the memory bound.
    if let Some(len) = response.content_length() {
        if len > state.limits.max_response_body_bytes as u64 {
            warn!(
                route = %route,
                content_length = len,
                limit = state.limits.max_response_body_bytes,
                "main response exceeds buffer cap, skipping shadow comparison"
            );
            return Ok(client_response(
                main_status,
                &main_headers,
                Body::from_stream(response.bytes_stream()),
            ));
        }
    }

    let main_body = response
        .bytes()
        .await
        .map_err(|source| ProxyError::UpstreamBody {
            upstream: MAIN_UPSTREAM,
            source,
        })?;

    // Chunked responses reveal their size only after buffering.
    if main_body.len() > state.limits.max_response_body_bytes {
        warn!(
            route = %route,
            size = main_body.len(),
            limit = state.limits.max_response_body_bytes,
            "main response exceeds buffer cap, skipping shadow comparison"
        );
        return Ok(client_response(
            main_status,
            &main_headers,
            Body::from(main_body),
        ));
    }

    // Admission is decided now, after the main reply is ready; the job is
    // enqueued by the guard once the reply has been written out.
    let guard = if state.sampler.admit(policy.test_probability) {
        Some(DispatchGuard {
            job: Some(CompareJob {
                method: method.clone(),
                target: target.to_string(),
                route: route.to_string(),
                req_headers: parts.headers,
                req_body,
                main_status,
                main_headers: main_headers.clone(),
                main_body: main_body.clone(),
                policy,
            }),
            pool: Arc::clone(&state.pool),
            metrics: Arc::clone(&state.metrics),
            route: route.to_string(),
        })
    } else {
        info!(
            method = %method,
            url = %target,
            route = %route,
            main_status = main_status.as_u16(),
            "request served without test upstream"
        );
        state.metrics.record_upstream(
            main_status.as_str(),
            method.as_str(),
            TEST_UPSTREAM,
            route,
            "skipped_probability",
            None,
        );
        None
    };

    Ok(client_response(
        main_status,
        &main_headers,
        Body::new(ReplyBody {
            data: Some(main_body),
            guard,
        }),
    ))
}

/// Build the client reply from the main upstream's status and headers.
/// Multi-valued headers are emitted as multiple header lines; hop-by-hop
/// headers stay behind the proxy.
fn client_response(status: StatusCode, headers: &HeaderMap, body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    let out = response.headers_mut();
    for (name, value) in headers {
        if !is_hop_by_hop_header(name.as_str()) {
            out.append(name.clone(), value.clone());
        }
    }
    response
}

/// Enqueues a comparison job when dropped.
///
/// The guard rides on the response body, so the drop happens after the
/// server has finished writing the reply, or abandoned it on client
/// disconnect; shadow work proceeds either way.
struct DispatchGuard {
    job: Option<CompareJob>,
    pool: Arc<WorkerPool>,
    metrics: Arc<ProxyMetrics>,
    route: String,
}

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        let Some(job) = self.job.take() else {
            return;
        };
        match self.pool.try_enqueue(job) {
            Ok(()) => {}
            Err(EnqueueError::QueueFull) => {
                warn!(route = %self.route, "comparison queue full, dropping job");
                self.metrics.record_queue_drop();
            }
            Err(EnqueueError::ShuttingDown) => {
                debug!(route = %self.route, "shutting down, dropping comparison job");
            }
        }
    }
}

/// Buffered reply body carrying the dispatch guard. The guard is released
/// at end-of-stream, which orders the comparison job strictly after the
/// client reply.
struct ReplyBody {
    data: Option<Bytes>,
    guard: Option<DispatchGuard>,
}

impl http_body::Body for ReplyBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        match this.data.take() {
            Some(bytes) if !bytes.is_empty() => Poll::Ready(Some(Ok(Frame::data(bytes)))),
            _ => {
                drop(this.guard.take());
                Poll::Ready(None)
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.data.is_none() && self.guard.is_none()
    }

    fn size_hint(&self) -> SizeHint {
        match &self.data {
            Some(bytes) => SizeHint::with_exact(bytes.len() as u64),
            None => SizeHint::with_exact(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_response_preserves_multi_valued_headers() {
        let mut headers = HeaderMap::new();
        headers.append("set-cookie", "a=1".parse().unwrap());
        headers.append("set-cookie", "b=2".parse().unwrap());
        headers.insert("connection", "keep-alive".parse().unwrap());

        let response = client_response(StatusCode::OK, &headers, Body::empty());
        let cookies: Vec<_> = response
            .headers()
            .get_all("set-cookie")
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect();
        assert_eq!(cookies, vec!["a=1", "b=2"]);
        assert!(!response.headers().contains_key("connection"));
    }

    #[tokio::test]
    async fn reply_body_yields_data_then_ends() {
        let body = ReplyBody {
            data: Some(Bytes::from_static(b"hello")),
            guard: None,
        };
        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(collected, Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn empty_reply_body_ends_immediately() {
        let body = ReplyBody {
            data: Some(Bytes::new()),
            guard: None,
        };
        let collected = body.collect().await.unwrap().to_bytes();
        assert!(collected.is_empty());
    }
}

//! Prometheus metrics.
//!
//! All metrics live in one `prometheus_client::Registry` owned by the
//! process and are exposed in OpenMetrics text format on the configured
//! metrics listener. Label sets are typed structs so a label can never be
//! misspelled at a call site.

use std::sync::Arc;

use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Labels for the request counter.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct HttpRequestLabels {
    /// Response status code, or `client_error` for transport failures.
    pub status: String,
    pub method: String,
    /// `main_upstream` or `test_upstream`.
    pub upstream: String,
    pub route: String,
    /// `success`, `error`, `skipped`, or `skipped_probability`.
    pub outcome: String,
}

/// Labels for the upstream duration histogram.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DurationLabels {
    pub method: String,
    pub upstream: String,
    pub route: String,
}

/// Labels for the comparison result counter.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ComparisonLabels {
    pub route: String,
    pub method: String,
    /// `identical`, `status_diff`, `header_diff`, or `body_diff`.
    pub kind: String,
}

/// Labels for the skipped-route counter.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RouteSkipLabels {
    pub route: String,
    pub method: String,
    pub reason: String,
}

/// Labels for the comparison error counter.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ComparisonErrorLabels {
    pub route: String,
    /// `test_upstream`, `body_parse`, or `sink`.
    pub kind: String,
}

/// Upstream round-trip duration buckets in seconds.
const DURATION_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// All proxy metrics, registered against a single registry.
pub struct ProxyMetrics {
    /// `http_request_total`: every upstream call attempt, by outcome.
    pub http_requests: Family<HttpRequestLabels, Counter>,
    /// `http_request_duration_seconds`: upstream round-trip time.
    pub http_request_duration: Family<DurationLabels, Histogram>,
    /// `comparison_results_total`: one increment per finished comparison.
    pub comparison_results: Family<ComparisonLabels, Counter>,
    /// `route_skip_total`: requests served on the skip fast path.
    pub route_skips: Family<RouteSkipLabels, Counter>,
    /// `comparison_errors_total`: shadow-path failures (no log record).
    pub comparison_errors: Family<ComparisonErrorLabels, Counter>,
    /// `worker_queue_dropped_total`: jobs dropped because the queue was full.
    pub queue_dropped: Counter,
}

impl ProxyMetrics {
    /// Create and register all metrics with the given registry.
    pub fn new(registry: &mut Registry) -> Self {
        let http_requests = Family::<HttpRequestLabels, Counter>::default();
        registry.register(
            "http_request",
            "HTTP requests issued to upstreams",
            http_requests.clone(),
        );

        let http_request_duration =
            Family::<DurationLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(DURATION_BUCKETS.iter().copied())
            });
        registry.register(
            "http_request_duration_seconds",
            "Upstream request round-trip time in seconds",
            http_request_duration.clone(),
        );

        let comparison_results = Family::<ComparisonLabels, Counter>::default();
        registry.register(
            "comparison_results",
            "Shadow comparison outcomes by kind",
            comparison_results.clone(),
        );

        let route_skips = Family::<RouteSkipLabels, Counter>::default();
        registry.register(
            "route_skip",
            "Requests served on the skip fast path",
            route_skips.clone(),
        );

        let comparison_errors = Family::<ComparisonErrorLabels, Counter>::default();
        registry.register(
            "comparison_errors",
            "Shadow-path failures that produced no comparison",
            comparison_errors.clone(),
        );

        let queue_dropped = Counter::default();
        registry.register(
            "worker_queue_dropped",
            "Comparison jobs dropped because the worker queue was full",
            queue_dropped.clone(),
        );

        Self {
            http_requests,
            http_request_duration,
            comparison_results,
            route_skips,
            comparison_errors,
            queue_dropped,
        }
    }

    /// Record one upstream call attempt and, when it produced a response,
    /// its round-trip time.
    pub fn record_upstream(
        &self,
        status: &str,
        method: &str,
        upstream: &str,
        route: &str,
        outcome: &str,
        elapsed_secs: Option<f64>,
    ) {
        self.http_requests
            .get_or_create(&HttpRequestLabels {
                status: status.to_string(),
                method: method.to_string(),
                upstream: upstream.to_string(),
                route: route.to_string(),
                outcome: outcome.to_string(),
            })
            .inc();
        if let Some(secs) = elapsed_secs {
            self.http_request_duration
                .get_or_create(&DurationLabels {
                    method: method.to_string(),
                    upstream: upstream.to_string(),
                    route: route.to_string(),
                })
                .observe(secs);
        }
    }

    pub fn record_comparison(&self, route: &str, method: &str, kind: &str) {
        self.comparison_results
            .get_or_create(&ComparisonLabels {
                route: route.to_string(),
                method: method.to_string(),
                kind: kind.to_string(),
            })
            .inc();
    }

    pub fn record_route_skip(&self, route: &str, method: &str, reason: &str) {
        self.route_skips
            .get_or_create(&RouteSkipLabels {
                route: route.to_string(),
                method: method.to_string(),
                reason: reason.to_string(),
            })
            .inc();
    }

    pub fn record_comparison_error(&self, route: &str, kind: &str) {
        self.comparison_errors
            .get_or_create(&ComparisonErrorLabels {
                route: route.to_string(),
                kind: kind.to_string(),
            })
            .inc();
    }

    pub fn record_queue_drop(&self) {
        self.queue_dropped.inc();
    }
}

/// Router serving the OpenMetrics text exposition of a registry.
pub fn metrics_router(registry: Arc<Registry>) -> Router {
    Router::new().route(
        "/metrics",
        get(move || {
            let registry = Arc::clone(&registry);
            async move {
                let mut body = String::new();
                match encode(&mut body, &registry) {
                    Ok(()) => (
                        http::StatusCode::OK,
                        [(
                            http::header::CONTENT_TYPE,
                            "application/openmetrics-text; version=1.0.0; charset=utf-8",
                        )],
                        body,
                    )
                        .into_response(),
                    Err(e) => (
                        http::StatusCode::INTERNAL_SERVER_ERROR,
                        format!("failed to encode metrics: {e}"),
                    )
                        .into_response(),
                }
            }
        }),
    )
}

/// Serve the metrics endpoint until the shutdown token fires.
pub async fn serve_metrics(
    bind: String,
    registry: Arc<Registry>,
    shutdown: CancellationToken,
) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!(bind = %bind, "metrics endpoint started");
    axum::serve(listener, metrics_router(registry))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

//! The comparison job run on workers.
//!
//! A job owns everything it needs: the buffered request body, the buffered
//! main response, and the resolved policy. It replays the request against
//! the test upstream, compares status, then headers, then body (first
//! divergence wins), and writes at most one record to the sink. Jobs run on
//! worker tasks detached from the client connection, so a client disconnect
//! never cancels shadow work.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use tracing::{error, info, warn};

use crate::compare::{self, BodyComparison, ComparisonKind};
use crate::metrics::ProxyMetrics;
use crate::policy::EffectivePolicy;
use crate::storage::{LogRecord, Storage};
use crate::upstream::UpstreamClient;

/// Shared dependencies of all comparison jobs.
pub struct ShadowContext {
    pub test_client: UpstreamClient,
    pub storage: Arc<dyn Storage>,
    pub metrics: Arc<ProxyMetrics>,
}

/// One queued comparison. Ownership of the buffered bodies transfers into
/// the job when it is enqueued; nothing here refers back to handler state.
pub struct CompareJob {
    pub method: Method,
    /// Original request target (path and query), replayed verbatim.
    pub target: String,
    /// Canonical route key, used for metrics and the log record.
    pub route: String,
    /// Original request headers.
    pub req_headers: HeaderMap,
    pub req_body: Bytes,
    pub main_status: StatusCode,
    pub main_headers: HeaderMap,
    pub main_body: Bytes,
    pub policy: Arc<EffectivePolicy>,
}

impl CompareJob {
    /// Replay the request against the test upstream and compare responses.
    pub async fn run(self, ctx: &ShadowContext) {
        let method = self.method.as_str().to_string();

        let test = match ctx
            .test_client
            .send_buffered(&self.method, &self.target, &self.req_headers, self.req_body.clone())
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!(
                    method = %method,
                    url = %self.target,
                    route = %self.route,
                    error = %e,
                    "test upstream request failed"
                );
                ctx.metrics.record_upstream(
                    "client_error",
                    &method,
                    ctx.test_client.name(),
                    &self.route,
                    "error",
                    None,
                );
                ctx.metrics
                    .record_comparison_error(&self.route, "test_upstream");
                return;
            }
        };

        ctx.metrics.record_upstream(
            test.status.as_str(),
            &method,
            ctx.test_client.name(),
            &self.route,
            "success",
            Some(test.elapsed.as_secs_f64()),
        );

        // Status, then headers, then body. First divergence wins.
        if test.status != self.main_status {
            warn!(
                method = %method,
                url = %self.target,
                route = %self.route,
                main_status = self.main_status.as_u16(),
                test_status = test.status.as_u16(),
                "status divergence between upstreams"
            );
            ctx.metrics
                .record_comparison(&self.route, &method, ComparisonKind::StatusDiff.as_str());
            let record = self.record(ComparisonKind::StatusDiff, test.status, None, None);
            self.store(ctx, record).await;
            return;
        }

        if self.policy.compare_headers {
            let different =
                compare::diff_headers(&self.main_headers, &test.headers, &self.policy.skip_headers);
            if !different.is_empty() {
                warn!(
                    method = %method,
                    url = %self.target,
                    route = %self.route,
                    main_status = self.main_status.as_u16(),
                    test_status = test.status.as_u16(),
                    different_headers = ?different,
                    "header divergence between upstreams"
                );
                ctx.metrics.record_comparison(
                    &self.route,
                    &method,
                    ComparisonKind::HeaderDiff.as_str(),
                );
                let bodies = self
                    .policy
                    .store_resp_bodies
                    .then(|| (self.main_body.clone(), test.body.clone()));
                let record =
                    self.record(ComparisonKind::HeaderDiff, test.status, Some(different), bodies);
                self.store(ctx, record).await;
                return;
            }
        }

        if !self.policy.compare_body {
            ctx.metrics
                .record_comparison(&self.route, &method, ComparisonKind::Identical.as_str());
            return;
        }

        let content_type = self
            .main_headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");

        match compare::compare_bodies(
            content_type,
            &self.main_body,
            &test.body,
            &self.policy.skip_json_paths,
        ) {
            BodyComparison::Equal => {
                info!(
                    method = %method,
                    url = %self.target,
                    route = %self.route,
                    main_status = self.main_status.as_u16(),
                    test_status = test.status.as_u16(),
                    "responses identical"
                );
                ctx.metrics
                    .record_comparison(&self.route, &method, ComparisonKind::Identical.as_str());
            }
            BodyComparison::Inconclusive => {
                error!(
                    method = %method,
                    url = %self.target,
                    route = %self.route,
                    "response body is not valid JSON, skipping body comparison"
                );
                ctx.metrics
                    .record_comparison_error(&self.route, "body_parse");
            }
            BodyComparison::Different => {
                warn!(
                    method = %method,
                    url = %self.target,
                    route = %self.route,
                    main_status = self.main_status.as_u16(),
                    test_status = test.status.as_u16(),
                    "body divergence between upstreams"
                );
                ctx.metrics
                    .record_comparison(&self.route, &method, ComparisonKind::BodyDiff.as_str());
                let bodies = self
                    .policy
                    .store_resp_bodies
                    .then(|| (self.main_body.clone(), test.body.clone()));
                let record = self.record(ComparisonKind::BodyDiff, test.status, None, bodies);
                self.store(ctx, record).await;
            }
        }
    }

    /// Build the sink record for a divergence of the given kind. Body fields
    /// are attached only where the policy allows.
    fn record(
        &self,
        kind: ComparisonKind,
        test_status: StatusCode,
        different_headers: Option<Vec<String>>,
        response_bodies: Option<(Bytes, Bytes)>,
    ) -> LogRecord {
        let request_body = self
            .policy
            .store_req_body
            .then(|| String::from_utf8_lossy(&self.req_body).into_owned());

        let (main_response_body, test_response_body) = match response_bodies {
            Some((main, test)) => (
                Some(String::from_utf8_lossy(&main).into_owned()),
                Some(String::from_utf8_lossy(&test).into_owned()),
            ),
            None => (None, None),
        };

        LogRecord {
            url: self.target.clone(),
            method: self.method.as_str().to_string(),
            route: self.route.clone(),
            headers: header_map_to_btree(&self.req_headers),
            request_body,
            main_status: self.main_status.as_u16(),
            test_status: test_status.as_u16(),
            main_response_body,
            test_response_body,
            comparison_type: kind.as_str().to_string(),
            different_headers,
        }
    }

    async fn store(&self, ctx: &ShadowContext, record: LogRecord) {
        if let Err(e) = ctx.storage.store(record).await {
            error!(
                route = %self.route,
                error = %e,
                "failed to store divergence record"
            );
            ctx.metrics.record_comparison_error(&self.route, "sink");
        }
    }
}

/// Flatten a header map into a deterministic name -> values mapping for the
/// log record.
fn header_map_to_btree(headers: &HeaderMap) -> BTreeMap<String, Vec<String>> {
    let mut map = BTreeMap::new();
    for name in headers.keys() {
        let values = headers
            .get_all(name)
            .iter()
            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
            .collect();
        map.insert(name.as_str().to_string(), values);
    }
    map
}

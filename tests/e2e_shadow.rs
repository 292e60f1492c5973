//! End-to-end scenarios: a full proxy wired to two mock upstreams and an
//! in-memory sink.

mod helpers;

use std::net::SocketAddr;
use std::sync::Arc;

use prometheus_client::registry::Registry;
use shadowgate::config::Config;
use shadowgate::metrics::ProxyMetrics;
use shadowgate::policy::RouteTable;
use shadowgate::proxy::ProxyApp;

use helpers::{wait_for, MemoryStorage, MockResponse, MockUpstream};

struct TestProxy {
    addr: SocketAddr,
    storage: MemoryStorage,
    registry: Arc<Registry>,
}

impl TestProxy {
    fn url(&self, target: &str) -> String {
        format!("http://{}{}", self.addr, target)
    }

    fn metrics_text(&self) -> String {
        let mut text = String::new();
        prometheus_client::encoding::text::encode(&mut text, &self.registry).unwrap();
        text
    }
}

/// Assemble and serve a proxy against the given upstream addresses, with
/// extra top-level YAML appended to the base configuration.
async fn start_proxy(main: SocketAddr, test: SocketAddr, extra_yaml: &str) -> TestProxy {
    let yaml = format!(
        "upstreams:\n  main:\n    address: \"http://{main}\"\n  test:\n    address: \"http://{test}\"\nworker:\n  count: 2\n  queue_size: 64\n{extra_yaml}"
    );
    let config: Config = serde_yaml::from_str(&yaml).unwrap();
    shadowgate::config::validate(&config).unwrap();

    let mut registry = Registry::default();
    let metrics = Arc::new(ProxyMetrics::new(&mut registry));
    let registry = Arc::new(registry);

    let storage = MemoryStorage::new();
    let table = RouteTable::build(&config).unwrap();
    let app = ProxyApp::new(&config, table, Arc::new(storage.clone()), metrics).unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app.router).await.unwrap();
    });

    TestProxy {
        addr,
        storage,
        registry,
    }
}

/// An address nothing is listening on.
async fn dead_addr() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

#[tokio::test]
async fn identical_responses_emit_metric_only() {
    let body = r#"{"x":1}"#;
    let (main_addr, _main) = MockUpstream::new()
        .with_response("/a", MockResponse::json(200, body))
        .start()
        .await;
    let (test_addr, test) = MockUpstream::new()
        .with_response("/a", MockResponse::json(200, body))
        .start()
        .await;

    // The two mock servers stamp their own `date` headers; keep those out
    // of the comparison.
    let proxy = start_proxy(
        main_addr,
        test_addr,
        "global_config:\n  skip_headers: [\"Date\"]\nroute_configs:\n  \"POST:/a\":\n    store_req_body: enable\n",
    )
    .await;

    let response = reqwest::Client::new()
        .post(proxy.url("/a"))
        .body(r#"{"x":1}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), body);

    wait_for(|| test.request_count() == 1, "test upstream replay").await;
    wait_for(
        || proxy.metrics_text().contains("kind=\"identical\""),
        "identical comparison metric",
    )
    .await;
    assert!(proxy.storage.records().is_empty());
}

#[tokio::test]
async fn status_divergence_is_recorded() {
    let (main_addr, _main) = MockUpstream::new()
        .with_response("/a", MockResponse::json(200, r#"{"x":1}"#))
        .start()
        .await;
    let (test_addr, _test) = MockUpstream::new()
        .with_response("/a", MockResponse::json(500, r#"{"error":"boom"}"#))
        .start()
        .await;

    let proxy = start_proxy(
        main_addr,
        test_addr,
        "route_configs:\n  \"POST:/a\":\n    store_req_body: enable\n",
    )
    .await;

    let response = reqwest::Client::new()
        .post(proxy.url("/a"))
        .body(r#"{"x":1}"#)
        .send()
        .await
        .unwrap();
    // The client always sees the main upstream's answer.
    assert_eq!(response.status(), 200);

    wait_for(|| !proxy.storage.records().is_empty(), "divergence record").await;
    let records = proxy.storage.records();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.comparison_type, "status_diff");
    assert_eq!(record.main_status, 200);
    assert_eq!(record.test_status, 500);
    assert_eq!(record.request_body.as_deref(), Some(r#"{"x":1}"#));
    // Status divergence never attaches response bodies.
    assert!(record.main_response_body.is_none());
    assert!(record.test_response_body.is_none());
    assert_eq!(record.route, "POST:/a");
}

#[tokio::test]
async fn skipped_headers_do_not_count_as_divergence() {
    let (main_addr, _main) = MockUpstream::new()
        .with_response(
            "/h",
            MockResponse::json(200, "{}")
                .with_header("date", "Mon, 01 Jan 2025 00:00:00 GMT")
                .with_header("x-trace", "m")
                .with_header("etag", "v1"),
        )
        .start()
        .await;
    let (test_addr, _test) = MockUpstream::new()
        .with_response(
            "/h",
            MockResponse::json(200, "{}")
                .with_header("date", "Tue, 02 Jan 2025 00:00:00 GMT")
                .with_header("x-trace", "n")
                .with_header("etag", "v2"),
        )
        .start()
        .await;

    let proxy = start_proxy(
        main_addr,
        test_addr,
        "global_config:\n  skip_headers: [\"Date\", \"X-Trace\"]\n  store_resp_bodies: false\n",
    )
    .await;

    reqwest::get(proxy.url("/h")).await.unwrap();

    wait_for(|| !proxy.storage.records().is_empty(), "divergence record").await;
    let records = proxy.storage.records();
    let record = &records[0];
    assert_eq!(record.comparison_type, "header_diff");
    assert_eq!(record.different_headers.as_deref(), Some(&["etag".to_string()][..]));
    assert!(record.main_response_body.is_none());
}

#[tokio::test]
async fn json_path_mask_hides_volatile_fields() {
    let (main_addr, _main) = MockUpstream::new()
        .with_response("/v", MockResponse::json(200, r#"{"v":1,"ts":"2025-01-01"}"#))
        .start()
        .await;
    let (test_addr, test) = MockUpstream::new()
        .with_response("/v", MockResponse::json(200, r#"{"v":1,"ts":"2025-02-02"}"#))
        .start()
        .await;

    let proxy = start_proxy(
        main_addr,
        test_addr,
        "global_config:\n  skip_headers: [\"Date\"]\n  skip_json_paths: [\"ts\"]\n",
    )
    .await;

    reqwest::get(proxy.url("/v")).await.unwrap();

    wait_for(|| test.request_count() == 1, "test upstream replay").await;
    wait_for(
        || proxy.metrics_text().contains("kind=\"identical\""),
        "identical comparison metric",
    )
    .await;
    assert!(proxy.storage.records().is_empty());
}

#[tokio::test]
async fn body_divergence_attaches_bodies_per_policy() {
    let (main_addr, _main) = MockUpstream::new()
        .with_response("/b", MockResponse::json(200, r#"{"v":1}"#))
        .start()
        .await;
    let (test_addr, _test) = MockUpstream::new()
        .with_response("/b", MockResponse::json(200, r#"{"v":2}"#))
        .start()
        .await;

    let proxy = start_proxy(
        main_addr,
        test_addr,
        "global_config:\n  skip_headers: [\"Date\"]\n",
    )
    .await;

    reqwest::get(proxy.url("/b")).await.unwrap();

    wait_for(|| !proxy.storage.records().is_empty(), "divergence record").await;
    let records = proxy.storage.records();
    let record = &records[0];
    assert_eq!(record.comparison_type, "body_diff");
    // store_resp_bodies defaults to true, store_req_body to false.
    assert_eq!(record.main_response_body.as_deref(), Some(r#"{"v":1}"#));
    assert_eq!(record.test_response_body.as_deref(), Some(r#"{"v":2}"#));
    assert!(record.request_body.is_none());
}

#[tokio::test]
async fn skip_routes_bypass_shadow_testing() {
    let (main_addr, main) = MockUpstream::new()
        .with_response("/healthz", MockResponse::new(200).with_body(b"ok"))
        .start()
        .await;
    let (test_addr, test) = MockUpstream::new().start().await;

    let proxy = start_proxy(main_addr, test_addr, "skip_routes:\n  - \"GET:/healthz\"\n").await;

    let response = reqwest::get(proxy.url("/healthz")).await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "ok");

    wait_for(|| main.request_count() == 1, "main upstream call").await;
    wait_for(
        || proxy.metrics_text().contains("route_skip_total"),
        "route skip metric",
    )
    .await;

    // The shadow pipeline never runs for skipped routes.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert_eq!(test.request_count(), 0);
    assert!(proxy.storage.records().is_empty());
}

#[tokio::test]
async fn zero_probability_sends_no_shadow_traffic() {
    let (main_addr, main) = MockUpstream::new().start().await;
    let (test_addr, test) = MockUpstream::new().start().await;

    let proxy = start_proxy(
        main_addr,
        test_addr,
        "global_config:\n  test_probability: 0\n",
    )
    .await;

    for _ in 0..5 {
        reqwest::get(proxy.url("/x")).await.unwrap();
    }

    wait_for(|| main.request_count() == 5, "main upstream calls").await;
    wait_for(
        || proxy.metrics_text().contains("outcome=\"skipped_probability\""),
        "probability skip metric",
    )
    .await;

    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert_eq!(test.request_count(), 0);
}

#[tokio::test]
async fn oversized_request_body_is_rejected() {
    let (main_addr, main) = MockUpstream::new().start().await;
    let (test_addr, _test) = MockUpstream::new().start().await;

    let proxy = start_proxy(
        main_addr,
        test_addr,
        "limits:\n  max_request_body_bytes: 16\n",
    )
    .await;

    let response = reqwest::Client::new()
        .post(proxy.url("/big"))
        .body(vec![b'x'; 64])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 413);
    assert_eq!(main.request_count(), 0);
}

#[tokio::test]
async fn multi_valued_headers_relayed_as_multiple_lines() {
    let (main_addr, _main) = MockUpstream::new()
        .with_response(
            "/cookies",
            MockResponse::new(200)
                .with_header("set-cookie", "a=1")
                .with_header("set-cookie", "b=2"),
        )
        .start()
        .await;
    let (test_addr, _test) = MockUpstream::new().start().await;

    let proxy = start_proxy(main_addr, test_addr, "").await;

    let response = reqwest::get(proxy.url("/cookies")).await.unwrap();
    let cookies: Vec<_> = response
        .headers()
        .get_all("set-cookie")
        .iter()
        .map(|v| v.to_str().unwrap().to_string())
        .collect();
    assert_eq!(cookies, vec!["a=1", "b=2"]);
}

#[tokio::test]
async fn main_upstream_failure_returns_502_without_shadow() {
    let main_addr = dead_addr().await;
    let (test_addr, test) = MockUpstream::new().start().await;

    let proxy = start_proxy(main_addr, test_addr, "").await;

    let response = reqwest::get(proxy.url("/down")).await.unwrap();
    assert_eq!(response.status(), 502);

    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert_eq!(test.request_count(), 0);
    assert!(proxy.storage.records().is_empty());
}

#[tokio::test]
async fn request_is_replayed_verbatim_to_test_upstream() {
    let body = r#"{"order":42}"#;
    let (main_addr, _main) = MockUpstream::new()
        .with_response("/orders", MockResponse::json(201, r#"{"id":1}"#))
        .start()
        .await;
    let (test_addr, test) = MockUpstream::new()
        .with_response("/orders", MockResponse::json(201, r#"{"id":1}"#))
        .start()
        .await;

    let proxy = start_proxy(main_addr, test_addr, "").await;

    reqwest::Client::new()
        .post(proxy.url("/orders?source=web"))
        .body(body)
        .send()
        .await
        .unwrap();

    wait_for(|| test.request_count() == 1, "test upstream replay").await;
    let replayed = test.last_request().unwrap();
    assert_eq!(replayed.method, "POST");
    assert_eq!(replayed.target, "/orders?source=web");
    assert_eq!(replayed.body, body.as_bytes());
}

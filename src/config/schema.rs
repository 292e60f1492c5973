//! Configuration schema.
//!
//! The configuration file is declarative YAML loaded once at startup. Route
//! policies come in two shapes: [`GlobalPolicy`] with concrete defaults, and
//! [`RouteOverride`] whose boolean fields are tri-valued so that "not set"
//! stays distinguishable from "set to false". Overrides are resolved against
//! the global policy exactly once at load time (see [`crate::policy`]).

use indexmap::IndexMap;
use serde::Deserialize;

/// Top-level configuration for the proxy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Listen address for the proxy itself.
    pub bind: String,
    /// Log level: one of `debug`, `info`, `warn`, `error`, `fatal`.
    pub log_level: String,
    /// Divergence sink backend.
    pub storage_type: StorageType,
    pub elasticsearch: ElasticsearchConfig,
    pub upstreams: Upstreams,
    pub worker: WorkerConfig,
    pub metrics: MetricsConfig,
    pub limits: LimitsConfig,

    /// Global policy defaults applied to every route.
    pub global_config: GlobalPolicy,
    /// Per-route overrides, keyed by route pattern (`METHOD:PATH`).
    /// Mapping order is the lookup order; operators sequence specific
    /// patterns before general ones.
    pub route_configs: IndexMap<String, RouteOverride>,
    /// Route patterns served without any shadow testing.
    pub skip_routes: Vec<String>,

    // Deprecated top-level fields, folded into `global_config` at load time
    // when `global_config` itself was left untouched.
    pub compare_headers: Option<bool>,
    pub test_probability: Option<u8>,
    pub log_response_payload: Option<bool>,
    pub skip_json_paths: Option<Vec<String>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:9090".to_string(),
            log_level: "warn".to_string(),
            storage_type: StorageType::Stdout,
            elasticsearch: ElasticsearchConfig::default(),
            upstreams: Upstreams::default(),
            worker: WorkerConfig::default(),
            metrics: MetricsConfig::default(),
            limits: LimitsConfig::default(),
            global_config: GlobalPolicy::default(),
            route_configs: IndexMap::new(),
            skip_routes: Vec::new(),
            compare_headers: None,
            test_probability: None,
            log_response_payload: None,
            skip_json_paths: None,
        }
    }
}

/// Divergence sink backend selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    Stdout,
    Elasticsearch,
}

/// Elasticsearch connection settings, mirroring the official client options.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ElasticsearchConfig {
    pub addresses: Vec<String>,
    pub username: String,
    pub password: String,
    pub cloud_id: String,
    pub api_key: String,
    pub service_token: String,
    pub certificate_fingerprint: String,
    /// Index divergence records are written to.
    pub index: String,
}

/// The two upstreams the proxy talks to.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Upstreams {
    pub main: Upstream,
    pub test: Upstream,
}

impl Default for Upstreams {
    fn default() -> Self {
        Self {
            main: Upstream {
                address: "http://127.0.0.1:8080".to_string(),
            },
            test: Upstream {
                address: "http://127.0.0.1:8081".to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Upstream {
    /// Base address, scheme included (e.g. `http://orders.internal:8080`).
    pub address: String,
}

/// Comparison worker pool sizing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of long-lived comparison workers.
    pub count: usize,
    /// Capacity of the bounded job queue; a full queue drops jobs.
    pub queue_size: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: 50,
            queue_size: 2048,
        }
    }
}

/// Prometheus exposition endpoint settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub bind: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "0.0.0.0:9001".to_string(),
        }
    }
}

/// Buffered body caps. Requests over the request cap are rejected with 413;
/// responses over the response cap are relayed to the client but excluded
/// from shadow comparison.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_request_body_bytes: usize,
    pub max_response_body_bytes: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_request_body_bytes: 2 * 1024 * 1024,
            max_response_body_bytes: 10 * 1024 * 1024,
        }
    }
}

/// Global comparison policy; every field has a concrete default.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct GlobalPolicy {
    pub compare_headers: bool,
    pub compare_body: bool,
    /// Header names excluded from comparison (case-insensitive).
    pub skip_headers: Vec<String>,
    pub store_req_body: bool,
    pub store_resp_bodies: bool,
    /// Dotted JSON paths masked before body comparison.
    pub skip_json_paths: Vec<String>,
    /// Percentage of requests admitted into the test pipeline, `0..=100`.
    pub test_probability: u8,
}

impl Default for GlobalPolicy {
    fn default() -> Self {
        Self {
            compare_headers: true,
            compare_body: true,
            skip_headers: Vec::new(),
            store_req_body: false,
            store_resp_bodies: true,
            skip_json_paths: Vec::new(),
            test_probability: 100,
        }
    }
}

/// Per-route override. Boolean fields are tri-valued ([`Toggle`]); list
/// fields are additive over the global policy; `test_probability: 0` means
/// inherit (use `skip_routes` to disable testing for a route entirely).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RouteOverride {
    pub compare_headers: Toggle,
    pub compare_body: Toggle,
    pub skip_headers: Vec<String>,
    pub store_req_body: Toggle,
    pub store_resp_bodies: Toggle,
    pub skip_json_paths: Vec<String>,
    pub test_probability: u8,
}

/// Tri-valued boolean for route overrides: absent fields inherit the global
/// value, `enable`/`disable` force it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Toggle {
    #[default]
    Inherit,
    Enable,
    Disable,
}

impl Toggle {
    /// Resolve against the inherited global value.
    pub fn resolve(self, inherited: bool) -> bool {
        match self {
            Toggle::Inherit => inherited,
            Toggle::Enable => true,
            Toggle::Disable => false,
        }
    }
}

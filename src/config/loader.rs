//! Configuration loading, legacy migration, and validation.

use std::path::Path;

use super::error::ConfigError;
use super::schema::{Config, GlobalPolicy, StorageType};
use crate::route::RoutePattern;

/// Load, migrate, and validate a configuration file. Any error here is fatal
/// at startup.
pub fn load(path: &Path) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;

    if contents.trim().is_empty() {
        return Err(ConfigError::EmptyFile(path.display().to_string()));
    }

    let mut config: Config = serde_yaml::from_str(&contents)?;
    migrate_legacy(&mut config);
    validate(&config)?;
    Ok(config)
}

/// Fold deprecated top-level fields into `global_config`.
///
/// Legacy fields only apply when `global_config` itself was left at its
/// defaults; an explicitly configured `global_config` wins outright. The
/// default check covers only the fields the legacy surface can shadow
/// (`skip_headers` and `compare_body` have no legacy counterpart and do not
/// mark the global config as explicit).
pub fn migrate_legacy(config: &mut Config) {
    let default = GlobalPolicy::default();
    let global_is_default = config.global_config.compare_headers == default.compare_headers
        && config.global_config.store_req_body == default.store_req_body
        && config.global_config.store_resp_bodies == default.store_resp_bodies
        && config.global_config.test_probability == default.test_probability
        && config.global_config.skip_json_paths.len() == default.skip_json_paths.len();
    if !global_is_default {
        return;
    }

    if let Some(compare_headers) = config.compare_headers {
        config.global_config.compare_headers = compare_headers;
    }
    if let Some(probability) = config.test_probability {
        if probability > 0 {
            config.global_config.test_probability = probability;
        }
    }
    if let Some(store_resp_bodies) = config.log_response_payload {
        config.global_config.store_resp_bodies = store_resp_bodies;
    }
    if let Some(paths) = &config.skip_json_paths {
        if !paths.is_empty() {
            config.global_config.skip_json_paths = paths.clone();
        }
    }
}

/// Validate the configuration. Route patterns are compiled again later when
/// the route table is built; compiling here keeps pattern errors at startup
/// with their config context attached.
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    parse_log_level(&config.log_level)?;

    for (name, upstream) in [
        ("main", &config.upstreams.main),
        ("test", &config.upstreams.test),
    ] {
        if upstream.address.is_empty() {
            return Err(ConfigError::InvalidUpstream {
                upstream: name,
                address: upstream.address.clone(),
                reason: "address must not be empty",
            });
        }
        if !upstream.address.starts_with("http://") && !upstream.address.starts_with("https://") {
            return Err(ConfigError::InvalidUpstream {
                upstream: name,
                address: upstream.address.clone(),
                reason: "address must be an absolute http:// or https:// URL",
            });
        }
    }

    if config.worker.count == 0 {
        return Err(ConfigError::InvalidWorker { field: "count" });
    }
    if config.worker.queue_size == 0 {
        return Err(ConfigError::InvalidWorker { field: "queue_size" });
    }

    if config.global_config.test_probability > 100 {
        return Err(ConfigError::InvalidProbability {
            scope: "global_config".to_string(),
            value: config.global_config.test_probability,
        });
    }

    for pattern in &config.skip_routes {
        RoutePattern::compile(pattern).map_err(|reason| ConfigError::InvalidRoutePattern {
            context: "skip_routes",
            pattern: pattern.clone(),
            reason,
        })?;
    }

    for (pattern, route_override) in &config.route_configs {
        RoutePattern::compile(pattern).map_err(|reason| ConfigError::InvalidRoutePattern {
            context: "route_configs",
            pattern: pattern.clone(),
            reason,
        })?;
        if route_override.test_probability > 100 {
            return Err(ConfigError::InvalidProbability {
                scope: pattern.clone(),
                value: route_override.test_probability,
            });
        }
    }

    if config.storage_type == StorageType::Elasticsearch
        && config.elasticsearch.addresses.is_empty()
        && config.elasticsearch.cloud_id.is_empty()
    {
        return Err(ConfigError::ElasticsearchUnconfigured);
    }

    Ok(())
}

/// Map the configured log level to a `tracing` filter directive. `fatal` has
/// no tracing equivalent and maps to `error`.
pub fn parse_log_level(level: &str) -> Result<&'static str, ConfigError> {
    match level.to_lowercase().as_str() {
        "debug" => Ok("debug"),
        "info" => Ok("info"),
        "warn" | "warning" => Ok("warn"),
        "error" | "fatal" => Ok("error"),
        other => Err(ConfigError::InvalidLogLevel(other.to_string())),
    }
}

//! Configuration error types.

use thiserror::Error;

/// Configuration loading and validation errors. All of these are fatal at
/// startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// I/O error reading the config file.
    #[error("failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Empty configuration file.
    #[error("configuration file '{0}' is empty")]
    EmptyFile(String),

    /// YAML parsing error.
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// Unknown log level token.
    #[error("invalid log level '{0}': supported levels are debug, info, warn, error, fatal")]
    InvalidLogLevel(String),

    /// Upstream address missing or not an absolute http(s) URL.
    #[error("upstream '{upstream}' address '{address}' is invalid: {reason}")]
    InvalidUpstream {
        upstream: &'static str,
        address: String,
        reason: &'static str,
    },

    /// Malformed route pattern in `route_configs` or `skip_routes`.
    #[error("invalid route pattern in {context}: '{pattern}': {reason}")]
    InvalidRoutePattern {
        context: &'static str,
        pattern: String,
        reason: String,
    },

    /// Probability outside `[0, 100]`.
    #[error("test_probability {value} for '{scope}' is out of range (0..=100)")]
    InvalidProbability { scope: String, value: u8 },

    /// Worker pool sized to zero.
    #[error("worker.{field} must be at least 1")]
    InvalidWorker { field: &'static str },

    /// Elasticsearch selected but no way to reach a cluster.
    #[error("elasticsearch storage selected but neither addresses nor cloud_id configured")]
    ElasticsearchUnconfigured,
}

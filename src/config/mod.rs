//! Configuration: YAML schema, loading, legacy migration, and validation.

mod error;
mod loader;
mod schema;

pub use error::ConfigError;
pub use loader::{load, migrate_legacy, parse_log_level, validate};
pub use schema::{
    Config, ElasticsearchConfig, GlobalPolicy, LimitsConfig, MetricsConfig, RouteOverride,
    StorageType, Toggle, Upstream, Upstreams, WorkerConfig,
};

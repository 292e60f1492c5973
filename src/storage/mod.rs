//! Divergence record sinks.
//!
//! A sink is a single operation: [`Storage::store`]. Two backends ship with
//! the proxy (line-delimited JSON on stdout, Elasticsearch); adding another
//! means implementing `store` for it. Sinks are called from comparison
//! workers and must be safe for concurrent use.

mod elastic;
mod stdout;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

pub use elastic::ElasticStorage;
pub use stdout::StdoutStorage;

/// A divergence record as written to the sink. Body fields are omitted from
/// the wire format entirely (not serialized as null) when the route policy
/// disallows storing them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogRecord {
    pub url: String,
    pub method: String,
    pub route: String,
    /// Original request headers.
    pub headers: BTreeMap<String, Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_body: Option<String>,
    pub main_status: u16,
    pub test_status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub main_response_body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_response_body: Option<String>,
    /// One of `status_diff`, `header_diff`, `body_diff`.
    pub comparison_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub different_headers: Option<Vec<String>>,
}

/// Sink errors. Store failures are logged and counted by the caller; they
/// never interrupt comparison work.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to serialize record: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to write record: {0}")]
    Write(#[from] std::io::Error),

    #[error("elasticsearch request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("elasticsearch returned {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("invalid elasticsearch configuration: {0}")]
    InvalidConfig(String),
}

/// Uniform interface over log storage backends.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn store(&self, record: LogRecord) -> Result<(), StorageError>;
}

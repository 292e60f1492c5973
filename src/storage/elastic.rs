//! Elasticsearch sink.
//!
//! One document per record, indexed over the cluster's HTTP API. The client
//! pings the cluster at construction time so a misconfigured sink fails the
//! process at startup instead of silently dropping records later.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use base64::Engine;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use tracing::{debug, info};

use super::{LogRecord, Storage, StorageError};
use crate::config::ElasticsearchConfig;

/// Default index when the configuration leaves it unset.
const DEFAULT_INDEX: &str = "shadowgate";

/// Elasticsearch-backed sink. Safe for concurrent use; requests round-robin
/// over the configured node addresses.
pub struct ElasticStorage {
    client: reqwest::Client,
    nodes: Vec<String>,
    next_node: AtomicUsize,
    index: String,
}

impl ElasticStorage {
    /// Build the sink and verify cluster connectivity. Errors here are fatal
    /// at startup.
    pub async fn connect(config: &ElasticsearchConfig) -> Result<Self, StorageError> {
        if !config.certificate_fingerprint.is_empty() {
            // The reqwest transport has no fingerprint pinning; refusing the
            // option beats accepting it and not enforcing it.
            return Err(StorageError::InvalidConfig(
                "certificate_fingerprint is not supported by this transport".to_string(),
            ));
        }

        let nodes = if !config.cloud_id.is_empty() {
            vec![cloud_id_to_url(&config.cloud_id)?]
        } else if !config.addresses.is_empty() {
            config
                .addresses
                .iter()
                .map(|a| a.trim_end_matches('/').to_string())
                .collect()
        } else {
            return Err(StorageError::InvalidConfig(
                "neither addresses nor cloud_id configured".to_string(),
            ));
        };

        let mut headers = HeaderMap::new();
        if let Some(auth) = auth_header(config)? {
            headers.insert(AUTHORIZATION, auth);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()?;

        let index = if config.index.is_empty() {
            DEFAULT_INDEX.to_string()
        } else {
            config.index.clone()
        };

        let storage = Self {
            client,
            nodes,
            next_node: AtomicUsize::new(0),
            index,
        };
        storage.ping().await?;
        info!(index = %storage.index, nodes = storage.nodes.len(), "connected to Elasticsearch");
        Ok(storage)
    }

    fn node(&self) -> &str {
        let i = self.next_node.fetch_add(1, Ordering::Relaxed);
        &self.nodes[i % self.nodes.len()]
    }

    async fn ping(&self) -> Result<(), StorageError> {
        let url = format!("{}/", self.node());
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(StorageError::Rejected { status, body });
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for ElasticStorage {
    async fn store(&self, record: LogRecord) -> Result<(), StorageError> {
        let url = format!("{}/{}/_doc", self.node(), self.index);
        let response = self.client.post(&url).json(&record).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StorageError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        debug!(index = %self.index, "stored divergence record");
        Ok(())
    }
}

/// Build the `Authorization` header from the configured credentials.
/// Precedence follows the official clients: API key, then service token,
/// then basic auth.
fn auth_header(config: &ElasticsearchConfig) -> Result<Option<HeaderValue>, StorageError> {
    let value = if !config.api_key.is_empty() {
        Some(format!("ApiKey {}", config.api_key))
    } else if !config.service_token.is_empty() {
        Some(format!("Bearer {}", config.service_token))
    } else if !config.username.is_empty() {
        let credentials = base64::engine::general_purpose::STANDARD
            .encode(format!("{}:{}", config.username, config.password));
        Some(format!("Basic {credentials}"))
    } else {
        None
    };

    value
        .map(|v| {
            HeaderValue::from_str(&v).map_err(|_| {
                StorageError::InvalidConfig("credentials contain invalid header bytes".to_string())
            })
        })
        .transpose()
}

/// Resolve a `cloud_id` (`label:base64(domain$es_uuid$...)`) to the HTTPS
/// endpoint of the Elasticsearch node it names.
fn cloud_id_to_url(cloud_id: &str) -> Result<String, StorageError> {
    let invalid = || StorageError::InvalidConfig(format!("malformed cloud_id '{cloud_id}'"));

    let (_, encoded) = cloud_id.split_once(':').ok_or_else(invalid)?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|_| invalid())?;
    let decoded = String::from_utf8(decoded).map_err(|_| invalid())?;

    let mut parts = decoded.split('$');
    let domain = parts.next().filter(|s| !s.is_empty()).ok_or_else(invalid)?;
    let es_uuid = parts.next().filter(|s| !s.is_empty()).ok_or_else(invalid)?;

    Ok(format!("https://{es_uuid}.{domain}"))
}

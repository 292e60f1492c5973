//! Shadowgate - shadow-testing HTTP reverse proxy.
//!
//! Startup sequencing: parse flags, load and validate configuration,
//! initialize logging and metrics, connect the divergence sink, build the
//! route table and worker pool, then serve until SIGINT/SIGTERM. Shutdown
//! stops the listener first and then drains in-flight comparison jobs for a
//! grace period.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use prometheus_client::registry::Registry;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use shadowgate::config::{self, Config, StorageType};
use shadowgate::metrics::{self, ProxyMetrics};
use shadowgate::policy::RouteTable;
use shadowgate::proxy::ProxyApp;
use shadowgate::storage::{ElasticStorage, Storage, StdoutStorage};

/// How long in-flight comparison jobs may keep running after the listener
/// has stopped.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(name = "shadowgate", version, about, long_about = None)]
struct Args {
    /// Path of the configuration file.
    #[arg(long, env = "SHADOWGATE_CONFIG")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = config::load(&args.config)?;
    init_tracing(&config)?;

    info!(config = %args.config.display(), "configuration loaded");

    let mut registry = Registry::default();
    let proxy_metrics = Arc::new(ProxyMetrics::new(&mut registry));
    let registry = Arc::new(registry);

    let shutdown = CancellationToken::new();

    if config.metrics.enabled {
        let bind = config.metrics.bind.clone();
        let registry = Arc::clone(&registry);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = metrics::serve_metrics(bind, registry, shutdown).await {
                error!(error = %e, "metrics server error");
            }
        });
    }

    let storage: Arc<dyn Storage> = match config.storage_type {
        StorageType::Stdout => {
            info!("using stdout storage backend");
            Arc::new(StdoutStorage::new())
        }
        StorageType::Elasticsearch => Arc::new(ElasticStorage::connect(&config.elasticsearch).await?),
    };

    let table = RouteTable::build(&config)?;
    let app = ProxyApp::new(&config, table, storage, proxy_metrics)?;

    let listener = tokio::net::TcpListener::bind(&config.bind).await?;
    info!(
        bind = %config.bind,
        main_upstream = %config.upstreams.main.address,
        test_upstream = %config.upstreams.test.address,
        workers = config.worker.count,
        queue_size = config.worker.queue_size,
        "shadowgate starting"
    );

    let serve_shutdown = shutdown.clone();
    axum::serve(listener, app.router)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            serve_shutdown.cancel();
        })
        .await?;

    info!(
        drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
        "listener stopped, draining comparison workers"
    );

    if app.pool.shutdown(DRAIN_TIMEOUT).await {
        info!("shutdown complete");
        Ok(())
    } else {
        Err("comparison workers did not drain within the grace period".into())
    }
}

/// Initialize the JSON tracing subscriber. `RUST_LOG` overrides the
/// configured level when set.
fn init_tracing(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let level = config::parse_log_level(&config.log_level)?;
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::fmt().json().with_env_filter(filter).init();
    Ok(())
}

/// Resolves when SIGINT (Ctrl+C) or SIGTERM is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for SIGINT");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received SIGINT, shutting down"),
        () = terminate => info!("received SIGTERM, shutting down"),
    }
}

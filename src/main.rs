//! Upload host: accepts multipart uploads over HTTP and stores every file
//! part in Azure Blob Storage.
//!
//! SIGTERM/SIGINT stop accepting connections and wait for in-flight
//! uploads, up to `server.shutdown_timeout` seconds.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use azure_upload_engine::config::{Config, LoggingConfig};
use azure_upload_engine::storage::memory::MemoryBlobBackend;
use azure_upload_engine::{AzureBlobEngine, StorageEngine};

/// Command-line arguments for the upload host.
#[derive(Parser, Debug)]
#[command(
    name = "azure-upload",
    version,
    about = "Multipart upload host backed by Azure Blob Storage"
)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "azure-upload.example.yaml")]
    config: String,

    /// Override the bind address (host:port).
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = azure_upload_engine::config::load_config(&cli.config)?;
    init_tracing(&config.logging);
    info!("Loaded configuration from {}", cli.config);

    let bind_addr = cli
        .bind
        .unwrap_or_else(|| format!("{}:{}", config.server.host, config.server.port));

    if config.observability.metrics {
        azure_upload_engine::metrics::init_metrics()?;
        azure_upload_engine::metrics::describe_metrics();
        info!("Prometheus metrics initialized");
    }

    let engine = build_engine(&config)?;

    let state = Arc::new(azure_upload_engine::AppState {
        config: config.clone(),
        engine,
    });

    let app = azure_upload_engine::server::app(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("Upload host listening on {}", bind_addr);

    let shutdown_timeout = Duration::from_secs(config.server.shutdown_timeout);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            // Bound the drain of in-flight uploads.
            tokio::spawn(async move {
                tokio::time::sleep(shutdown_timeout).await;
                warn!(
                    "In-flight requests still running after {:?}, exiting",
                    shutdown_timeout
                );
                std::process::exit(1);
            });
        })
        .await?;

    info!("Upload host shut down");

    Ok(())
}

/// Install the global tracing subscriber. `RUST_LOG` overrides the
/// configured level.
fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.as_str()));

    match logging.format.as_str() {
        "json" => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
        _ => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

/// Build the storage engine for the configured backend.
fn build_engine(config: &Config) -> anyhow::Result<Arc<dyn StorageEngine>> {
    let options = config.storage.engine_options();

    let engine = match config.storage.backend.as_str() {
        "azure" => {
            let engine = AzureBlobEngine::new(options)?;
            info!(
                "Azure storage engine initialized: container={}",
                config.storage.container.as_deref().unwrap_or("<unset>")
            );
            engine
        }
        "memory" => {
            let engine =
                AzureBlobEngine::with_backend(options, Arc::new(MemoryBlobBackend::new()))?;
            info!("In-memory storage engine initialized (blobs are not persisted)");
            engine
        }
        other => anyhow::bail!(
            "unknown storage.backend '{}' (expected 'azure' or 'memory')",
            other
        ),
    };

    Ok(Arc::new(engine))
}

/// Wait for SIGTERM or SIGINT (Ctrl+C), then return to trigger graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT, shutting down");
        },
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        },
    }
}

//! OpenPNM analysis daemon
//!
//! Loads config and topology, starts the sharded ingest pipeline and serves
//! the HTTP/WebSocket API.
//!
//! Usage:
//!   openpnm --config openpnm.toml --topology plant.json --listen 0.0.0.0:8080
//!
//! Environment Variables:
//!   PNM_CONFIG_PATH - Path to TOML config file
//!   PNM_TOPOLOGY_PATH - Topology document (JSON or TOML)
//!   PNM_LISTEN_ADDR - Bind address (default: 0.0.0.0:8080)
//!   RUST_LOG - Log filter (default: openpnm_backend=info,tower_http=info)

use anyhow::{Context, Result};
use clap::Parser;
use dotenv::dotenv;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use openpnm_backend::api;
use openpnm_backend::pnm::{
    refresh_once, spawn_refresh, EventBus, FileTopologySource, PnmConfig, PnmMetrics,
    PnmPipeline, TopologyIndex, TopologySource,
};

#[derive(Parser, Debug)]
#[command(name = "openpnm")]
#[command(about = "Proactive Network Maintenance analysis service")]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, env = "PNM_CONFIG_PATH")]
    config: Option<PathBuf>,

    /// Topology document, overrides topology.source_path
    #[arg(short, long, env = "PNM_TOPOLOGY_PATH")]
    topology: Option<PathBuf>,

    /// HTTP listen address
    #[arg(short, long, env = "PNM_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    listen: SocketAddr,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "openpnm_backend=info,tower_http=info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let args = Args::parse();
    init_tracing(&args.log_level);

    info!("Starting OpenPNM analysis service");

    let mut config = match &args.config {
        Some(path) => {
            info!("Loading config from {}", path.display());
            PnmConfig::load(path)?
        }
        None => PnmConfig::from_env(),
    };
    if let Some(path) = args.topology.clone() {
        config.topology.source_path = Some(path);
    }

    let topology = Arc::new(TopologyIndex::empty());
    let refresh_task = match config.topology.source_path.clone() {
        Some(path) => {
            let source: Arc<dyn TopologySource> = Arc::new(FileTopologySource::new(path.clone()));
            let version = refresh_once(&topology, source.as_ref())
                .await
                .with_context(|| format!("initial topology load from {}", path.display()))?;
            info!(
                version,
                devices = topology.snapshot().device_count(),
                "Topology loaded from {}",
                path.display()
            );
            Some(spawn_refresh(
                topology.clone(),
                source,
                config.topology.refresh_interval,
            ))
        }
        None => {
            warn!("No topology source configured; every sample will be rejected as unknown_device");
            None
        }
    };

    let metrics = Arc::new(PnmMetrics::new());
    let bus = Arc::new(EventBus::new(config.bus.clone(), metrics.clone()));
    let pipeline = PnmPipeline::start(&config, topology, bus, metrics);

    let app = api::create_router(pipeline.clone());

    let listener = TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("binding {}", args.listen))?;
    info!("🚀 API listening on http://{}", args.listen);
    info!("📡 Event stream at ws://{}/api/v1/events", args.listen);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Shutting down pipeline");
    if let Some(task) = refresh_task {
        task.abort();
    }
    pipeline.shutdown().await;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received Ctrl+C, shutting down");
}

fn init_tracing(default_filter: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

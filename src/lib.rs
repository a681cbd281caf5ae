// streamvault - Storage node for stream messages
//
// Wires the bucketed store and the resend strategies into a node, and runs
// it until a shutdown signal arrives. The binary in main.rs only resolves
// configuration and calls `run_with_config`.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use streamvault_config::RuntimeConfig;
use streamvault_storage::MemoryBackend;
use tokio::signal;
use tracing::{info, warn};

mod init;
mod node;

pub use init::init_tracing;
pub use node::{store_config, Node, NodeBuilder};

/// Graceful shutdown handler
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown...");
        },
        _ = terminate => {
            info!("Received SIGTERM, starting graceful shutdown...");
        },
    }
}

/// Entry point with configuration loaded from the usual sources
pub async fn run() -> Result<()> {
    let config = RuntimeConfig::load().context("Failed to load configuration")?;
    run_with_config(config).await
}

/// Runs a standalone node on the in-memory backend until shutdown
pub async fn run_with_config(config: RuntimeConfig) -> Result<()> {
    init_tracing(&config);
    config.validate().context("Invalid configuration")?;

    let node = Node::builder(config.clone(), Arc::new(MemoryBackend::new()))
        .build()
        .context("Failed to start node")?;

    let interval_secs = config.node.metrics_interval_secs;
    let report = async {
        if interval_secs == 0 {
            return std::future::pending::<()>().await;
        }
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
        // First tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            log_metrics(&node);
        }
    };

    info!(node_id = %node.id(), "Storage node running, press Ctrl+C or send SIGTERM to stop");
    tokio::select! {
        _ = shutdown_signal() => {},
        _ = report => {},
    }

    log_metrics(&node);
    node.shutdown();
    info!("Shutdown complete");
    Ok(())
}

fn log_metrics(node: &Node) {
    let metrics = node.metrics();
    match serde_json::to_string(&metrics) {
        Ok(snapshot) => info!(
            open_batches = metrics.open_batches,
            pending_batches = metrics.total_batches,
            dropped_batches = metrics.dropped_batches,
            pending_writes = node.store().pending_writes(),
            snapshot = %snapshot,
            "Store metrics"
        ),
        Err(e) => warn!(error = %e, "Failed to serialize store metrics"),
    }
}

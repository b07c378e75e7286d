// src/core/signal.rs

use anyhow::{Result, anyhow};
use tokio::signal::unix::{SignalKind, signal};
use tracing::info;

/// Resolves on the first SIGINT or SIGTERM.
pub async fn shutdown_signal() -> Result<()> {
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| anyhow!("Failed to register SIGINT handler: {}", e))?;
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow!("Failed to register SIGTERM handler: {}", e))?;

    tokio::select! {
        _ = sigint.recv() => info!("SIGINT received, initiating graceful shutdown."),
        _ = sigterm.recv() => info!("SIGTERM received, initiating graceful shutdown."),
    }
    Ok(())
}

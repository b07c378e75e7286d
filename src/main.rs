// src/main.rs

//! The main entry point for the solft client and reference broker.

use anyhow::Result;
use solft::config::Config;
use solft::core::broker;
use solft::core::signal::shutdown_signal;
use solft::{FtConnection, FtEventListener, FtManager};
use std::env;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::filter::EnvFilter;

/// Prints role changes for an operator watching the console.
struct ConsoleListener;

impl FtEventListener for ConsoleListener {
    fn on_active(&self) {
        println!("BECOMING ACTIVE");
    }

    fn on_backup(&self) {
        println!("BECOMING BACKUP");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run_app().await
}

async fn run_app() -> Result<()> {
    // Define version information.
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    // Collect command-line arguments to decide the execution mode.
    let args: Vec<String> = env::args().collect();

    // Handle the --version flag.
    if args.contains(&"--version".to_string()) {
        println!("solft version {VERSION}");
        return Ok(());
    }

    // Check if the --broker flag is present to run the reference broker.
    if args.len() > 1 && args[1] == "--broker" {
        // --- Broker Mode ---

        // Validate that a configuration file path is provided.
        if args.len() != 3 {
            eprintln!("Usage: solft --broker /path/to/broker.toml");
            std::process::exit(1);
        }
        let config_path = &args[2];

        // Initialize logging for broker mode.
        // It defaults to a more verbose level for the broker's own modules.
        let log_level = env::var("RUST_LOG")
            .unwrap_or_else(|_| "info,solft::core::broker=debug".to_string());
        init_tracing(&log_level);

        info!("Starting solft in broker mode...");

        // Run the broker until a shutdown signal arrives.
        if let Err(e) = broker::run(config_path).await {
            error!("Broker runtime error: {}", e);
            return Err(e);
        }
        return Ok(());
    }

    // --- Client Mode ---

    // Both the configuration path and the cluster name are required.
    let (Some(config_path), Some(cluster)) = (args.get(1), args.get(2)) else {
        eprintln!("Usage: solft /path/to/config.toml <cluster-name>");
        eprintln!("       solft --broker /path/to/broker.toml");
        std::process::exit(1);
    };

    // Load the client configuration. Without it there is no broker to join.
    let config = match Config::from_file(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration from \"{config_path}\": {e:#}");
            std::process::exit(1);
        }
    };

    // RUST_LOG takes precedence over the configured log level.
    let log_level = env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone());
    init_tracing(&log_level);

    // Connect and verify the broker supports fault tolerance.
    let connection = match FtConnection::connect(&config.session).await {
        Ok(connection) => connection,
        Err(e) => {
            error!("Failed to establish a fault-tolerant connection: {}", e);
            return Err(e.into());
        }
    };

    // Join the cluster. The console hears BACKUP before this returns.
    let manager = FtManager::new(connection);
    if let Err(e) = manager.start(cluster, Arc::new(ConsoleListener)).await {
        error!("Failed to join cluster '{}': {}", cluster, e);
        return Err(e.into());
    }

    // Hold the membership until SIGINT or SIGTERM, then leave cleanly.
    if let Err(e) = shutdown_signal().await {
        error!("Failed to listen for shutdown signals: {}", e);
    }
    manager.stop().await;
    info!("Shutdown complete.");
    Ok(())
}

/// Sets up logging with compact format and ANSI colors.
fn init_tracing(log_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .compact()
        .with_ansi(true)
        .init();
}

//! metricsd-server
//!
//! Collector: accepts metric updates over HTTP and RPC and stores them.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use metricsd::config::{ConfigManager, ServerOverrides};
use metricsd::server::MetricsServer;
use metricsd::{ShutdownCoordinator, Storage};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// CLI arguments for the collector
#[derive(Parser, Debug)]
#[command(name = "metricsd-server")]
#[command(about = "Runtime metrics collector")]
#[command(version)]
#[command(long_about = "
Runtime metrics collector

Stores gauges and counters reported by agents in memory, a snapshot file or
PostgreSQL, and serves them back over HTTP.

Configuration priority (highest to lowest):
1. Command-line arguments
2. Environment variables
3. Configuration file
4. Built-in defaults

Environment variables:
  ADDRESS            - HTTP listen address (host:port)
  RPC_ADDRESS        - RPC listen address, disabled when unset
  STORE_INTERVAL     - Snapshot interval, 0 syncs on every write
  FILE_STORAGE_PATH  - Snapshot file, empty disables it
  RESTORE            - Load the snapshot at startup (true/false)
  DATABASE_DSN       - PostgreSQL connection string
  TABLE_NAME         - PostgreSQL table
  KEY                - Signing key
  CRYPTO_KEY         - Private key (PEM)
  TRUSTED_SUBNET     - CIDR allowed to report
  CONFIG             - Configuration file
  LOG_LEVEL          - Log level (trace, debug, info, warn, error)
")]
pub struct CliArgs {
    /// Configuration file path
    #[arg(short, long, help = "Path to configuration file")]
    pub config: Option<PathBuf>,

    #[arg(short, long, help = "HTTP listen address (e.g., localhost:8080)")]
    pub address: Option<String>,

    #[arg(short = 'g', long, help = "RPC listen address")]
    pub rpc_address: Option<String>,

    #[arg(short = 'i', long, help = "Store interval (seconds or humantime)")]
    pub store_interval: Option<String>,

    #[arg(short = 'f', long, help = "Snapshot file path, empty to disable")]
    pub file_storage_path: Option<PathBuf>,

    #[arg(short, long, help = "Restore the snapshot at startup")]
    pub restore: Option<bool>,

    #[arg(short = 'd', long, help = "PostgreSQL connection string")]
    pub database_dsn: Option<String>,

    #[arg(long, help = "PostgreSQL table name")]
    pub table_name: Option<String>,

    #[arg(short = 'k', long, help = "Key for verifying payload signatures")]
    pub key: Option<String>,

    #[arg(long, help = "Path to the private key")]
    pub crypto_key: Option<PathBuf>,

    #[arg(short, long, help = "Trusted agent subnet (CIDR)")]
    pub trusted_subnet: Option<String>,

    #[arg(long, help = "Log level")]
    pub log_level: Option<String>,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration and exit")]
    pub validate_config: bool,
}

impl CliArgs {
    fn overrides(&self) -> ServerOverrides {
        ServerOverrides {
            address: self.address.clone(),
            rpc_address: self.rpc_address.clone(),
            store_interval: self.store_interval.clone(),
            file_storage_path: self.file_storage_path.clone(),
            restore: self.restore,
            database_dsn: self.database_dsn.clone(),
            table_name: self.table_name.clone(),
            hash_key: self.key.clone(),
            crypto_key: self.crypto_key.clone(),
            trusted_subnet: self.trusted_subnet.clone(),
            log_level: self.log_level.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    let config_path = ConfigManager::config_path(args.config.as_deref());
    let mut config = ConfigManager::load_server(config_path.as_deref())?;
    config.merge_with_cli_args(args.overrides())?;
    config
        .validate()
        .context("Final configuration validation failed")?;

    init_tracing(&config.log_level)?;

    if args.validate_config {
        info!("Configuration is valid");
        info!("  HTTP address: {}", config.address);
        if let Some(rpc) = &config.rpc_address {
            info!("  RPC address: {}", rpc);
        }
        info!("  Store interval: {:?}", config.storage.store_interval);
        info!(
            "  Trusted subnet: {}",
            config
                .security
                .trusted_subnet
                .map(|net| net.to_string())
                .unwrap_or_else(|| "any".to_string())
        );
        return Ok(());
    }

    info!("Starting metricsd-server v{}", env!("CARGO_PKG_VERSION"));

    let coordinator = ShutdownCoordinator::new(SHUTDOWN_TIMEOUT);
    let storage = Arc::new(
        Storage::open(&config.storage)
            .await
            .context("Failed to open storage")?,
    );
    info!("Storage ready ({} backend)", storage.backend_name());

    let server = MetricsServer::new(config, Arc::clone(&storage))?;
    let mut server_task = tokio::spawn(server.run(coordinator.token()));

    let served = tokio::select! {
        joined = &mut server_task => joined,
        signal = coordinator.listen_for_signals() => {
            if let Err(e) = signal {
                error!("Error setting up signal handlers: {}", e);
                coordinator.trigger();
            }
            info!("Initiating graceful shutdown...");
            match coordinator.drain("Collector server", &mut server_task).await {
                Some(joined) => joined,
                None => {
                    server_task.abort();
                    Ok(Ok(()))
                }
            }
        }
    };

    // Stop the periodic snapshot and write the final one
    coordinator.trigger();
    if let Err(e) = storage.shutdown().await {
        error!("Storage shutdown failed: {}", e);
    }

    served.context("Collector server task failed")??;
    info!("Server shutdown complete");
    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(true),
        )
        .with(env_filter)
        .init();

    Ok(())
}

//! metricsd-agent
//!
//! Samples process and host metrics and reports them to the collector.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use metricsd::agent::Agent;
use metricsd::config::{AgentOverrides, ConfigManager};
use metricsd::ShutdownCoordinator;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// CLI arguments for the agent
#[derive(Parser, Debug)]
#[command(name = "metricsd-agent")]
#[command(about = "Runtime metrics agent")]
#[command(version)]
#[command(long_about = "
Runtime metrics agent

Samples memory and CPU figures every poll interval and reports them to the
collector every report interval.

Configuration priority (highest to lowest):
1. Command-line arguments
2. Environment variables
3. Configuration file
4. Built-in defaults

Environment variables:
  ADDRESS          - Collector address (host:port)
  TRANSPORT        - http or rpc
  POLL_INTERVAL    - Sampling interval (seconds or e.g. 2s)
  REPORT_INTERVAL  - Reporting interval (seconds or e.g. 10s)
  RATE_LIMIT       - Concurrent outbound sends
  KEY              - Signing key
  CRYPTO_KEY       - Collector public key (PEM)
  CONFIG           - Configuration file
  LOG_LEVEL        - Log level (trace, debug, info, warn, error)
")]
pub struct CliArgs {
    /// Configuration file path
    #[arg(short, long, help = "Path to configuration file")]
    pub config: Option<PathBuf>,

    #[arg(short, long, help = "Collector address (e.g., localhost:8080)")]
    pub address: Option<String>,

    #[arg(short, long, help = "Transport: http or rpc")]
    pub transport: Option<String>,

    #[arg(short, long, help = "Poll interval (seconds or humantime)")]
    pub poll_interval: Option<String>,

    #[arg(short, long, help = "Report interval (seconds or humantime)")]
    pub report_interval: Option<String>,

    #[arg(short = 'l', long, help = "Maximum concurrent outbound sends")]
    pub rate_limit: Option<usize>,

    #[arg(short = 'k', long, help = "Key for signing payloads")]
    pub key: Option<String>,

    #[arg(long, help = "Path to the collector public key")]
    pub crypto_key: Option<PathBuf>,

    #[arg(long, help = "Log level")]
    pub log_level: Option<String>,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration and exit")]
    pub validate_config: bool,
}

impl CliArgs {
    fn overrides(&self) -> AgentOverrides {
        AgentOverrides {
            address: self.address.clone(),
            transport: self.transport.clone(),
            poll_interval: self.poll_interval.clone(),
            report_interval: self.report_interval.clone(),
            rate_limit: self.rate_limit,
            hash_key: self.key.clone(),
            crypto_key: self.crypto_key.clone(),
            log_level: self.log_level.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    let config_path = ConfigManager::config_path(args.config.as_deref());
    let mut config = ConfigManager::load_agent(config_path.as_deref())?;
    config.merge_with_cli_args(args.overrides())?;
    config
        .validate()
        .context("Final configuration validation failed")?;

    init_tracing(&config.log_level)?;

    if args.validate_config {
        info!("Configuration is valid");
        info!("  Collector: {} over {}", config.address, config.transport);
        info!("  Poll interval: {:?}", config.poll_interval);
        info!("  Report interval: {:?}", config.report_interval);
        info!("  Rate limit: {}", config.rate_limit);
        return Ok(());
    }

    info!("Starting metricsd-agent v{}", env!("CARGO_PKG_VERSION"));

    let coordinator = ShutdownCoordinator::new(SHUTDOWN_TIMEOUT);
    let agent = Agent::new(config)?;

    let run = agent.run(coordinator.token());
    tokio::pin!(run);

    tokio::select! {
        result = &mut run => return result,
        signal = coordinator.listen_for_signals() => {
            if let Err(e) = signal {
                error!("Error setting up signal handlers: {}", e);
                coordinator.trigger();
            }
        }
    }

    info!("Initiating graceful shutdown...");
    if let Some(result) = coordinator.drain("Agent", run).await {
        result?;
    }

    info!("Agent shutdown complete");
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

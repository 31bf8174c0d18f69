//! Configuration Manager
//!
//! Layers, lowest priority first: built-in defaults, TOML file, environment,
//! command line.

use super::{AgentConfig, ServerConfig};
use crate::storage::postgres::is_valid_table_name;
use crate::Result;
use anyhow::{bail, Context};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::time::Duration;

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Integer seconds, or a humantime string such as `1m30s`
pub fn parse_interval(raw: &str) -> Result<Duration> {
    let raw = raw.trim();
    if let Ok(secs) = raw.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    humantime::parse_duration(raw).with_context(|| format!("Invalid interval: {}", raw))
}

fn non_empty(value: String) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}

/// Manages configuration loading and validation
pub struct ConfigManager;

impl ConfigManager {
    /// Load configuration from file, falling back to defaults when it is absent
    pub fn load_from_file<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
        if path.exists() {
            tracing::info!("Loading configuration from: {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;

            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))
        } else {
            tracing::warn!("Configuration file not found at {}, using defaults", path.display());
            Ok(T::default())
        }
    }

    /// Config file named on the command line, else by `CONFIG`
    pub fn config_path(cli: Option<&Path>) -> Option<PathBuf> {
        cli.map(Path::to_path_buf)
            .or_else(|| std::env::var("CONFIG").ok().and_then(non_empty).map(PathBuf::from))
    }

    /// Defaults, then the config file, then the process environment
    pub fn load_agent(config_path: Option<&Path>) -> Result<AgentConfig> {
        let mut config = match config_path {
            Some(path) => Self::load_from_file(path)?,
            None => AgentConfig::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Defaults, then the config file, then the process environment
    pub fn load_server(config_path: Option<&Path>) -> Result<ServerConfig> {
        let mut config = match config_path {
            Some(path) => Self::load_from_file(path)?,
            None => ServerConfig::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }
}

/// Command-line values for the agent; `None` keeps the lower layer
#[derive(Debug, Default, Clone)]
pub struct AgentOverrides {
    pub address: Option<String>,
    pub transport: Option<String>,
    pub poll_interval: Option<String>,
    pub report_interval: Option<String>,
    pub rate_limit: Option<usize>,
    pub hash_key: Option<String>,
    pub crypto_key: Option<PathBuf>,
    pub log_level: Option<String>,
}

impl AgentConfig {
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let var = |key: &str| lookup(key).and_then(non_empty);

        if let Some(address) = var("ADDRESS") {
            self.address = address;
        }
        if let Some(transport) = var("TRANSPORT") {
            self.transport = transport
                .parse()
                .map_err(anyhow::Error::msg)
                .context("Invalid TRANSPORT")?;
        }
        if let Some(poll) = var("POLL_INTERVAL") {
            self.poll_interval = parse_interval(&poll).context("Invalid POLL_INTERVAL")?;
        }
        if let Some(report) = var("REPORT_INTERVAL") {
            self.report_interval = parse_interval(&report).context("Invalid REPORT_INTERVAL")?;
        }
        if let Some(limit) = var("RATE_LIMIT") {
            self.rate_limit = limit
                .trim()
                .parse()
                .with_context(|| format!("Invalid RATE_LIMIT: {}", limit))?;
        }
        if let Some(key) = var("KEY") {
            self.hash_key = Some(key);
        }
        if let Some(path) = var("CRYPTO_KEY") {
            self.crypto_key = Some(PathBuf::from(path));
        }
        if let Some(level) = var("LOG_LEVEL") {
            self.log_level = level;
        }

        Ok(())
    }

    /// Merge with CLI arguments
    pub fn merge_with_cli_args(&mut self, args: AgentOverrides) -> Result<()> {
        if let Some(address) = args.address {
            tracing::info!("CLI override: address set to {}", address);
            self.address = address;
        }
        if let Some(transport) = args.transport {
            self.transport = transport.parse().map_err(anyhow::Error::msg)?;
            tracing::info!("CLI override: transport set to {}", self.transport);
        }
        if let Some(poll) = args.poll_interval {
            self.poll_interval = parse_interval(&poll)?;
            tracing::info!("CLI override: poll interval set to {:?}", self.poll_interval);
        }
        if let Some(report) = args.report_interval {
            self.report_interval = parse_interval(&report)?;
            tracing::info!("CLI override: report interval set to {:?}", self.report_interval);
        }
        if let Some(limit) = args.rate_limit {
            self.rate_limit = limit;
            tracing::info!("CLI override: rate limit set to {}", limit);
        }
        if let Some(key) = args.hash_key.and_then(non_empty) {
            self.hash_key = Some(key);
            tracing::info!("CLI override: signing key set");
        }
        if let Some(path) = args.crypto_key {
            tracing::info!("CLI override: public key set to {}", path.display());
            self.crypto_key = Some(path);
        }
        if let Some(level) = args.log_level {
            self.log_level = level;
        }

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.address.trim().is_empty() {
            bail!("address must not be empty");
        }
        if self.rate_limit == 0 {
            bail!("rate_limit must be greater than 0");
        }
        if self.poll_interval.is_zero() {
            bail!("poll_interval must be greater than 0");
        }
        if self.report_interval.is_zero() {
            bail!("report_interval must be greater than 0");
        }
        validate_log_level(&self.log_level)
    }
}

/// Command-line values for the collector; `None` keeps the lower layer
#[derive(Debug, Default, Clone)]
pub struct ServerOverrides {
    pub address: Option<String>,
    pub rpc_address: Option<String>,
    pub store_interval: Option<String>,
    pub file_storage_path: Option<PathBuf>,
    pub restore: Option<bool>,
    pub database_dsn: Option<String>,
    pub table_name: Option<String>,
    pub hash_key: Option<String>,
    pub crypto_key: Option<PathBuf>,
    pub trusted_subnet: Option<String>,
    pub log_level: Option<String>,
}

impl ServerConfig {
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let var = |key: &str| lookup(key).and_then(non_empty);

        if let Some(address) = var("ADDRESS") {
            self.address = address;
        }
        if let Some(address) = var("RPC_ADDRESS") {
            self.rpc_address = Some(address);
        }
        if let Some(interval) = var("STORE_INTERVAL") {
            self.storage.store_interval =
                parse_interval(&interval).context("Invalid STORE_INTERVAL")?;
        }
        if let Some(path) = var("FILE_STORAGE_PATH") {
            self.storage.file_storage_path = Some(PathBuf::from(path));
        }
        if let Some(restore) = var("RESTORE") {
            self.storage.restore = restore
                .trim()
                .parse()
                .with_context(|| format!("Invalid RESTORE: {}", restore))?;
        }
        if let Some(dsn) = var("DATABASE_DSN") {
            self.storage.database_dsn = Some(dsn);
        }
        if let Some(table) = var("TABLE_NAME") {
            self.storage.table_name = table;
        }
        if let Some(key) = var("KEY") {
            self.security.hash_key = Some(key);
        }
        if let Some(path) = var("CRYPTO_KEY") {
            self.security.crypto_key = Some(PathBuf::from(path));
        }
        if let Some(cidr) = var("TRUSTED_SUBNET") {
            self.security.trusted_subnet = Some(
                cidr.trim()
                    .parse()
                    .with_context(|| format!("Invalid TRUSTED_SUBNET: {}", cidr))?,
            );
        }
        if let Some(level) = var("LOG_LEVEL") {
            self.log_level = level;
        }

        Ok(())
    }

    /// Merge with CLI arguments
    pub fn merge_with_cli_args(&mut self, args: ServerOverrides) -> Result<()> {
        if let Some(address) = args.address {
            tracing::info!("CLI override: address set to {}", address);
            self.address = address;
        }
        if let Some(address) = args.rpc_address.and_then(non_empty) {
            tracing::info!("CLI override: rpc address set to {}", address);
            self.rpc_address = Some(address);
        }
        if let Some(interval) = args.store_interval {
            self.storage.store_interval = parse_interval(&interval)?;
            tracing::info!("CLI override: store interval set to {:?}", self.storage.store_interval);
        }
        if let Some(path) = args.file_storage_path {
            // An empty path disables the snapshot file
            self.storage.file_storage_path = if path.as_os_str().is_empty() {
                None
            } else {
                Some(path)
            };
        }
        if let Some(restore) = args.restore {
            self.storage.restore = restore;
        }
        if let Some(dsn) = args.database_dsn.and_then(non_empty) {
            self.storage.database_dsn = Some(dsn);
        }
        if let Some(table) = args.table_name {
            self.storage.table_name = table;
        }
        if let Some(key) = args.hash_key.and_then(non_empty) {
            self.security.hash_key = Some(key);
        }
        if let Some(path) = args.crypto_key {
            self.security.crypto_key = Some(path);
        }
        if let Some(cidr) = args.trusted_subnet.and_then(non_empty) {
            self.security.trusted_subnet = Some(
                cidr.trim()
                    .parse()
                    .with_context(|| format!("Invalid trusted subnet: {}", cidr))?,
            );
        }
        if let Some(level) = args.log_level {
            self.log_level = level;
        }

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.address.trim().is_empty() {
            bail!("address must not be empty");
        }
        if self.request_timeout.is_zero() {
            bail!("request_timeout must be greater than 0");
        }
        if !is_valid_table_name(&self.storage.table_name) {
            bail!(
                "storage.table_name {:?} must be a plain SQL identifier",
                self.storage.table_name
            );
        }
        if self.storage.database_dsn.is_none()
            && self.storage.file_storage_path.is_none()
            && self.storage.restore
        {
            tracing::debug!("restore requested without a snapshot file, nothing to restore");
        }
        validate_log_level(&self.log_level)
    }
}

fn validate_log_level(level: &str) -> Result<()> {
    if !LOG_LEVELS.contains(&level) {
        bail!("log_level must be one of: {}", LOG_LEVELS.join(", "));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportKind;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_parse_interval() {
        assert_eq!(parse_interval("10").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_interval("0").unwrap(), Duration::ZERO);
        assert_eq!(parse_interval("1m30s").unwrap(), Duration::from_secs(90));
        assert!(parse_interval("soon").is_err());
    }

    #[test]
    fn test_agent_defaults_valid() {
        let config = AgentConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(2));
        assert_eq!(config.report_interval, Duration::from_secs(10));
        assert_eq!(config.rate_limit, 10);
        config.validate().unwrap();
    }

    #[test]
    fn test_agent_layering() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "address = \"collector:9000\"\nrate_limit = 4\npoll_interval = \"5s\""
        )
        .unwrap();

        let mut config: AgentConfig = ConfigManager::load_from_file(file.path()).unwrap();
        assert_eq!(config.address, "collector:9000");
        assert_eq!(config.rate_limit, 4);
        assert_eq!(config.report_interval, Duration::from_secs(10));

        config
            .apply_env(env(&[("RATE_LIMIT", "7"), ("TRANSPORT", "rpc"), ("KEY", "")]))
            .unwrap();
        assert_eq!(config.rate_limit, 7);
        assert_eq!(config.transport, TransportKind::Rpc);
        assert_eq!(config.hash_key, None);

        config
            .merge_with_cli_args(AgentOverrides {
                rate_limit: Some(2),
                report_interval: Some("3".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(config.rate_limit, 2);
        assert_eq!(config.report_interval, Duration::from_secs(3));
        assert_eq!(config.poll_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_agent_validation() {
        let config = AgentConfig {
            rate_limit: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = AgentConfig {
            log_level: "loud".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let mut config = AgentConfig::default();
        assert!(config.apply_env(env(&[("TRANSPORT", "carrier-pigeon")])).is_err());
    }

    #[test]
    fn test_server_env() {
        let mut config = ServerConfig::default();
        config
            .apply_env(env(&[
                ("STORE_INTERVAL", "0"),
                ("RESTORE", "false"),
                ("TRUSTED_SUBNET", "10.0.0.0/8"),
                ("TABLE_NAME", "samples"),
            ]))
            .unwrap();

        assert_eq!(config.storage.store_interval, Duration::ZERO);
        assert!(!config.storage.restore);
        assert_eq!(
            config.security.trusted_subnet,
            Some("10.0.0.0/8".parse().unwrap())
        );
        config.validate().unwrap();

        assert!(config.apply_env(env(&[("TRUSTED_SUBNET", "nope")])).is_err());
    }

    #[test]
    fn test_server_rejects_bad_table_name() {
        let mut config = ServerConfig::default();
        config
            .merge_with_cli_args(ServerOverrides {
                table_name: Some("metric; drop".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_server_toml_sections() {
        let config: ServerConfig = toml::from_str(
            r#"
            address = "0.0.0.0:8080"
            rpc_address = "0.0.0.0:3200"
            request_timeout = "3s"

            [storage]
            store_interval = "1m"
            restore = false

            [security]
            hash_key = "secret"
            "#,
        )
        .unwrap();

        assert_eq!(config.rpc_address.as_deref(), Some("0.0.0.0:3200"));
        assert_eq!(config.request_timeout, Duration::from_secs(3));
        assert_eq!(config.storage.store_interval, Duration::from_secs(60));
        assert_eq!(
            config.storage.file_storage_path,
            Some(PathBuf::from(crate::config::DEFAULT_FILE_STORAGE_PATH))
        );
        assert_eq!(config.security.hash_key.as_deref(), Some("secret"));
    }
}

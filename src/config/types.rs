//! Configuration Types

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_ADDRESS: &str = "localhost:8080";
pub const DEFAULT_FILE_STORAGE_PATH: &str = "/tmp/metrics-db.json";

/// Wire used by the agent to reach the collector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Http,
    Rpc,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransportKind::Http => "http",
            TransportKind::Rpc => "rpc",
        })
    }
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(TransportKind::Http),
            "rpc" | "grpc" => Ok(TransportKind::Rpc),
            other => Err(format!("unknown transport {:?}, expected http or rpc", other)),
        }
    }
}

/// Agent configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Collector address, `host:port`
    pub address: String,
    pub transport: TransportKind,
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub report_interval: Duration,
    /// Concurrent outbound sends
    pub rate_limit: usize,
    pub hash_key: Option<String>,
    /// Collector public key (PKCS#1 PEM)
    pub crypto_key: Option<PathBuf>,
    pub log_level: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_string(),
            transport: TransportKind::Http,
            poll_interval: Duration::from_secs(2),
            report_interval: Duration::from_secs(10),
            rate_limit: 10,
            hash_key: None,
            crypto_key: None,
            log_level: "info".to_string(),
        }
    }
}

/// Collector configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// HTTP listen address
    pub address: String,
    /// Binary RPC listen address, disabled when absent
    pub rpc_address: Option<String>,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    pub storage: StorageConfig,
    pub security: SecurityConfig,
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_string(),
            rpc_address: None,
            request_timeout: Duration::from_secs(10),
            storage: StorageConfig::default(),
            security: SecurityConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

/// Storage backend selection
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Zero syncs the snapshot after every write
    #[serde(with = "humantime_serde")]
    pub store_interval: Duration,
    /// Snapshot file, no persistence when absent
    pub file_storage_path: Option<PathBuf>,
    pub restore: bool,
    /// Relational backend, used exclusively when set
    pub database_dsn: Option<String>,
    pub table_name: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            store_interval: Duration::from_secs(300),
            file_storage_path: Some(PathBuf::from(DEFAULT_FILE_STORAGE_PATH)),
            restore: true,
            database_dsn: None,
            table_name: crate::storage::postgres::DEFAULT_TABLE.to_string(),
        }
    }
}

/// Request protection material
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub hash_key: Option<String>,
    /// Collector private key (PKCS#1 PEM)
    pub crypto_key: Option<PathBuf>,
    pub trusted_subnet: Option<IpNet>,
}

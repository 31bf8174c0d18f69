//! metricsd Library
//!
//! A runtime metrics agent and the collector it reports to. The agent samples
//! gauges on an interval and ships them over HTTP or a framed binary RPC; the
//! collector folds them into a pluggable repository (memory, snapshot file or
//! PostgreSQL) and serves them back.

pub mod agent;
pub mod config;
pub mod metric;
pub mod retry;
pub mod rpc;
pub mod security;
pub mod server;
pub mod shutdown;
pub mod storage;

pub use config::{AgentConfig, ServerConfig};
pub use metric::{Metric, MetricKind};
pub use shutdown::ShutdownCoordinator;
pub use storage::{Repository, Storage};

/// Common error type for startup and wiring code
pub type Result<T> = anyhow::Result<T>;

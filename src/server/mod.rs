//! Collector server
//!
//! Hosts the HTTP API and, when configured, the binary RPC listener over one
//! [`MetricService`].

pub mod api;
pub mod handlers;
pub mod middleware;
pub mod rpc;
pub mod service;

pub use api::MetricsApi;
pub use handlers::AppState;
pub use rpc::RpcServer;
pub use service::{MetricService, ServiceError};

use crate::config::ServerConfig;
use crate::security::SecurityChain;
use crate::storage::Storage;
use crate::Result;
use anyhow::Context;
use axum::Router;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub struct MetricsServer {
    config: ServerConfig,
    service: MetricService,
    chain: Arc<SecurityChain>,
}

impl MetricsServer {
    pub fn new(config: ServerConfig, storage: Arc<Storage>) -> Result<Self> {
        let chain = SecurityChain::from_settings(
            config.security.trusted_subnet,
            config.security.crypto_key.as_deref(),
            config.security.hash_key.as_deref(),
        )
        .context("Failed to set up request security")?;

        Ok(Self {
            config,
            service: MetricService::new(storage),
            chain: Arc::new(chain),
        })
    }

    pub fn router(&self) -> Router {
        MetricsApi::create_router(
            AppState {
                service: self.service.clone(),
            },
            Arc::clone(&self.chain),
            self.config.request_timeout,
        )
    }

    /// Serve until `shutdown` fires and in-flight requests finish
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let rpc_task = match &self.config.rpc_address {
            Some(addr) => {
                let listener = TcpListener::bind(addr)
                    .await
                    .with_context(|| format!("Failed to bind RPC listener to {}", addr))?;
                let server = RpcServer::new(self.service.clone(), Arc::clone(&self.chain));
                let token = shutdown.clone();
                Some(tokio::spawn(async move {
                    if let Err(e) = server.serve(listener, token).await {
                        error!("RPC server error: {}", e);
                    }
                }))
            }
            None => None,
        };

        let listener = TcpListener::bind(&self.config.address)
            .await
            .with_context(|| format!("Failed to bind HTTP listener to {}", self.config.address))?;
        info!("HTTP API listening on {}", self.config.address);

        let app = self.router();
        let token = shutdown.clone();
        let served = axum::serve(listener, app)
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await;

        if let Some(task) = rpc_task {
            if let Err(e) = task.await {
                error!("RPC server task failed: {}", e);
            }
        }

        served.context("HTTP server error")
    }
}

//! Graceful Shutdown Handling
//!
//! One cancellation token is shared by every loop, worker and listener.
//! SIGTERM, SIGINT and Ctrl-C cancel it.

use crate::Result;
use std::future::Future;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Shutdown coordinator that manages graceful shutdown process
pub struct ShutdownCoordinator {
    token: CancellationToken,
    /// Upper bound on draining once shutdown started
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            timeout,
        }
    }

    /// Token for components to observe; cancelled exactly once
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn trigger(&self) {
        self.token.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Wait for a signal (or a programmatic trigger), then cancel the token
    pub async fn listen_for_signals(&self) -> Result<()> {
        info!("Starting shutdown signal listener");

        #[cfg(unix)]
        {
            let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
            let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, initiating graceful shutdown");
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, initiating graceful shutdown");
                }
                _ = signal::ctrl_c() => {
                    info!("Received Ctrl+C, initiating graceful shutdown");
                }
                _ = self.token.cancelled() => {
                    info!("Shutdown requested");
                }
            }
        }

        #[cfg(not(unix))]
        {
            tokio::select! {
                result = signal::ctrl_c() => {
                    result?;
                    info!("Received Ctrl+C, initiating graceful shutdown");
                }
                _ = self.token.cancelled() => {
                    info!("Shutdown requested");
                }
            }
        }

        self.token.cancel();
        Ok(())
    }

    /// Drive a draining future, giving up after the shutdown timeout
    pub async fn drain<F: Future>(&self, what: &str, fut: F) -> Option<F::Output> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(output) => Some(output),
            Err(_) => {
                warn!("{} did not finish within {:?}", what, self.timeout);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_trigger_releases_listener() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
        let token = coordinator.token();
        assert!(!token.is_cancelled());

        coordinator.trigger();
        coordinator.listen_for_signals().await.unwrap();

        assert!(token.is_cancelled());
        assert!(coordinator.is_shutting_down());
    }

    #[tokio::test]
    async fn test_drain_timeout() {
        let coordinator = ShutdownCoordinator::new(Duration::from_millis(20));

        assert_eq!(coordinator.drain("quick", async { 7 }).await, Some(7));
        assert_eq!(
            coordinator
                .drain("slow", tokio::time::sleep(Duration::from_secs(5)))
                .await,
            None
        );
    }
}

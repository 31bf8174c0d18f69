//! Storage engine
//!
//! A [`Repository`] backend is picked once at startup: the relational
//! backend when a DSN is configured, otherwise the in-memory maps with an
//! optional snapshot file.

pub mod file;
pub mod memory;
pub mod postgres;
pub mod repository;

pub use file::{FileBackedRepository, FileSnapshot};
pub use memory::MemoryRepository;
pub use postgres::PostgresRepository;
pub use repository::{Repository, StorageError};

use crate::config::StorageConfig;
use crate::retry::RetryPolicy;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Uninitialized,
    Restoring,
    Serving,
    Draining,
    Closed,
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Lifecycle::Uninitialized => "uninitialized",
            Lifecycle::Restoring => "restoring",
            Lifecycle::Serving => "serving",
            Lifecycle::Draining => "draining",
            Lifecycle::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    /// No relational backend configured
    NotConfigured,
    Unreachable(String),
    Healthy,
}

enum Backend {
    Memory,
    File {
        snapshot: Arc<FileSnapshot>,
        memory: Arc<dyn Repository>,
        periodic: Mutex<Option<JoinHandle<()>>>,
        cancel: CancellationToken,
    },
    Postgres(Arc<PostgresRepository>),
}

pub struct Storage {
    repository: Arc<dyn Repository>,
    backend: Backend,
    retry: RetryPolicy,
    state: watch::Sender<Lifecycle>,
}

impl Storage {
    /// Build the configured backend and bring it to `Serving`
    ///
    /// A failed restore or an unreachable database is returned as an error;
    /// the caller must not serve in that case.
    pub async fn open(config: &StorageConfig) -> Result<Self, StorageError> {
        Self::open_with_retry(config, RetryPolicy::default()).await
    }

    pub async fn open_with_retry(
        config: &StorageConfig,
        retry: RetryPolicy,
    ) -> Result<Self, StorageError> {
        let (state, _) = watch::channel(Lifecycle::Uninitialized);
        let transition = |next: Lifecycle| {
            info!(state = %next, "Storage lifecycle");
            state.send_replace(next);
        };

        transition(Lifecycle::Restoring);

        let (repository, backend): (Arc<dyn Repository>, Backend) =
            if let Some(dsn) = &config.database_dsn {
                let postgres =
                    Arc::new(PostgresRepository::connect(dsn, &config.table_name, &retry).await?);
                postgres.ping(&retry).await?;
                let repository: Arc<dyn Repository> = postgres.clone();
                (repository, Backend::Postgres(postgres))
            } else if let Some(path) = &config.file_storage_path {
                let memory: Arc<dyn Repository> = Arc::new(MemoryRepository::new());
                let snapshot = Arc::new(FileSnapshot::new(path));

                if config.restore {
                    snapshot.restore(memory.as_ref()).await?;
                } else {
                    info!(path = %path.display(), "Restore disabled, starting empty");
                }

                let sync_on_write = config.store_interval.is_zero();
                let cancel = CancellationToken::new();
                let periodic = (!sync_on_write).then(|| {
                    Arc::clone(&snapshot).spawn_periodic(
                        Arc::clone(&memory),
                        config.store_interval,
                        cancel.clone(),
                    )
                });

                let repository: Arc<dyn Repository> = Arc::new(FileBackedRepository::new(
                    Arc::clone(&memory),
                    Arc::clone(&snapshot),
                    sync_on_write,
                ));
                (
                    repository,
                    Backend::File {
                        snapshot,
                        memory,
                        periodic: Mutex::new(periodic),
                        cancel,
                    },
                )
            } else {
                info!("No persistence configured, metrics live in memory only");
                let repository: Arc<dyn Repository> = Arc::new(MemoryRepository::new());
                (repository, Backend::Memory)
            };

        transition(Lifecycle::Serving);

        Ok(Self {
            repository,
            backend,
            retry,
            state,
        })
    }

    /// Storage over an existing repository, already serving
    pub fn from_repository(repository: Arc<dyn Repository>) -> Self {
        let (state, _) = watch::channel(Lifecycle::Serving);
        Self {
            repository,
            backend: Backend::Memory,
            retry: RetryPolicy::default(),
            state,
        }
    }

    pub fn repository(&self) -> Arc<dyn Repository> {
        Arc::clone(&self.repository)
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *self.state.borrow()
    }

    pub fn backend_name(&self) -> &'static str {
        match self.backend {
            Backend::Memory => "memory",
            Backend::File { .. } => "file",
            Backend::Postgres(_) => "postgres",
        }
    }

    pub async fn health(&self) -> HealthStatus {
        match &self.backend {
            Backend::Postgres(postgres) => match postgres.ping(&self.retry).await {
                Ok(()) => HealthStatus::Healthy,
                Err(e) => {
                    warn!(error = %e, "Database health check failed");
                    HealthStatus::Unreachable(e.to_string())
                }
            },
            _ => HealthStatus::NotConfigured,
        }
    }

    /// Close the backend; only the snapshot pair drains through a final sync
    pub async fn shutdown(&self) -> Result<(), StorageError> {
        if self.lifecycle() == Lifecycle::Closed {
            return Ok(());
        }

        let result = match &self.backend {
            Backend::File {
                snapshot,
                memory,
                periodic,
                cancel,
            } => {
                info!(state = %Lifecycle::Draining, "Storage lifecycle");
                self.state.send_replace(Lifecycle::Draining);

                cancel.cancel();
                if let Some(handle) = periodic.lock().await.take() {
                    if let Err(e) = handle.await {
                        warn!(error = %e, "Periodic snapshot task ended abnormally");
                    }
                }
                match snapshot.sync(memory.as_ref()).await {
                    Ok(records) => {
                        info!(records, path = %snapshot.path().display(), "Final snapshot written");
                        Ok(())
                    }
                    Err(e) => {
                        error!(error = %e, "Final snapshot failed");
                        Err(e)
                    }
                }
            }
            Backend::Postgres(postgres) => {
                postgres.close().await;
                Ok(())
            }
            Backend::Memory => Ok(()),
        };

        info!(state = %Lifecycle::Closed, "Storage lifecycle");
        self.state.send_replace(Lifecycle::Closed);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::Metric;
    use std::time::Duration;
    use tempfile::TempDir;

    fn file_config(dir: &TempDir, store_interval: Duration, restore: bool) -> StorageConfig {
        StorageConfig {
            store_interval,
            file_storage_path: Some(dir.path().join("metrics.json")),
            restore,
            database_dsn: None,
            table_name: "metric".to_string(),
        }
    }

    #[tokio::test]
    async fn test_memory_only() {
        let config = StorageConfig {
            file_storage_path: None,
            ..Default::default()
        };
        let storage = Storage::open(&config).await.unwrap();

        assert_eq!(storage.backend_name(), "memory");
        assert_eq!(storage.lifecycle(), Lifecycle::Serving);
        assert_eq!(storage.health().await, HealthStatus::NotConfigured);

        storage.shutdown().await.unwrap();
        assert_eq!(storage.lifecycle(), Lifecycle::Closed);
    }

    #[tokio::test]
    async fn test_drain_writes_snapshot() {
        let dir = TempDir::new().unwrap();
        let config = file_config(&dir, Duration::from_secs(300), true);

        let storage = Storage::open(&config).await.unwrap();
        assert_eq!(storage.backend_name(), "file");
        storage
            .repository()
            .add_value(&Metric::counter("hits", 9))
            .await
            .unwrap();
        storage.shutdown().await.unwrap();

        let reopened = Storage::open(&config).await.unwrap();
        assert_eq!(
            reopened.repository().get_counter_value("hits").await.unwrap(),
            Some(9)
        );
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_is_fatal() {
        let dir = TempDir::new().unwrap();
        let config = file_config(&dir, Duration::from_secs(300), true);
        std::fs::write(dir.path().join("metrics.json"), "{ not json").unwrap();

        assert!(matches!(
            Storage::open(&config).await,
            Err(StorageError::Snapshot(_))
        ));

        let skip = file_config(&dir, Duration::from_secs(300), false);
        assert!(Storage::open(&skip).await.is_ok());
    }
}

//! File snapshot backend
//!
//! The snapshot is newline-delimited JSON metric records. `sync` rewrites the
//! whole file from repository state, `restore` replays it through `add_value`.

use super::repository::{Repository, StorageError};
use crate::metric::Metric;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

#[derive(Debug)]
pub struct FileSnapshot {
    path: PathBuf,
    /// Serializes restore and sync against each other
    lock: Mutex<()>,
}

impl FileSnapshot {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replay the snapshot into `repository`, returning the number of records applied
    ///
    /// A missing or blank file is a cold start. Records may be separated by
    /// newlines or written back to back.
    #[instrument(skip(self, repository), fields(path = %self.path.display()))]
    pub async fn restore(&self, repository: &dyn Repository) -> Result<usize, StorageError> {
        let _guard = self.lock.lock().await;

        let data = match tokio::fs::read(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No snapshot file, starting empty");
                return Ok(0);
            }
            Err(e) => return Err(e.into()),
        };

        let mut applied = 0;
        for (index, record) in serde_json::Deserializer::from_slice(&data)
            .into_iter::<Metric>()
            .enumerate()
        {
            let metric = record
                .map_err(|e| StorageError::Snapshot(format!("record {}: {}", index + 1, e)))?;
            repository.add_value(&metric).await.map_err(|e| match e {
                StorageError::Validation(err) => {
                    StorageError::Snapshot(format!("record {}: {}", index + 1, err))
                }
                other => other,
            })?;
            applied += 1;
        }

        info!(records = applied, "Restored snapshot");
        Ok(applied)
    }

    /// Rewrite the snapshot from current state, returning the number of records written
    #[instrument(skip(self, repository), fields(path = %self.path.display()))]
    pub async fn sync(&self, repository: &dyn Repository) -> Result<usize, StorageError> {
        let _guard = self.lock.lock().await;

        let gauges = repository.gauges().await?;
        let counters = repository.counters().await?;
        let (buffer, records) = encode(gauges, counters)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let staging = staging_path(&self.path);
        let mut file = tokio::fs::File::create(&staging).await?;
        file.write_all(&buffer).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&staging, &self.path).await?;

        debug!(records, "Snapshot synced");
        Ok(records)
    }

    /// Sync every `interval` until `cancel` fires
    pub fn spawn_periodic(
        self: Arc<Self>,
        repository: Arc<dyn Repository>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.sync(repository.as_ref()).await {
                            error!(error = %e, path = %self.path.display(), "Periodic snapshot sync failed");
                        }
                    }
                }
            }

            debug!("Periodic snapshot task stopped");
        })
    }
}

fn encode(
    gauges: BTreeMap<String, f64>,
    counters: BTreeMap<String, i64>,
) -> Result<(Vec<u8>, usize), StorageError> {
    let records = gauges.len() + counters.len();
    let mut buffer = Vec::with_capacity(records * 48);

    let metrics = gauges
        .into_iter()
        .map(|(id, value)| Metric::gauge(id, value))
        .chain(counters.into_iter().map(|(id, delta)| Metric::counter(id, delta)));

    for metric in metrics {
        serde_json::to_writer(&mut buffer, &metric)
            .map_err(|e| StorageError::Snapshot(e.to_string()))?;
        buffer.push(b'\n');
    }

    Ok((buffer, records))
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Repository decorator that persists through a [`FileSnapshot`]
///
/// With `sync_on_write` every successful write is followed by a sync, and a
/// failed sync fails the write.
pub struct FileBackedRepository {
    inner: Arc<dyn Repository>,
    snapshot: Arc<FileSnapshot>,
    sync_on_write: bool,
}

impl FileBackedRepository {
    pub fn new(inner: Arc<dyn Repository>, snapshot: Arc<FileSnapshot>, sync_on_write: bool) -> Self {
        Self {
            inner,
            snapshot,
            sync_on_write,
        }
    }

    async fn after_write(&self) -> Result<(), StorageError> {
        if self.sync_on_write {
            self.snapshot.sync(self.inner.as_ref()).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Repository for FileBackedRepository {
    async fn add_gauge_value(&self, id: &str, value: f64) -> Result<(), StorageError> {
        self.inner.add_gauge_value(id, value).await?;
        self.after_write().await
    }

    async fn add_counter_value(&self, id: &str, delta: i64) -> Result<(), StorageError> {
        self.inner.add_counter_value(id, delta).await?;
        self.after_write().await
    }

    async fn add_values(&self, metrics: &[Metric]) -> Result<(), StorageError> {
        self.inner.add_values(metrics).await?;
        self.after_write().await
    }

    async fn get_gauge_value(&self, id: &str) -> Result<Option<f64>, StorageError> {
        self.inner.get_gauge_value(id).await
    }

    async fn get_counter_value(&self, id: &str) -> Result<Option<i64>, StorageError> {
        self.inner.get_counter_value(id).await
    }

    async fn gauges(&self) -> Result<BTreeMap<String, f64>, StorageError> {
        self.inner.gauges().await
    }

    async fn counters(&self) -> Result<BTreeMap<String, i64>, StorageError> {
        self.inner.counters().await
    }

    async fn get_values(&self) -> Result<Vec<Metric>, StorageError> {
        self.inner.get_values().await
    }
}

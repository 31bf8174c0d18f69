//! Collector operations shared by the HTTP and RPC surfaces

use crate::metric::{format_gauge, parse_value, Metric, MetricKind, MetricValue, ValidationError};
use crate::storage::{HealthStatus, Storage, StorageError};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, instrument, warn};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("{kind} metric {id:?} not found")]
    NotFound { id: String, kind: MetricKind },

    #[error(transparent)]
    Storage(StorageError),
}

impl From<StorageError> for ServiceError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Validation(e) => ServiceError::Validation(e),
            other => ServiceError::Storage(other),
        }
    }
}

#[derive(Clone)]
pub struct MetricService {
    storage: Arc<Storage>,
}

impl MetricService {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Apply one record and return the stored value after the write
    #[instrument(skip(self, metric), fields(id = %metric.id, kind = %metric.kind))]
    pub async fn update(&self, metric: Metric) -> Result<Metric, ServiceError> {
        metric.validate()?;

        let repository = self.storage.repository();
        repository.add_value(&metric).await?;

        let stored = repository.get_value(metric.kind, &metric.id).await?;
        stored.ok_or_else(|| {
            ServiceError::Storage(StorageError::Malformed(format!(
                "{} metric {:?} missing right after write",
                metric.kind, metric.id
            )))
        })
    }

    /// Apply a batch and return the full stored state
    #[instrument(skip(self, metrics), fields(count = metrics.len()))]
    pub async fn update_batch(&self, metrics: Vec<Metric>) -> Result<Vec<Metric>, ServiceError> {
        if metrics.is_empty() {
            return Err(ValidationError::EmptyBatch.into());
        }
        for metric in &metrics {
            metric.validate()?;
        }

        let repository = self.storage.repository();
        repository.add_values(&metrics).await?;
        debug!("Batch applied");

        Ok(repository.get_values().await?)
    }

    #[instrument(skip(self, query), fields(id = %query.id, kind = %query.kind))]
    pub async fn value(&self, query: &Metric) -> Result<Metric, ServiceError> {
        query.validate_query()?;

        self.storage
            .repository()
            .get_value(query.kind, &query.id)
            .await?
            .ok_or_else(|| ServiceError::NotFound {
                id: query.id.clone(),
                kind: query.kind,
            })
    }

    /// Plain-text update: `kind`, `name` and `value` straight from the path
    pub async fn update_text(&self, kind: &str, name: &str, value: &str) -> Result<(), ServiceError> {
        let kind: MetricKind = kind.parse()?;
        let value = parse_value(kind, value)?;
        self.update(Metric::from_value(name, value)).await?;
        Ok(())
    }

    /// Plain-text lookup rendered the way the text API prints values
    pub async fn value_text(&self, kind: &str, name: &str) -> Result<String, ServiceError> {
        let kind: MetricKind = kind.parse()?;
        let metric = self.value(&Metric::query(name, kind)).await?;

        Ok(match metric.validate()? {
            MetricValue::Gauge(v) => format_gauge(v),
            MetricValue::Counter(d) => d.to_string(),
        })
    }

    pub async fn gauges(&self) -> Result<BTreeMap<String, f64>, ServiceError> {
        Ok(self.storage.repository().gauges().await?)
    }

    pub async fn health(&self) -> HealthStatus {
        let status = self.storage.health().await;
        if let HealthStatus::Unreachable(reason) = &status {
            warn!(reason = %reason, "Storage unreachable");
        }
        status
    }
}

//! Repository capability set

use crate::metric::{Metric, MetricKind, MetricValue, ValidationError};
use async_trait::async_trait;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),

    #[error("malformed stored record: {0}")]
    Malformed(String),

    #[error("counter {id:?} overflowed")]
    Overflow { id: String },

    #[error("storage i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot: {0}")]
    Snapshot(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// Storage engine contract
///
/// Gauges replace, counters accumulate. Cancellation follows the async
/// model: dropping a returned future abandons the operation, and a
/// transaction that was not committed is rolled back.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn add_gauge_value(&self, id: &str, value: f64) -> Result<(), StorageError>;

    /// Atomic with respect to concurrent writers on the same id
    async fn add_counter_value(&self, id: &str, delta: i64) -> Result<(), StorageError>;

    async fn get_gauge_value(&self, id: &str) -> Result<Option<f64>, StorageError>;

    async fn get_counter_value(&self, id: &str) -> Result<Option<i64>, StorageError>;

    async fn gauges(&self) -> Result<BTreeMap<String, f64>, StorageError>;

    async fn counters(&self) -> Result<BTreeMap<String, i64>, StorageError>;

    async fn add_value(&self, metric: &Metric) -> Result<(), StorageError> {
        match metric.validate()? {
            MetricValue::Gauge(value) => self.add_gauge_value(&metric.id, value).await,
            MetricValue::Counter(delta) => self.add_counter_value(&metric.id, delta).await,
        }
    }

    /// Apply a batch; transactional backends override this to be all-or-nothing
    async fn add_values(&self, metrics: &[Metric]) -> Result<(), StorageError> {
        for metric in metrics {
            self.add_value(metric).await?;
        }
        Ok(())
    }

    async fn get_value(&self, kind: MetricKind, id: &str) -> Result<Option<Metric>, StorageError> {
        Ok(match kind {
            MetricKind::Gauge => self
                .get_gauge_value(id)
                .await?
                .map(|value| Metric::gauge(id, value)),
            MetricKind::Counter => self
                .get_counter_value(id)
                .await?
                .map(|delta| Metric::counter(id, delta)),
        })
    }

    async fn key_exists(&self, kind: MetricKind, id: &str) -> Result<bool, StorageError> {
        Ok(self.get_value(kind, id).await?.is_some())
    }

    /// Full state: gauges first, then counters, each ordered by id
    async fn get_values(&self) -> Result<Vec<Metric>, StorageError> {
        let gauges = self.gauges().await?;
        let counters = self.counters().await?;

        let mut values = Vec::with_capacity(gauges.len() + counters.len());
        values.extend(gauges.into_iter().map(|(id, value)| Metric::gauge(id, value)));
        values.extend(counters.into_iter().map(|(id, delta)| Metric::counter(id, delta)));
        Ok(values)
    }
}

//! In-memory backend

use super::repository::{Repository, StorageError};
use crate::metric::{Metric, MetricValue};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct State {
    gauges: HashMap<String, f64>,
    counters: HashMap<String, i64>,
}

/// Two maps behind one reader-writer lock
#[derive(Debug, Default)]
pub struct MemoryRepository {
    state: RwLock<State>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

fn accumulate(current: Option<i64>, id: &str, delta: i64) -> Result<i64, StorageError> {
    current
        .unwrap_or(0)
        .checked_add(delta)
        .ok_or_else(|| StorageError::Overflow { id: id.to_string() })
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn add_gauge_value(&self, id: &str, value: f64) -> Result<(), StorageError> {
        self.state.write().await.gauges.insert(id.to_string(), value);
        Ok(())
    }

    async fn add_counter_value(&self, id: &str, delta: i64) -> Result<(), StorageError> {
        let mut state = self.state.write().await;
        let next = accumulate(state.counters.get(id).copied(), id, delta)?;
        state.counters.insert(id.to_string(), next);
        Ok(())
    }

    async fn get_gauge_value(&self, id: &str) -> Result<Option<f64>, StorageError> {
        Ok(self.state.read().await.gauges.get(id).copied())
    }

    async fn get_counter_value(&self, id: &str) -> Result<Option<i64>, StorageError> {
        Ok(self.state.read().await.counters.get(id).copied())
    }

    async fn gauges(&self) -> Result<BTreeMap<String, f64>, StorageError> {
        let state = self.state.read().await;
        Ok(state.gauges.iter().map(|(k, v)| (k.clone(), *v)).collect())
    }

    async fn counters(&self) -> Result<BTreeMap<String, i64>, StorageError> {
        let state = self.state.read().await;
        Ok(state.counters.iter().map(|(k, v)| (k.clone(), *v)).collect())
    }

    /// Gauges then counters, read under one guard
    async fn get_values(&self) -> Result<Vec<Metric>, StorageError> {
        let state = self.state.read().await;
        let gauges: BTreeMap<&String, &f64> = state.gauges.iter().collect();
        let counters: BTreeMap<&String, &i64> = state.counters.iter().collect();

        let mut values = Vec::with_capacity(gauges.len() + counters.len());
        values.extend(gauges.into_iter().map(|(id, v)| Metric::gauge(id.clone(), *v)));
        values.extend(counters.into_iter().map(|(id, d)| Metric::counter(id.clone(), *d)));
        Ok(values)
    }

    /// Validates and stages the whole batch before touching state
    async fn add_values(&self, metrics: &[Metric]) -> Result<(), StorageError> {
        let values = metrics
            .iter()
            .map(|m| m.validate().map(|v| (m.id.as_str(), v)))
            .collect::<Result<Vec<_>, _>>()?;

        let mut state = self.state.write().await;

        let mut staged: HashMap<&str, i64> = HashMap::new();
        for (id, value) in &values {
            if let MetricValue::Counter(delta) = value {
                let current = staged
                    .get(id)
                    .copied()
                    .or_else(|| state.counters.get(*id).copied());
                staged.insert(*id, accumulate(current, id, *delta)?);
            }
        }

        for (id, value) in &values {
            if let MetricValue::Gauge(v) = value {
                state.gauges.insert(id.to_string(), *v);
            }
        }
        for (id, total) in staged {
            state.counters.insert(id.to_string(), total);
        }

        Ok(())
    }
}

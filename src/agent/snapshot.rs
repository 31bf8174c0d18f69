//! Agent-local metric store

use super::sampler::Sampler;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

/// Point-in-time view handed to the batch assembler
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SnapshotState {
    pub gauges: BTreeMap<String, f64>,
    /// Samples taken since start
    pub poll_count: i64,
}

#[derive(Debug, Default)]
pub struct MetricsSnapshot {
    state: RwLock<SnapshotState>,
}

impl MetricsSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take one sample and fold it in
    pub async fn update(&self, sampler: &dyn Sampler) {
        // Sampling reads procfs; keep it outside the write lock
        let sample = sampler.sample();

        let mut state = self.state.write().await;
        state.gauges.extend(sample);
        state.poll_count = state.poll_count.saturating_add(1);
    }

    pub async fn read(&self) -> SnapshotState {
        self.state.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(f64);

    impl Sampler for Fixed {
        fn sample(&self) -> BTreeMap<String, f64> {
            BTreeMap::from([("Alloc".to_string(), self.0)])
        }
    }

    #[tokio::test]
    async fn test_update_counts_polls() {
        let snapshot = MetricsSnapshot::new();
        snapshot.update(&Fixed(1.0)).await;
        snapshot.update(&Fixed(2.5)).await;

        let state = snapshot.read().await;
        assert_eq!(state.poll_count, 2);
        assert_eq!(state.gauges.get("Alloc"), Some(&2.5));
    }

    #[tokio::test]
    async fn test_read_is_detached() {
        let snapshot = MetricsSnapshot::new();
        snapshot.update(&Fixed(1.0)).await;
        let before = snapshot.read().await;

        snapshot.update(&Fixed(9.0)).await;
        assert_eq!(before.gauges.get("Alloc"), Some(&1.0));
        assert_eq!(before.poll_count, 1);
    }
}

//! Report batch assembly

use super::snapshot::SnapshotState;
use crate::metric::{Metric, POLL_COUNT_ID};

/// Turn a snapshot into wire records
///
/// Gauges come out ordered by id. The poll counter rides along only with at
/// least one gauge.
pub fn assemble(state: &SnapshotState) -> Vec<Metric> {
    if state.gauges.is_empty() {
        return Vec::new();
    }

    let mut batch: Vec<Metric> = state
        .gauges
        .iter()
        .map(|(id, value)| Metric::gauge(id.clone(), *value))
        .collect();

    if state.poll_count != 0 {
        batch.push(Metric::counter(POLL_COUNT_ID, state.poll_count));
    }
    batch
}

//! Metric model shared by the agent and the collector

pub mod types;

pub use types::{
    format_gauge, parse_value, Metric, MetricKind, MetricValue, ValidationError, POLL_COUNT_ID,
};

//! Metric Types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Name of the counter the agent appends to every batch
pub const POLL_COUNT_ID: &str = "PollCount";

/// Metric kind, serialized as `"gauge"` / `"counter"`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Gauge,
    Counter,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Gauge => "gauge",
            MetricKind::Counter => "counter",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gauge" => Ok(MetricKind::Gauge),
            "counter" => Ok(MetricKind::Counter),
            other => Err(ValidationError::UnknownKind(other.to_string())),
        }
    }
}

/// A validated metric payload
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricValue {
    /// Replaces the stored value
    Gauge(f64),
    /// Added to the stored total
    Counter(i64),
}

/// Boundary validation failures; these never reach a repository
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("metric id is absent")]
    MissingId,

    #[error("unknown metric type: {0}")]
    UnknownKind(String),

    #[error("{kind} metric {id} has no {field}")]
    MissingField {
        id: String,
        kind: MetricKind,
        field: &'static str,
    },

    #[error("{kind} metric {id} must not carry {field}")]
    UnexpectedField {
        id: String,
        kind: MetricKind,
        field: &'static str,
    },

    #[error("invalid {kind} value: {value}")]
    InvalidValue { kind: MetricKind, value: String },

    #[error("batch is empty")]
    EmptyBatch,
}

/// Wire representation of one metric record
///
/// Exactly one of `value` / `delta` is present on an update, selected by
/// `kind`. Queries carry neither.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Metric {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MetricKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
}

impl Metric {
    pub fn gauge(id: impl Into<String>, value: f64) -> Self {
        Self {
            id: id.into(),
            kind: MetricKind::Gauge,
            delta: None,
            value: Some(value),
        }
    }

    pub fn counter(id: impl Into<String>, delta: i64) -> Self {
        Self {
            id: id.into(),
            kind: MetricKind::Counter,
            delta: Some(delta),
            value: None,
        }
    }

    /// A lookup request: only `id` and `kind` populated
    pub fn query(id: impl Into<String>, kind: MetricKind) -> Self {
        Self {
            id: id.into(),
            kind,
            delta: None,
            value: None,
        }
    }

    pub fn from_value(id: impl Into<String>, value: MetricValue) -> Self {
        match value {
            MetricValue::Gauge(v) => Self::gauge(id, v),
            MetricValue::Counter(d) => Self::counter(id, d),
        }
    }

    /// Validate an update record and extract its payload
    pub fn validate(&self) -> Result<MetricValue, ValidationError> {
        if self.id.is_empty() {
            return Err(ValidationError::MissingId);
        }

        match self.kind {
            MetricKind::Gauge => {
                if self.delta.is_some() {
                    return Err(self.unexpected("delta"));
                }
                let value = self.value.ok_or_else(|| self.missing("value"))?;
                if !value.is_finite() {
                    return Err(ValidationError::InvalidValue {
                        kind: self.kind,
                        value: value.to_string(),
                    });
                }
                Ok(MetricValue::Gauge(value))
            }
            MetricKind::Counter => {
                if self.value.is_some() {
                    return Err(self.unexpected("value"));
                }
                self.delta
                    .map(MetricValue::Counter)
                    .ok_or_else(|| self.missing("delta"))
            }
        }
    }

    /// Validate a lookup record; payload fields are ignored
    pub fn validate_query(&self) -> Result<(), ValidationError> {
        if self.id.is_empty() {
            return Err(ValidationError::MissingId);
        }
        Ok(())
    }

    fn missing(&self, field: &'static str) -> ValidationError {
        ValidationError::MissingField {
            id: self.id.clone(),
            kind: self.kind,
            field,
        }
    }

    fn unexpected(&self, field: &'static str) -> ValidationError {
        ValidationError::UnexpectedField {
            id: self.id.clone(),
            kind: self.kind,
            field,
        }
    }
}

/// Parse a plain-text value for the given kind
pub fn parse_value(kind: MetricKind, raw: &str) -> Result<MetricValue, ValidationError> {
    let raw = raw.trim();
    let invalid = || ValidationError::InvalidValue {
        kind,
        value: raw.to_string(),
    };

    match kind {
        MetricKind::Gauge => raw
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .map(MetricValue::Gauge)
            .ok_or_else(invalid),
        MetricKind::Counter => raw.parse::<i64>().map(MetricValue::Counter).map_err(|_| invalid()),
    }
}

/// Render a gauge the way the plain-text API does: six decimals, trailing zeros trimmed
pub fn format_gauge(value: f64) -> String {
    let formatted = format!("{:.6}", value);
    let trimmed = formatted.trim_end_matches('0').trim_end_matches('.');
    match trimmed {
        "" | "-" => "0".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format() {
        let gauge = Metric::gauge("Alloc", 1.5);
        assert_eq!(
            serde_json::to_string(&gauge).unwrap(),
            r#"{"id":"Alloc","type":"gauge","value":1.5}"#
        );

        let counter = Metric::counter("PollCount", 3);
        assert_eq!(
            serde_json::to_string(&counter).unwrap(),
            r#"{"id":"PollCount","type":"counter","delta":3}"#
        );
    }

    #[test]
    fn test_unknown_kind_rejected_by_decoder() {
        let result: Result<Metric, _> =
            serde_json::from_str(r#"{"id":"ss","type":"counterBad","delta":3}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_validate() {
        assert_eq!(Metric::gauge("a", 2.0).validate(), Ok(MetricValue::Gauge(2.0)));
        assert_eq!(Metric::counter("c", -4).validate(), Ok(MetricValue::Counter(-4)));

        assert_eq!(Metric::gauge("", 2.0).validate(), Err(ValidationError::MissingId));

        let wrong_field: Metric =
            serde_json::from_str(r#"{"id":"ss","type":"counter","value":3}"#).unwrap();
        assert!(matches!(
            wrong_field.validate(),
            Err(ValidationError::UnexpectedField { field: "value", .. })
        ));

        let query = Metric::query("ss", MetricKind::Gauge);
        assert!(matches!(
            query.validate(),
            Err(ValidationError::MissingField { field: "value", .. })
        ));
        assert!(query.validate_query().is_ok());
    }

    #[test]
    fn test_parse_value() {
        assert_eq!(
            parse_value(MetricKind::Gauge, " 12.25 "),
            Ok(MetricValue::Gauge(12.25))
        );
        assert_eq!(parse_value(MetricKind::Counter, "7"), Ok(MetricValue::Counter(7)));
        assert!(parse_value(MetricKind::Counter, "7.5").is_err());
        assert!("histogram".parse::<MetricKind>().is_err());
    }

    #[test]
    fn test_format_gauge() {
        assert_eq!(format_gauge(2.5), "2.5");
        assert_eq!(format_gauge(3.0), "3");
        assert_eq!(format_gauge(-33.345345), "-33.345345");
        assert_eq!(format_gauge(0.0), "0");
    }
}

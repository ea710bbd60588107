//! The validated data model: metrics, batches, traces, spans, alerts.
//!
//! A raw metric has `aggregated = false`; the downsampler replaces
//! windows of raw metrics with `aggregated = true` rows that carry the
//! `DownsampleFacet`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

pub const MAX_METRICS_PER_BATCH: usize = 1000;
pub const MAX_NAME_LEN: usize = 255;
pub const MAX_ENDPOINT_LEN: usize = 500;
pub const MAX_METHOD_LEN: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
    /// Not a real sample — a side-channel row carrying span data, routed by
    /// the writer into `traces`/`spans` instead of `metrics`.
    #[serde(rename = "trace.span")]
    TraceSpan,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Histogram => "histogram",
            MetricKind::TraceSpan => "trace.span",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "counter" => Some(MetricKind::Counter),
            "gauge" => Some(MetricKind::Gauge),
            "histogram" => Some(MetricKind::Histogram),
            "trace.span" => Some(MetricKind::TraceSpan),
            _ => None,
        }
    }
}

/// Tags are a string-to-string map, serialized as JSON text in the store.
pub type Tags = BTreeMap<String, String>;

/// The HTTP facet is present only for metrics describing an HTTP call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpFacet {
    pub endpoint: Option<String>,
    pub method: Option<String>,
    pub status_code: Option<u16>,
    pub duration_ms: Option<f64>,
}

/// Present only when `aggregated == true`; produced by the downsampler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownsampleFacet {
    pub resolution_minutes: u32,
    pub min: f64,
    pub max: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub sample_count: u64,
    pub error_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metric {
    /// Present once persisted; absent on the wire before ingest assigns it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub timestamp: i64,
    pub service_name: String,
    pub metric_name: String,
    #[serde(rename = "metric_type")]
    pub kind: MetricKind,
    pub value: f64,
    #[serde(flatten)]
    pub http: HttpFacet,
    #[serde(default)]
    pub tags: Tags,
    pub trace_id: Option<String>,
    pub span_id: Option<String>,
    #[serde(default)]
    pub aggregated: bool,
    #[serde(flatten)]
    pub downsample: Option<DownsampleFacet>,
}

impl Metric {
    /// Validates every field-level invariant. `now_ms` is injected so the
    /// timestamp window check is deterministic in tests.
    pub fn validate(&self, now_ms: i64) -> Result<(), ValidationError> {
        let min_ts = now_ms - 7 * 24 * 3600 * 1000;
        let max_ts = now_ms + 3600 * 1000;
        if self.timestamp < min_ts || self.timestamp > max_ts {
            return Err(ValidationError::new(
                "timestamp",
                format!(
                    "timestamp {} outside allowed window [{}, {}]",
                    self.timestamp, min_ts, max_ts
                ),
            ));
        }
        validate_identifier("service_name", &self.service_name, MAX_NAME_LEN)?;
        validate_identifier("metric_name", &self.metric_name, MAX_NAME_LEN)?;
        if !self.value.is_finite() {
            return Err(ValidationError::new("value", "value must be finite"));
        }
        if let Some(endpoint) = &self.http.endpoint {
            if endpoint.len() > MAX_ENDPOINT_LEN {
                return Err(ValidationError::new("endpoint", "endpoint too long"));
            }
        }
        if let Some(method) = &self.http.method {
            if method.len() > MAX_METHOD_LEN {
                return Err(ValidationError::new("method", "method too long"));
            }
        }
        if let Some(status) = self.http.status_code {
            if status > 999 {
                return Err(ValidationError::new("status_code", "status_code out of range"));
            }
        }
        if let Some(duration) = self.http.duration_ms {
            if duration < 0.0 || !duration.is_finite() {
                return Err(ValidationError::new("duration_ms", "duration_ms must be >= 0"));
            }
        }
        if self.aggregated && self.downsample.is_none() {
            return Err(ValidationError::new(
                "aggregated",
                "aggregated metric must carry a downsampling facet",
            ));
        }
        if !self.aggregated && self.downsample.is_some() {
            return Err(ValidationError::new(
                "aggregated",
                "raw metric must not carry a downsampling facet",
            ));
        }
        Ok(())
    }

    /// `true` when this row is the trace/span side-channel, routed away
    /// from the metrics table.
    pub fn is_span_record(&self) -> bool {
        self.kind == MetricKind::TraceSpan
    }
}

fn validate_identifier(field: &str, value: &str, max_len: usize) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::new(field, "must not be empty"));
    }
    if value.len() > max_len {
        return Err(ValidationError::new(field, format!("exceeds {max_len} characters")));
    }
    Ok(())
}

/// Envelope emitted by the agent. `service_name` is the partition key for
/// the log-bus producer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricBatch {
    pub service_name: String,
    pub environment: String,
    pub agent_version: String,
    pub metrics: Vec<Metric>,
}

impl MetricBatch {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.service_name.is_empty() {
            return Err(ValidationError::new("service_name", "must not be empty"));
        }
        if self.metrics.len() > MAX_METRICS_PER_BATCH {
            return Err(ValidationError::new(
                "metrics",
                format!("batch exceeds {MAX_METRICS_PER_BATCH} metrics"),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceStatus {
    Active,
    Ok,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trace {
    pub trace_id: String,
    pub service_name: String,
    pub start_time: i64,
    pub end_time: Option<i64>,
    pub duration_ms: Option<f64>,
    pub status: TraceStatus,
    pub error_flag: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Span {
    pub span_id: String,
    pub trace_id: String,
    pub parent_span_id: Option<String>,
    pub service_name: String,
    pub operation_name: String,
    pub start_time: i64,
    pub end_time: Option<i64>,
    pub duration_ms: Option<f64>,
    pub tags: Tags,
    pub logs: Vec<String>,
    pub status: TraceStatus,
    pub error_flag: bool,
}

/// Root-parent sentinel used on the wire.
pub const ROOT_SENTINEL: &str = "root";

pub fn normalize_parent_span_id(raw: Option<&str>) -> Option<String> {
    match raw {
        None => None,
        Some(ROOT_SENTINEL) => None,
        Some(other) => Some(other.to_string()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Firing,
    Resolved,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub alert_id: String,
    pub service_name: String,
    pub metric_name: String,
    pub severity: Severity,
    pub status: AlertStatus,
    pub message: String,
    pub current_value: f64,
    pub expected_min: f64,
    pub expected_max: f64,
    pub breach_count: u64,
    pub first_triggered: i64,
    pub last_triggered: i64,
    pub resolved_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryLogEntry {
    pub service_name: String,
    pub metric_name: String,
    pub timestamp: i64,
    pub duration_ms: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_metric(now: i64) -> Metric {
        Metric {
            id: None,
            timestamp: now,
            service_name: "svc-a".into(),
            metric_name: "http.request.duration".into(),
            kind: MetricKind::Histogram,
            value: 123.45,
            http: HttpFacet {
                endpoint: Some("/x".into()),
                method: Some("GET".into()),
                status_code: Some(200),
                duration_ms: Some(123.45),
            },
            tags: Tags::new(),
            trace_id: None,
            span_id: None,
            aggregated: false,
            downsample: None,
        }
    }

    #[test]
    fn valid_metric_passes() {
        let now = 1_000_000_000_000;
        assert!(sample_metric(now).validate(now).is_ok());
    }

    #[test]
    fn future_timestamp_rejected() {
        let now = 1_000_000_000_000;
        let mut m = sample_metric(now);
        m.timestamp = now + 2 * 3_600_000;
        let err = m.validate(now).unwrap_err();
        assert!(matches!(err, ValidationError::Field { field, .. } if field == "timestamp"));
    }

    #[test]
    fn stale_timestamp_rejected() {
        let now = 1_000_000_000_000;
        let mut m = sample_metric(now);
        m.timestamp = now - 8 * 24 * 3_600_000;
        assert!(m.validate(now).is_err());
    }

    #[test]
    fn empty_service_name_rejected() {
        let now = 1_000_000_000_000;
        let mut m = sample_metric(now);
        m.service_name = String::new();
        assert!(m.validate(now).is_err());
    }

    #[test]
    fn nan_value_rejected() {
        let now = 1_000_000_000_000;
        let mut m = sample_metric(now);
        m.value = f64::NAN;
        assert!(m.validate(now).is_err());
    }

    #[test]
    fn aggregated_without_facet_rejected() {
        let now = 1_000_000_000_000;
        let mut m = sample_metric(now);
        m.aggregated = true;
        assert!(m.validate(now).is_err());
    }

    #[test]
    fn root_sentinel_normalizes_to_none() {
        assert_eq!(normalize_parent_span_id(Some("root")), None);
        assert_eq!(normalize_parent_span_id(Some("abc")), Some("abc".to_string()));
        assert_eq!(normalize_parent_span_id(None), None);
    }
}

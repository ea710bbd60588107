//! Hand-rolled Prometheus text exposition, mirroring
//! `vantage_common/prometheus_exporter.py`: a small `Counter`/`Gauge`/
//! `Histogram` registry that renders itself into the standard `# HELP` /
//! `# TYPE` exposition format for `GET /metrics`. A namespace prefix keeps
//! metric names collision-free across the three binaries.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord)]
struct LabelSet(Vec<(String, String)>);

impl LabelSet {
    fn from_pairs(pairs: &[(&str, &str)]) -> Self {
        LabelSet(pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect())
    }

    fn format(&self) -> String {
        if self.0.is_empty() {
            return String::new();
        }
        let mut sorted = self.0.clone();
        sorted.sort();
        sorted.iter().map(|(k, v)| format!("{k}=\"{v}\"")).collect::<Vec<_>>().join(",")
    }
}

fn render_line(name: &str, labels: &LabelSet, value: f64) -> String {
    let labels_str = labels.format();
    if labels_str.is_empty() {
        format!("{name} {value}\n")
    } else {
        format!("{name}{{{labels_str}}} {value}\n")
    }
}

trait RenderMetric: Send + Sync {
    fn render(&self) -> String;
}

pub struct Counter {
    name: String,
    description: String,
    values: Mutex<BTreeMap<LabelSet, f64>>,
}

impl Counter {
    fn new(name: String, description: String) -> Self {
        Counter { name, description, values: Mutex::new(BTreeMap::new()) }
    }

    pub fn inc(&self, labels: &[(&str, &str)]) {
        self.inc_by(1.0, labels);
    }

    pub fn inc_by(&self, amount: f64, labels: &[(&str, &str)]) {
        let key = LabelSet::from_pairs(labels);
        *self.values.lock().entry(key).or_insert(0.0) += amount;
    }
}

impl RenderMetric for Counter {
    fn render(&self) -> String {
        let mut out = format!("# HELP {} {}\n# TYPE {} counter\n", self.name, self.description, self.name);
        for (labels, value) in self.values.lock().iter() {
            out.push_str(&render_line(&self.name, labels, *value));
        }
        out
    }
}

pub struct Gauge {
    name: String,
    description: String,
    values: Mutex<BTreeMap<LabelSet, f64>>,
}

impl Gauge {
    fn new(name: String, description: String) -> Self {
        Gauge { name, description, values: Mutex::new(BTreeMap::new()) }
    }

    pub fn set(&self, value: f64, labels: &[(&str, &str)]) {
        let key = LabelSet::from_pairs(labels);
        self.values.lock().insert(key, value);
    }

    pub fn inc(&self, amount: f64, labels: &[(&str, &str)]) {
        let key = LabelSet::from_pairs(labels);
        *self.values.lock().entry(key).or_insert(0.0) += amount;
    }

    pub fn dec(&self, amount: f64, labels: &[(&str, &str)]) {
        self.inc(-amount, labels);
    }
}

impl RenderMetric for Gauge {
    fn render(&self) -> String {
        let mut out = format!("# HELP {} {}\n# TYPE {} gauge\n", self.name, self.description, self.name);
        for (labels, value) in self.values.lock().iter() {
            out.push_str(&render_line(&self.name, labels, *value));
        }
        out
    }
}

struct HistogramState {
    sum: f64,
    bucket_counts: Vec<u64>,
}

pub struct Histogram {
    name: String,
    description: String,
    buckets: Vec<f64>,
    values: Mutex<BTreeMap<LabelSet, HistogramState>>,
}

impl Histogram {
    fn new(name: String, description: String, mut buckets: Vec<f64>) -> Self {
        buckets.sort_by(|a, b| a.partial_cmp(b).unwrap());
        Histogram { name, description, buckets, values: Mutex::new(BTreeMap::new()) }
    }

    pub fn observe(&self, value: f64, labels: &[(&str, &str)]) {
        let key = LabelSet::from_pairs(labels);
        let bucket_len = self.buckets.len();
        let mut guard = self.values.lock();
        let state = guard
            .entry(key)
            .or_insert_with(|| HistogramState { sum: 0.0, bucket_counts: vec![0; bucket_len + 1] });
        state.sum += value;
        for (i, bound) in self.buckets.iter().enumerate() {
            if value <= *bound {
                state.bucket_counts[i] += 1;
            }
        }
        let last = state.bucket_counts.len() - 1;
        state.bucket_counts[last] += 1;
    }
}

impl RenderMetric for Histogram {
    fn render(&self) -> String {
        let mut out = format!("# HELP {} {}\n# TYPE {} histogram\n", self.name, self.description, self.name);
        for (labels, state) in self.values.lock().iter() {
            let mut cumulative = 0u64;
            for (i, bound) in self.buckets.iter().enumerate() {
                cumulative += state.bucket_counts[i];
                let mut with_le = labels.clone();
                with_le.0.push(("le".to_string(), bound.to_string()));
                out.push_str(&render_line(&format!("{}_bucket", self.name), &with_le, cumulative as f64));
            }
            cumulative += *state.bucket_counts.last().unwrap();
            let mut with_le = labels.clone();
            with_le.0.push(("le".to_string(), "+Inf".to_string()));
            out.push_str(&render_line(&format!("{}_bucket", self.name), &with_le, cumulative as f64));
            out.push_str(&render_line(&format!("{}_sum", self.name), labels, state.sum));
            out.push_str(&render_line(&format!("{}_count", self.name), labels, cumulative as f64));
        }
        out
    }
}

/// Registry and text-format renderer. One instance per process, shared
/// behind an `Arc` with whatever ingest/worker/query handlers need to
/// record against it.
#[derive(Clone)]
pub struct PrometheusExporter {
    namespace: String,
    registered: Arc<Mutex<Vec<Arc<dyn RenderMetric>>>>,
}

impl PrometheusExporter {
    pub fn new(namespace: impl Into<String>) -> Self {
        PrometheusExporter { namespace: namespace.into(), registered: Arc::new(Mutex::new(Vec::new())) }
    }

    pub fn counter(&self, name: &str, description: &str) -> Arc<Counter> {
        let counter = Arc::new(Counter::new(format!("{}_{name}", self.namespace), description.to_string()));
        self.registered.lock().push(counter.clone());
        counter
    }

    pub fn gauge(&self, name: &str, description: &str) -> Arc<Gauge> {
        let gauge = Arc::new(Gauge::new(format!("{}_{name}", self.namespace), description.to_string()));
        self.registered.lock().push(gauge.clone());
        gauge
    }

    pub fn histogram(&self, name: &str, description: &str, buckets: Vec<f64>) -> Arc<Histogram> {
        let histogram = Arc::new(Histogram::new(format!("{}_{name}", self.namespace), description.to_string(), buckets));
        self.registered.lock().push(histogram.clone());
        histogram
    }

    pub fn generate_text_format(&self) -> String {
        self.registered.lock().iter().map(|m| m.render()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_renders_help_type_and_value() {
        let exporter = PrometheusExporter::new("vantage_collector");
        let requests = exporter.counter("requests_total", "total requests received");
        requests.inc(&[("route", "/ingest")]);
        requests.inc(&[("route", "/ingest")]);

        let text = exporter.generate_text_format();
        assert!(text.contains("# HELP vantage_collector_requests_total total requests received"));
        assert!(text.contains("# TYPE vantage_collector_requests_total counter"));
        assert!(text.contains("vantage_collector_requests_total{route=\"/ingest\"} 2"));
    }

    #[test]
    fn gauge_set_overwrites_previous_value() {
        let exporter = PrometheusExporter::new("vantage_worker");
        let depth = exporter.gauge("queue_depth", "current bus queue depth");
        depth.set(10.0, &[]);
        depth.set(4.0, &[]);
        let text = exporter.generate_text_format();
        assert!(text.contains("vantage_worker_queue_depth 4"));
    }

    #[test]
    fn histogram_buckets_are_cumulative() {
        let exporter = PrometheusExporter::new("vantage_query_api");
        let latency = exporter.histogram("query_duration_ms", "VQL execution time", vec![10.0, 100.0]);
        latency.observe(5.0, &[]);
        latency.observe(50.0, &[]);

        let text = exporter.generate_text_format();
        assert!(text.contains("vantage_query_api_query_duration_ms_bucket{le=\"10\"} 1"));
        assert!(text.contains("vantage_query_api_query_duration_ms_bucket{le=\"100\"} 2"));
        assert!(text.contains("vantage_query_api_query_duration_ms_bucket{le=\"+Inf\"} 2"));
        assert!(text.contains("vantage_query_api_query_duration_ms_count 2"));
    }
}

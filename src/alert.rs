//! Smart alerting with adaptive thresholds: baseline from the last 7
//! days (excluding the most recent day) feeds an IQR-cleaned mean/stddev
//! band; breaches create or update a firing [`Alert`], a return to range
//! resolves it. Mirrors `vantage-worker/worker/alerting.py`.

use uuid::Uuid;

use crate::clock::now_ms;
use crate::error::StoreError;
use crate::model::{Alert, AlertStatus, Severity};
use crate::store::Store;

const HOUR_MS: i64 = 3_600_000;
const DAY_MS: i64 = 24 * HOUR_MS;
const MINUTE_MS: i64 = 60_000;

/// Kept for parity with the original worker's (unused-in-logic) persisted
/// field of the same name. Here it actually gates something: a resolved
/// alert re-breaching within this window reopens under its old `alert_id`
/// and `first_triggered` instead of starting fresh.
const ALERT_COOLDOWN_MINUTES: i64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sensitivity {
    Low,
    Medium,
    High,
    VeryHigh,
}

impl Sensitivity {
    fn sigma(self) -> f64 {
        match self {
            Sensitivity::Low => 3.0,
            Sensitivity::Medium => 2.5,
            Sensitivity::High => 2.0,
            Sensitivity::VeryHigh => 1.5,
        }
    }
}

/// No ML: a rolling mean/stddev band over an IQR-cleaned historical sample.
pub struct AdaptiveThresholdCalculator {
    sigma: f64,
}

impl AdaptiveThresholdCalculator {
    pub fn new(sensitivity: Sensitivity) -> Self {
        AdaptiveThresholdCalculator { sigma: sensitivity.sigma() }
    }

    /// `None` when there isn't enough clean data to trust a threshold.
    pub fn calculate_threshold(&self, historical_data: &[f64]) -> Option<(f64, f64)> {
        if historical_data.len() < 10 {
            return None;
        }
        let cleaned = remove_outliers(historical_data);
        if cleaned.len() < 5 {
            return None;
        }
        let mean = cleaned.iter().sum::<f64>() / cleaned.len() as f64;
        let variance = cleaned.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / cleaned.len() as f64;
        let std = variance.sqrt();

        let lower = (mean - self.sigma * std).max(0.0);
        let upper = mean + self.sigma * std;
        Some((lower, upper))
    }
}

/// Classic IQR fence: drop anything outside `[Q1 - 1.5*IQR, Q3 + 1.5*IQR]`.
fn remove_outliers(data: &[f64]) -> Vec<f64> {
    let mut sorted: Vec<f64> = data.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let n = sorted.len();
    if n < 4 {
        return sorted;
    }
    let q1 = sorted[n / 4];
    let q3 = sorted[3 * n / 4];
    let iqr = q3 - q1;
    let lower_fence = q1 - 1.5 * iqr;
    let upper_fence = q3 + 1.5 * iqr;
    data.iter().copied().filter(|&x| x >= lower_fence && x <= upper_fence).collect()
}

fn calculate_severity(value: f64, lower: f64, upper: f64) -> Severity {
    let deviation = if value > upper {
        if upper != 0.0 { (value - upper) / upper } else { 1.0 }
    } else if lower != 0.0 {
        (lower - value) / lower
    } else {
        1.0
    };

    if deviation > 0.5 {
        Severity::Critical
    } else if deviation > 0.3 {
        Severity::Warning
    } else {
        Severity::Info
    }
}

/// If `prev` resolved within [`ALERT_COOLDOWN_MINUTES`] of `now`, returns
/// the `(alert_id, first_triggered)` to reuse so the reopened alert keeps
/// its identity; otherwise `None` means start fresh.
fn cooldown_reopen(prev: Option<&Alert>, now: i64) -> Option<(String, i64)> {
    let prev = prev?;
    let resolved_at = prev.resolved_at?;
    if now - resolved_at <= ALERT_COOLDOWN_MINUTES * MINUTE_MS {
        Some((prev.alert_id.clone(), prev.first_triggered))
    } else {
        None
    }
}

fn generate_message(metric_name: &str, current: f64, lower: f64, upper: f64) -> String {
    if current > upper {
        format!("{metric_name} is abnormally high: {current:.2} (expected max: {upper:.2})")
    } else {
        format!("{metric_name} is abnormally low: {current:.2} (expected min: {lower:.2})")
    }
}

pub struct AlertEngine {
    store: Store,
    calculator: AdaptiveThresholdCalculator,
}

impl AlertEngine {
    pub fn new(store: Store, sensitivity: Sensitivity) -> Self {
        AlertEngine { store, calculator: AdaptiveThresholdCalculator::new(sensitivity) }
    }

    /// Evaluates one service/metric pair against its adaptive threshold,
    /// creating, updating or resolving an [`Alert`] as needed. Returns the
    /// alert if this call newly triggered one (the worker logs on this, the
    /// way `evaluate_metrics` warns on a fresh breach).
    pub fn evaluate_metrics(
        &self,
        service_name: &str,
        metric_name: &str,
    ) -> Result<Option<Alert>, StoreError> {
        let now = now_ms();

        let recent = self.store.fetch_timeseries(service_name, metric_name, now - HOUR_MS, now)?;
        let Some(latest) = recent.last() else {
            return Ok(None);
        };
        let current_value = latest.value;

        let baseline_end = now - DAY_MS;
        let baseline_start = baseline_end - 7 * DAY_MS;
        let historical: Vec<f64> = self
            .store
            .fetch_timeseries(service_name, metric_name, baseline_start, baseline_end)?
            .into_iter()
            .map(|p| p.value)
            .collect();
        if historical.is_empty() {
            return Ok(None);
        }

        let Some((lower, upper)) = self.calculator.calculate_threshold(&historical) else {
            return Ok(None);
        };

        if current_value < lower || current_value > upper {
            let existing = self.store.active_alert(service_name, metric_name)?;
            match existing {
                Some(mut alert) => {
                    // An unchanged latest sample (same timestamp as the
                    // breach already recorded) must not re-increment —
                    // two evaluations of identical input produce identical
                    // alert state.
                    if latest.timestamp > alert.last_triggered {
                        alert.current_value = current_value;
                        alert.last_triggered = now;
                        alert.breach_count += 1;
                        self.store.upsert_alert(&alert)?;
                    }
                    Ok(None)
                }
                None => {
                    let severity = calculate_severity(current_value, lower, upper);
                    let prev = self.store.last_resolved_alert(service_name, metric_name)?;
                    let (alert_id, first_triggered) = match cooldown_reopen(prev.as_ref(), now) {
                        Some((id, first_triggered)) => (id, first_triggered),
                        None => (Uuid::new_v4().to_string(), now),
                    };
                    let alert = Alert {
                        alert_id,
                        service_name: service_name.to_string(),
                        metric_name: metric_name.to_string(),
                        severity,
                        status: AlertStatus::Firing,
                        message: generate_message(metric_name, current_value, lower, upper),
                        current_value,
                        expected_min: lower,
                        expected_max: upper,
                        breach_count: 1,
                        first_triggered,
                        last_triggered: now,
                        resolved_at: None,
                    };
                    self.store.upsert_alert(&alert)?;
                    Ok(Some(alert))
                }
            }
        } else {
            if let Some(active) = self.store.active_alert(service_name, metric_name)? {
                self.store.resolve_alert(&active.alert_id, now)?;
            }
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{HttpFacet, Metric, MetricKind, Tags};

    fn temp_store() -> Store {
        let nanos = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos();
        let path = std::env::temp_dir().join(format!("vantage-alert-test-{nanos}.db"));
        Store::open_writer(path.to_str().unwrap()).unwrap()
    }

    fn sample(service: &str, name: &str, ts: i64, value: f64) -> Metric {
        Metric {
            id: None,
            timestamp: ts,
            service_name: service.into(),
            metric_name: name.into(),
            kind: MetricKind::Gauge,
            value,
            http: HttpFacet::default(),
            tags: Tags::new(),
            trace_id: None,
            span_id: None,
            aggregated: false,
            downsample: None,
        }
    }

    #[test]
    fn evaluate_metrics_does_not_reincrement_for_an_unchanged_latest_sample() {
        let store = temp_store();
        let now = now_ms();

        let mut metrics = Vec::new();
        for i in 0..100 {
            let ts = now - 8 * DAY_MS + i * (7 * DAY_MS / 100);
            metrics.push(sample("svc", "latency", ts, 100.0 + (i % 5) as f64));
        }
        metrics.push(sample("svc", "latency", now - 1_000, 500.0));
        store.insert_metrics_batch(&metrics).unwrap();

        let engine = AlertEngine::new(store.clone(), Sensitivity::Medium);

        let first = engine.evaluate_metrics("svc", "latency").unwrap();
        assert!(first.is_some());
        let after_first = store.active_alert("svc", "latency").unwrap().unwrap();
        assert_eq!(after_first.breach_count, 1);

        let second = engine.evaluate_metrics("svc", "latency").unwrap();
        assert!(second.is_none());
        let after_second = store.active_alert("svc", "latency").unwrap().unwrap();
        assert_eq!(
            after_second.breach_count, 1,
            "re-evaluating with an unchanged latest sample must not bump breach_count"
        );
    }

    #[test]
    fn threshold_requires_minimum_sample_size() {
        let calc = AdaptiveThresholdCalculator::new(Sensitivity::Medium);
        let data: Vec<f64> = (0..9).map(|i| i as f64).collect();
        assert!(calc.calculate_threshold(&data).is_none());
    }

    #[test]
    fn threshold_brackets_a_stable_baseline() {
        let calc = AdaptiveThresholdCalculator::new(Sensitivity::Medium);
        let data: Vec<f64> = (0..100).map(|i| 100.0 + (i % 5) as f64).collect();
        let (lower, upper) = calc.calculate_threshold(&data).unwrap();
        assert!(lower < 100.0);
        assert!(upper > 104.0);
    }

    #[test]
    fn outlier_removal_drops_extreme_spikes() {
        let mut data: Vec<f64> = (0..20).map(|_| 100.0).collect();
        data.push(10_000.0);
        let cleaned = remove_outliers(&data);
        assert!(!cleaned.contains(&10_000.0));
    }

    #[test]
    fn severity_escalates_with_deviation() {
        assert_eq!(calculate_severity(160.0, 50.0, 100.0), Severity::Critical);
        assert_eq!(calculate_severity(135.0, 50.0, 100.0), Severity::Warning);
        assert_eq!(calculate_severity(105.0, 50.0, 100.0), Severity::Info);
    }

    #[test]
    fn low_value_deviation_uses_lower_bound() {
        assert_eq!(calculate_severity(10.0, 100.0, 200.0), Severity::Critical);
    }

    fn resolved_alert(resolved_at: i64) -> Alert {
        Alert {
            alert_id: "prev-1".into(),
            service_name: "svc".into(),
            metric_name: "latency".into(),
            severity: Severity::Warning,
            status: AlertStatus::Resolved,
            message: "resolved".into(),
            current_value: 100.0,
            expected_min: 50.0,
            expected_max: 150.0,
            breach_count: 2,
            first_triggered: 1_000,
            last_triggered: 2_000,
            resolved_at: Some(resolved_at),
        }
    }

    #[test]
    fn cooldown_reopen_reuses_identity_within_window() {
        let prev = resolved_alert(10_000);
        let reopened = cooldown_reopen(Some(&prev), 10_000 + 2 * MINUTE_MS).unwrap();
        assert_eq!(reopened, ("prev-1".to_string(), 1_000));
    }

    #[test]
    fn cooldown_reopen_starts_fresh_past_the_window() {
        let prev = resolved_alert(10_000);
        let reopened = cooldown_reopen(Some(&prev), 10_000 + (ALERT_COOLDOWN_MINUTES + 1) * MINUTE_MS);
        assert!(reopened.is_none());
    }

    #[test]
    fn cooldown_reopen_is_none_without_a_prior_alert() {
        assert!(cooldown_reopen(None, 10_000).is_none());
    }
}

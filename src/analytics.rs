//! Comparison/A-B testing and service health scoring. Mirrors
//! `vantage-api/api/comparison.py` and `vantage-api/api/health_score.py`:
//! same significance test, same verdict thresholds, same weighted health
//! score.

use serde::Serialize;

use crate::clock::now_ms;
use crate::error::StoreError;
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Better,
    Worse,
    Neutral,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComparisonResult {
    pub metric_name: String,
    pub baseline_avg: f64,
    pub candidate_avg: f64,
    pub baseline_p95: Option<f64>,
    pub candidate_p95: Option<f64>,
    pub change_percent: f64,
    pub is_significant: bool,
    pub verdict: Verdict,
    pub confidence: f64,
}

const SIGNIFICANCE_CHANGE_THRESHOLD: f64 = 5.0;
const MIN_SAMPLES_FOR_T_TEST: usize = 10;
const MIN_SAMPLES_FOR_P95: usize = 20;

pub struct MetricComparison<'a> {
    store: &'a Store,
}

impl<'a> MetricComparison<'a> {
    pub fn new(store: &'a Store) -> Self {
        MetricComparison { store }
    }

    pub fn compare_services(
        &self,
        baseline_service: &str,
        candidate_service: &str,
        metric_name: &str,
        time_start: i64,
        time_end: i64,
    ) -> Result<ComparisonResult, StoreError> {
        let baseline = self.fetch_values(baseline_service, metric_name, time_start, time_end)?;
        let candidate = self.fetch_values(candidate_service, metric_name, time_start, time_end)?;
        analyze_comparison(metric_name, &baseline, &candidate)
    }

    pub fn compare_time_periods(
        &self,
        service_name: &str,
        metric_name: &str,
        baseline_start: i64,
        baseline_end: i64,
        candidate_start: i64,
        candidate_end: i64,
    ) -> Result<ComparisonResult, StoreError> {
        let baseline = self.fetch_values(service_name, metric_name, baseline_start, baseline_end)?;
        let candidate = self.fetch_values(service_name, metric_name, candidate_start, candidate_end)?;
        analyze_comparison(metric_name, &baseline, &candidate)
    }

    fn fetch_values(&self, service_name: &str, metric_name: &str, start: i64, end: i64) -> Result<Vec<f64>, StoreError> {
        Ok(self
            .store
            .fetch_timeseries(service_name, metric_name, start, end)?
            .into_iter()
            .map(|p| p.value)
            .collect())
    }
}

/// Returns `Err` when either side has no data — a comparison without a
/// baseline is not meaningful (mirrors raising `ValueError`).
fn analyze_comparison(
    metric_name: &str,
    baseline: &[f64],
    candidate: &[f64],
) -> Result<ComparisonResult, StoreError> {
    if baseline.is_empty() || candidate.is_empty() {
        return Err(StoreError::Fatal("insufficient data for comparison".into()));
    }

    let baseline_avg = mean(baseline);
    let candidate_avg = mean(candidate);
    let baseline_p95 = if baseline.len() > MIN_SAMPLES_FOR_P95 { Some(percentile(baseline, 95)) } else { None };
    let candidate_p95 = if candidate.len() > MIN_SAMPLES_FOR_P95 { Some(percentile(candidate, 95)) } else { None };

    let change_percent = if baseline_avg != 0.0 { (candidate_avg - baseline_avg) / baseline_avg * 100.0 } else { 0.0 };
    let is_significant = is_significant(baseline, candidate);
    let (verdict, confidence) = determine_verdict(metric_name, change_percent, is_significant);

    Ok(ComparisonResult {
        metric_name: metric_name.to_string(),
        baseline_avg,
        candidate_avg,
        baseline_p95,
        candidate_p95,
        change_percent,
        is_significant,
        verdict,
        confidence,
    })
}

fn mean(data: &[f64]) -> f64 {
    data.iter().sum::<f64>() / data.len() as f64
}

fn stdev(data: &[f64]) -> f64 {
    if data.len() < 2 {
        return 0.0;
    }
    let m = mean(data);
    let variance = data.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (data.len() - 1) as f64;
    variance.sqrt()
}

fn percentile(data: &[f64], pct: u32) -> f64 {
    let mut sorted = data.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let index = (sorted.len() * pct as usize / 100).min(sorted.len() - 1);
    sorted[index]
}

/// Simplified Welch's-t-test-style check: `t > 2` is treated as `p < 0.05`.
fn is_significant(baseline: &[f64], candidate: &[f64]) -> bool {
    if baseline.len() < MIN_SAMPLES_FOR_T_TEST || candidate.len() < MIN_SAMPLES_FOR_T_TEST {
        return false;
    }
    let mean1 = mean(baseline);
    let mean2 = mean(candidate);
    let std1 = stdev(baseline);
    let std2 = stdev(candidate);
    let se = ((std1.powi(2) / baseline.len() as f64) + (std2.powi(2) / candidate.len() as f64)).sqrt();
    if se == 0.0 {
        return false;
    }
    (mean1 - mean2).abs() / se > 2.0
}

fn determine_verdict(metric_name: &str, change_percent: f64, is_significant: bool) -> (Verdict, f64) {
    if !is_significant {
        return (Verdict::Neutral, 0.5);
    }

    let lower = metric_name.to_lowercase();
    let lower_is_better = ["latency", "duration", "time", "delay"].iter().any(|s| lower.contains(s))
        || lower.contains("error");

    if lower_is_better {
        if change_percent < -SIGNIFICANCE_CHANGE_THRESHOLD {
            (Verdict::Better, 0.9)
        } else if change_percent > SIGNIFICANCE_CHANGE_THRESHOLD {
            (Verdict::Worse, 0.9)
        } else {
            (Verdict::Neutral, 0.7)
        }
    } else if change_percent > SIGNIFICANCE_CHANGE_THRESHOLD {
        (Verdict::Better, 0.9)
    } else if change_percent < -SIGNIFICANCE_CHANGE_THRESHOLD {
        (Verdict::Worse, 0.9)
    } else {
        (Verdict::Neutral, 0.7)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthDetails {
    pub error_rate: f64,
    pub p95_latency_ms: Option<f64>,
    pub traffic_change_percent: f64,
    pub time_window_seconds: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthScore {
    pub service_name: String,
    pub overall_score: i32,
    pub error_score: i32,
    pub latency_score: i32,
    pub traffic_score: i32,
    pub status: HealthStatus,
    pub details: HealthDetails,
}

const ERROR_RATE_GOOD: f64 = 0.01;
const ERROR_RATE_BAD: f64 = 0.05;
const LATENCY_GOOD_MS: f64 = 100.0;
const LATENCY_BAD_MS: f64 = 500.0;
const TRAFFIC_CHANGE_GOOD: f64 = 0.1;
const TRAFFIC_CHANGE_BAD: f64 = 0.5;

pub struct HealthScoreCalculator<'a> {
    store: &'a Store,
}

impl<'a> HealthScoreCalculator<'a> {
    pub fn new(store: &'a Store) -> Self {
        HealthScoreCalculator { store }
    }

    pub fn calculate(&self, service_name: &str, time_window_seconds: u64) -> Result<HealthScore, StoreError> {
        let current_time = now_ms();
        let start_time = current_time - (time_window_seconds as i64 * 1000);

        let error_rate = self.error_rate(service_name, start_time, current_time)?;
        let p95_latency = self.p95_latency(service_name, start_time, current_time)?;
        let traffic_change = self.traffic_change(service_name, start_time, current_time)?;

        let error_score = score_error_rate(error_rate);
        let latency_score = score_latency(p95_latency);
        let traffic_score = score_traffic(traffic_change);

        let overall_score =
            (0.5 * error_score as f64 + 0.3 * latency_score as f64 + 0.2 * traffic_score as f64).round() as i32;

        let status = if overall_score >= 80 {
            HealthStatus::Healthy
        } else if overall_score >= 50 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Critical
        };

        Ok(HealthScore {
            service_name: service_name.to_string(),
            overall_score,
            error_score,
            latency_score,
            traffic_score,
            status,
            details: HealthDetails {
                error_rate,
                p95_latency_ms: p95_latency,
                traffic_change_percent: traffic_change * 100.0,
                time_window_seconds,
            },
        })
    }

    fn error_rate(&self, service_name: &str, start: i64, end: i64) -> Result<f64, StoreError> {
        let total = self.store.count_metrics(service_name, start, end, Some("%request%"), None)?;
        if total == 0 {
            return Ok(0.0);
        }
        let errors = self.store.count_metrics(service_name, start, end, Some("%request%"), Some(400))?;
        Ok(errors as f64 / total as f64)
    }

    fn p95_latency(&self, service_name: &str, start: i64, end: i64) -> Result<Option<f64>, StoreError> {
        let durations = self.store.fetch_durations(service_name, start, end)?;
        if durations.is_empty() {
            return Ok(None);
        }
        let index = ((durations.len() as f64 * 0.95) as usize).min(durations.len() - 1);
        Ok(Some(durations[index]))
    }

    fn traffic_change(&self, service_name: &str, start: i64, end: i64) -> Result<f64, StoreError> {
        let period = end - start;
        let previous_start = start - period;
        let previous_end = start;

        let current = self.store.count_metrics(service_name, start, end, None, None)?;
        let previous = self.store.count_metrics(service_name, previous_start, previous_end, None, None)?;
        if previous == 0 {
            return Ok(0.0);
        }
        let change = (current as f64 - previous as f64) / previous as f64;
        Ok(change.clamp(-1.0, 1.0))
    }
}

fn score_error_rate(error_rate: f64) -> i32 {
    if error_rate <= ERROR_RATE_GOOD {
        100
    } else if error_rate >= ERROR_RATE_BAD {
        0
    } else {
        let ratio = (error_rate - ERROR_RATE_GOOD) / (ERROR_RATE_BAD - ERROR_RATE_GOOD);
        (100.0 * (1.0 - ratio)) as i32
    }
}

fn score_latency(latency: Option<f64>) -> i32 {
    let Some(latency) = latency else { return 50 };
    if latency <= LATENCY_GOOD_MS {
        100
    } else if latency >= LATENCY_BAD_MS {
        0
    } else {
        let ratio = (latency - LATENCY_GOOD_MS) / (LATENCY_BAD_MS - LATENCY_GOOD_MS);
        (100.0 * (1.0 - ratio)) as i32
    }
}

fn score_traffic(traffic_change: f64) -> i32 {
    let change_abs = traffic_change.abs();
    if change_abs <= TRAFFIC_CHANGE_GOOD {
        100
    } else if change_abs >= TRAFFIC_CHANGE_BAD {
        50
    } else {
        let ratio = (change_abs - TRAFFIC_CHANGE_GOOD) / (TRAFFIC_CHANGE_BAD - TRAFFIC_CHANGE_GOOD);
        (100.0 - 50.0 * ratio) as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn significance_requires_minimum_sample_size() {
        let baseline = vec![1.0; 5];
        let candidate = vec![2.0; 5];
        assert!(!is_significant(&baseline, &candidate));
    }

    #[test]
    fn large_consistent_shift_is_significant() {
        let baseline: Vec<f64> = (0..50).map(|_| 100.0).collect();
        let candidate: Vec<f64> = (0..50).map(|_| 200.0).collect();
        assert!(is_significant(&baseline, &candidate));
    }

    #[test]
    fn latency_improvement_is_better() {
        let (verdict, _) = determine_verdict("http.request.duration", -10.0, true);
        assert_eq!(verdict, Verdict::Better);
    }

    #[test]
    fn latency_regression_is_worse() {
        let (verdict, _) = determine_verdict("http.request.duration", 10.0, true);
        assert_eq!(verdict, Verdict::Worse);
    }

    #[test]
    fn throughput_increase_is_better() {
        let (verdict, _) = determine_verdict("requests.count", 10.0, true);
        assert_eq!(verdict, Verdict::Better);
    }

    #[test]
    fn insignificant_change_is_neutral() {
        let (verdict, confidence) = determine_verdict("requests.count", 50.0, false);
        assert_eq!(verdict, Verdict::Neutral);
        assert_eq!(confidence, 0.5);
    }

    #[test]
    fn error_score_perfect_at_or_below_good_threshold() {
        assert_eq!(score_error_rate(0.005), 100);
        assert_eq!(score_error_rate(0.05), 0);
    }

    #[test]
    fn latency_score_neutral_without_data() {
        assert_eq!(score_latency(None), 50);
    }

    #[test]
    fn traffic_score_penalizes_large_swings() {
        assert_eq!(score_traffic(0.05), 100);
        assert_eq!(score_traffic(0.5), 50);
    }

    #[test]
    fn overall_score_rounds_rather_than_truncates() {
        // 0.5*33 + 0.3*100 + 0.2*100 = 66.5, which rounds to 67, not 66.
        let overall = (0.5 * 33.0 + 0.3 * 100.0 + 0.2 * 100.0_f64).round() as i32;
        assert_eq!(overall, 67);
    }
}

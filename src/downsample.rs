//! Adaptive metric downsampling: reduce storage for metrics nobody
//! looks at anymore while keeping high-variance, error-heavy or
//! frequently-queried series at full resolution. Mirrors
//! `vantage-worker/worker/downsampling.py`: same importance weights, same
//! age/importance/resolution rule table.

use std::collections::HashMap;

use tracing::info;

use crate::clock::now_ms;
use crate::error::StoreError;
use crate::model::DownsampleFacet;
use crate::store::{AggregatedBucket, RawSample, Store};

const DAY_MS: i64 = 86_400_000;
const WEEK_MS: i64 = 7 * DAY_MS;

/// `(age_days, min_importance, resolution_minutes)`. A `resolution_minutes`
/// of `0` means "keep at full resolution" and is skipped.
const RULES: &[(i64, f64, u32)] = &[
    (1, 0.0, 0),
    (7, 80.0, 1),
    (7, 50.0, 5),
    (7, 0.0, 15),
    (30, 80.0, 5),
    (30, 50.0, 60),
    (30, 0.0, 360),
    (90, 0.0, 1440),
];

#[derive(Debug, Default, Clone, Copy)]
pub struct DownsampleStats {
    pub metrics_processed: u64,
    pub metrics_downsampled: u64,
    pub storage_saved_bytes: u64,
}

/// Average metric row size used only to report `storage_saved_bytes`
/// (mirrors the Python engine's `removed * 200` estimate).
const AVG_METRIC_ROW_BYTES: u64 = 200;

pub struct DownsamplingEngine {
    store: Store,
}

impl DownsamplingEngine {
    pub fn new(store: Store) -> Self {
        DownsamplingEngine { store }
    }

    /// Runs one downsampling pass over every rule in [`RULES`]. Intended to
    /// be called periodically (every few hours) from the worker's
    /// background scheduler.
    pub fn run_once(&self) -> Result<DownsampleStats, StoreError> {
        let now = now_ms();
        let mut stats = DownsampleStats::default();

        let access_counts = self.access_frequency_map()?;

        for &(age_days, min_importance, resolution_min) in RULES {
            if resolution_min == 0 {
                continue;
            }
            let range_start = now - age_days * DAY_MS;
            let range_end = if age_days > 1 { now - (age_days - 1) * DAY_MS } else { now };

            let samples = self.store.fetch_raw_samples_in_range(range_start, range_end)?;
            stats.metrics_processed += samples.len() as u64;

            let grouped = group_by_service_metric(samples);
            for ((service_name, metric_name), group) in grouped {
                let importance = importance_score(&group, &access_counts, &service_name, &metric_name);
                if importance >= min_importance {
                    continue;
                }

                let buckets = aggregate_into_buckets(&group, resolution_min);
                if buckets.is_empty() {
                    continue;
                }
                let removed = self.store.apply_downsample_rule(
                    &service_name,
                    &metric_name,
                    range_start,
                    range_end,
                    &buckets,
                )?;
                stats.metrics_downsampled += removed as u64;
                stats.storage_saved_bytes += removed as u64 * AVG_METRIC_ROW_BYTES;

                info!(
                    event = "metrics_downsampled",
                    service_name = %service_name,
                    metric_name = %metric_name,
                    removed,
                    buckets = buckets.len(),
                    importance,
                    resolution_minutes = resolution_min,
                    "downsampled metric window"
                );
            }
        }

        Ok(stats)
    }

    fn access_frequency_map(&self) -> Result<HashMap<(String, String), u64>, StoreError> {
        let since = now_ms() - WEEK_MS;
        let rows = self.store.access_counts_since(since)?;
        Ok(rows.into_iter().map(|(svc, name, count)| ((svc, name), count)).collect())
    }
}

fn group_by_service_metric(samples: Vec<RawSample>) -> HashMap<(String, String), Vec<RawSample>> {
    let mut grouped: HashMap<(String, String), Vec<RawSample>> = HashMap::new();
    for sample in samples {
        let key = (sample.service_name.clone(), sample.metric_name.clone());
        grouped.entry(key).or_default().push(sample);
    }
    grouped
}

/// Weighted blend of variance, error rate and access frequency, each
/// normalized to 0-100 (mirrors `calculate_importance_score`).
fn importance_score(
    samples: &[RawSample],
    access_counts: &HashMap<(String, String), u64>,
    service_name: &str,
    metric_name: &str,
) -> f64 {
    if samples.is_empty() {
        return 50.0;
    }
    let variance_score = variance_score(samples);
    let error_score = error_rate_score(samples);
    let access_score = access_counts
        .get(&(service_name.to_string(), metric_name.to_string()))
        .map(|&count| (count as f64 * 10.0).min(100.0))
        .unwrap_or(0.0);

    let importance = variance_score * 0.4 + error_score * 0.4 + access_score * 0.2;
    importance.clamp(0.0, 100.0)
}

fn variance_score(samples: &[RawSample]) -> f64 {
    let values: Vec<f64> = samples.iter().map(|s| s.value).collect();
    if values.len() < 2 {
        return 50.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    if mean == 0.0 {
        return 50.0;
    }
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    100.0 / (1.0 + (-variance / mean.abs()).exp())
}

fn error_rate_score(samples: &[RawSample]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let errors = samples.iter().filter(|s| s.status_code.map(|c| c >= 500).unwrap_or(false)).count();
    let error_rate = errors as f64 / samples.len() as f64;
    (error_rate * 200.0).min(100.0)
}

/// `p`-th percentile index over `n` sorted values: `min(floor(n*p/100), n-1)`.
fn percentile_index(n: usize, p: u32) -> usize {
    ((n * p as usize) / 100).min(n - 1)
}

/// Buckets samples into `resolution_minutes`-wide windows and computes the
/// min/max/percentile/error-count summary for each (mirrors
/// `_aggregate_metrics`).
fn aggregate_into_buckets(samples: &[RawSample], resolution_minutes: u32) -> Vec<AggregatedBucket> {
    let window_ms = resolution_minutes as i64 * 60_000;
    if window_ms <= 0 {
        return Vec::new();
    }

    let mut buckets: HashMap<i64, Vec<&RawSample>> = HashMap::new();
    for sample in samples {
        let bucket_start = (sample.timestamp / window_ms) * window_ms;
        buckets.entry(bucket_start).or_default().push(sample);
    }

    let mut out = Vec::with_capacity(buckets.len());
    for (bucket_start, bucket_samples) in buckets {
        let mut values: Vec<f64> = bucket_samples.iter().map(|s| s.value).collect();
        if values.is_empty() {
            continue;
        }
        let avg = values.iter().sum::<f64>() / values.len() as f64;
        values.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let count = values.len();
        let p50 = values[percentile_index(count, 50)];
        let p95 = values[percentile_index(count, 95)];
        let p99 = values[percentile_index(count, 99)];
        let error_count = bucket_samples
            .iter()
            .filter(|s| s.status_code.map(|c| c >= 500).unwrap_or(false))
            .count();

        out.push(AggregatedBucket {
            bucket_start,
            resolution_minutes,
            avg,
            facet: DownsampleFacet {
                resolution_minutes,
                min: values[0],
                max: values[count - 1],
                p50,
                p95,
                p99,
                sample_count: count as u64,
                error_count: error_count as u64,
            },
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(ts: i64, value: f64, status: Option<u16>) -> RawSample {
        RawSample { timestamp: ts, service_name: "svc".into(), metric_name: "m".into(), value, status_code: status }
    }

    #[test]
    fn variance_score_is_fifty_for_single_sample() {
        assert_eq!(variance_score(&[sample(0, 1.0, None)]), 50.0);
    }

    #[test]
    fn error_rate_score_scales_to_200_percent() {
        let samples = vec![sample(0, 1.0, Some(500)), sample(1, 1.0, Some(200))];
        assert_eq!(error_rate_score(&samples), 100.0);
    }

    #[test]
    fn error_rate_score_caps_at_hundred() {
        let samples = vec![sample(0, 1.0, Some(500)); 4];
        assert_eq!(error_rate_score(&samples), 100.0);
    }

    #[test]
    fn aggregate_buckets_by_resolution() {
        let samples = vec![
            sample(0, 10.0, None),
            sample(30_000, 20.0, None),
            sample(120_000, 30.0, None),
        ];
        let buckets = aggregate_into_buckets(&samples, 1);
        assert_eq!(buckets.len(), 2);
        let first = buckets.iter().find(|b| b.bucket_start == 0).unwrap();
        assert_eq!(first.facet.sample_count, 2);
        assert_eq!(first.facet.min, 10.0);
        assert_eq!(first.facet.max, 20.0);
    }

    #[test]
    fn importance_blends_three_signals() {
        let samples = vec![sample(0, 100.0, Some(500)), sample(1, 100.0, Some(500))];
        let access = HashMap::new();
        let score = importance_score(&samples, &access, "svc", "m");
        assert!(score > 0.0 && score <= 100.0);
    }
}

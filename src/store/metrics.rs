use rusqlite::params;

use crate::clock::now_ms;
use crate::error::StoreError;
use crate::model::{DownsampleFacet, HttpFacet, Metric, MetricKind};

use super::{tags_from_json, tags_to_json, Store};

/// One raw row read back for importance scoring and bucketing; a
/// narrower projection than [`Metric`] since downsampling only needs these
/// columns (mirrors `downsampling.py`'s `MetricSample`).
#[derive(Debug, Clone)]
pub struct RawSample {
    pub timestamp: i64,
    pub service_name: String,
    pub metric_name: String,
    pub value: f64,
    pub status_code: Option<u16>,
}

/// One aggregated bucket produced by the downsampler, keyed by its bucket
/// start timestamp.
pub struct AggregatedBucket {
    pub bucket_start: i64,
    pub resolution_minutes: u32,
    /// The bucket's mean, stored as the emitted row's `value` column
    /// (spec.md §4.8: "avg (as value)") — distinct from `facet.p50`.
    pub avg: f64,
    pub facet: DownsampleFacet,
}

/// A slice of the timeseries for one service/metric pair, used by C14 reads
/// and by the alert baseline calculator.
#[derive(Debug, Clone)]
pub struct TimeseriesPoint {
    pub timestamp: i64,
    pub value: f64,
}

impl Store {
    /// Inserts a batch of already-validated raw metrics.
    /// Span-carrying records must be routed to [`Store::upsert_span`] before
    /// reaching here; this fails fast if one slips through.
    pub fn insert_metrics_batch(&self, metrics: &[Metric]) -> Result<usize, StoreError> {
        if metrics.is_empty() {
            return Ok(0);
        }
        let created_at = now_ms();
        let rows: Vec<_> = metrics
            .iter()
            .map(|m| -> Result<_, StoreError> {
                if m.is_span_record() {
                    return Err(StoreError::Fatal(
                        "trace.span metric reached insert_metrics_batch".into(),
                    ));
                }
                Ok((m, tags_to_json(&m.tags)))
            })
            .collect::<Result<_, _>>()?;

        let mut conn = self.pool().get()?;
        let tx = conn.transaction()?;
        for (m, tags_json) in &rows {
            tx.execute(
                "INSERT INTO metrics (
                    timestamp, service_name, metric_name, metric_type, value,
                    endpoint, method, status_code, duration_ms, tags,
                    trace_id, span_id, aggregated, created_at
                ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,0,?13)",
                params![
                    m.timestamp,
                    m.service_name,
                    m.metric_name,
                    m.kind.as_str(),
                    m.value,
                    m.http.endpoint,
                    m.http.method,
                    m.http.status_code,
                    m.http.duration_ms,
                    tags_json,
                    m.trace_id,
                    m.span_id,
                    created_at,
                ],
            )?;
        }
        tx.commit()?;
        Ok(rows.len())
    }

    /// Replaces every raw row for `(service_name, metric_name)` in
    /// `[range_start, range_end)` with the given aggregated buckets, inside a
    /// single transaction — the swap must be atomic or readers see a gap.
    /// Returns the number of raw rows removed.
    pub fn apply_downsample_rule(
        &self,
        service_name: &str,
        metric_name: &str,
        range_start: i64,
        range_end: i64,
        buckets: &[AggregatedBucket],
    ) -> Result<usize, StoreError> {
        let created_at = now_ms();
        let mut conn = self.pool().get()?;
        let tx = conn.transaction()?;
        let removed = tx.execute(
            "DELETE FROM metrics WHERE service_name = ?1 AND metric_name = ?2
             AND aggregated = 0 AND timestamp >= ?3 AND timestamp < ?4",
            params![service_name, metric_name, range_start, range_end],
        )?;
        for bucket in buckets {
            tx.execute(
                "INSERT INTO metrics (
                    timestamp, service_name, metric_name, metric_type, value,
                    tags, aggregated, resolution_minutes, min_value, max_value,
                    p50, p95, p99, sample_count, error_count, created_at
                ) VALUES (?1,?2,?3,'gauge',?4,'{}',1,?5,?6,?7,?8,?9,?10,?11,?12,?13)",
                params![
                    bucket.bucket_start,
                    service_name,
                    metric_name,
                    bucket.avg,
                    bucket.resolution_minutes,
                    bucket.facet.min,
                    bucket.facet.max,
                    bucket.facet.p50,
                    bucket.facet.p95,
                    bucket.facet.p99,
                    bucket.facet.sample_count as i64,
                    bucket.facet.error_count as i64,
                    created_at,
                ],
            )?;
        }
        tx.commit()?;
        Ok(removed)
    }

    /// Raw samples in `[start, end)` across all services, projected down to
    /// the columns the downsampler's importance calculator needs.
    pub fn fetch_raw_samples_in_range(&self, start_ms: i64, end_ms: i64) -> Result<Vec<RawSample>, StoreError> {
        let conn = self.pool().get()?;
        let mut stmt = conn.prepare(
            "SELECT timestamp, service_name, metric_name, value, status_code FROM metrics
             WHERE timestamp >= ?1 AND timestamp < ?2 AND aggregated = 0
             ORDER BY service_name, metric_name, timestamp",
        )?;
        let rows = stmt.query_map(params![start_ms, end_ms], |row| {
            Ok(RawSample {
                timestamp: row.get(0)?,
                service_name: row.get(1)?,
                metric_name: row.get(2)?,
                value: row.get(3)?,
                status_code: row.get(4)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Raw, non-aggregated points for one service/metric in `[since, until]`,
    /// ordered by time. Used by the alert baseline calculator and by direct
    /// timeseries reads.
    pub fn fetch_timeseries(
        &self,
        service_name: &str,
        metric_name: &str,
        since_ms: i64,
        until_ms: i64,
    ) -> Result<Vec<TimeseriesPoint>, StoreError> {
        let conn = self.pool().get()?;
        let mut stmt = conn.prepare(
            "SELECT timestamp, value FROM metrics
             WHERE service_name = ?1 AND metric_name = ?2
               AND timestamp >= ?3 AND timestamp <= ?4
               AND aggregated = 0
             ORDER BY timestamp ASC",
        )?;
        let rows = stmt.query_map(params![service_name, metric_name, since_ms, until_ms], |row| {
            Ok(TimeseriesPoint { timestamp: row.get(0)?, value: row.get(1)? })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Aggregated (downsampled) points for one service/metric in
    /// `[since, until]`, ordered by time. Backs `GET
    /// /api/metrics/aggregated`.
    pub fn fetch_aggregated(
        &self,
        service_name: &str,
        metric_name: &str,
        since_ms: i64,
        until_ms: i64,
    ) -> Result<Vec<Metric>, StoreError> {
        let conn = self.pool().get()?;
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, service_name, metric_name, metric_type, value,
                    endpoint, method, status_code, duration_ms, tags, trace_id, span_id,
                    aggregated, resolution_minutes, min_value, max_value, p50, p95, p99,
                    sample_count, error_count
             FROM metrics
             WHERE service_name = ?1 AND metric_name = ?2 AND aggregated = 1
               AND timestamp >= ?3 AND timestamp <= ?4
             ORDER BY timestamp ASC",
        )?;
        let rows = stmt.query_map(params![service_name, metric_name, since_ms, until_ms], |row| {
            let resolution_minutes: Option<u32> = row.get(14)?;
            let min_value: Option<f64> = row.get(15)?;
            let downsample = resolution_minutes.map(|resolution_minutes| DownsampleFacet {
                resolution_minutes,
                min: min_value.unwrap_or_default(),
                max: row.get(16).unwrap_or_default(),
                p50: row.get(17).unwrap_or_default(),
                p95: row.get(18).unwrap_or_default(),
                p99: row.get(19).unwrap_or_default(),
                sample_count: row.get::<_, Option<i64>>(20)?.unwrap_or_default() as u64,
                error_count: row.get::<_, Option<i64>>(21)?.unwrap_or_default() as u64,
            });
            let tags_json: String = row.get(10)?;
            Ok(Metric {
                id: row.get(0)?,
                timestamp: row.get(1)?,
                service_name: row.get(2)?,
                metric_name: row.get(3)?,
                kind: MetricKind::parse(&row.get::<_, String>(4)?).unwrap_or(MetricKind::Gauge),
                value: row.get(5)?,
                http: HttpFacet {
                    endpoint: row.get(6)?,
                    method: row.get(7)?,
                    status_code: row.get(8)?,
                    duration_ms: row.get(9)?,
                },
                tags: tags_from_json(&tags_json),
                trace_id: row.get(11)?,
                span_id: row.get(12)?,
                aggregated: row.get::<_, i64>(13)? != 0,
                downsample,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Every distinct `(service_name, metric_name)` pair with data in the
    /// window, used by the downsampler to discover what to score and by
    /// `/services` reads.
    pub fn list_service_metric_pairs(
        &self,
        since_ms: i64,
    ) -> Result<Vec<(String, String)>, StoreError> {
        let conn = self.pool().get()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT service_name, metric_name FROM metrics
             WHERE timestamp >= ?1 AND aggregated = 0",
        )?;
        let rows = stmt.query_map([since_ms], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn list_services(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.pool().get()?;
        let mut stmt = conn.prepare("SELECT DISTINCT service_name FROM metrics ORDER BY service_name")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Appends one row to `query_log`, used to weight the importance score
    /// and surfaced by `/v1/stats`.
    pub fn record_query(&self, service_name: &str, metric_name: &str, duration_ms: f64) -> Result<(), StoreError> {
        let conn = self.pool().get()?;
        conn.execute(
            "INSERT INTO query_log (service_name, metric_name, timestamp, duration_ms) VALUES (?1,?2,?3,?4)",
            params![service_name, metric_name, now_ms(), duration_ms],
        )?;
        Ok(())
    }

    /// Counts rows for `service_name` in `[start_ms, end_ms]`, optionally
    /// restricted to metric names matching a SQL `LIKE` pattern and/or a
    /// minimum HTTP status code. Used by the health score calculator.
    pub fn count_metrics(
        &self,
        service_name: &str,
        start_ms: i64,
        end_ms: i64,
        name_like: Option<&str>,
        min_status: Option<u16>,
    ) -> Result<u64, StoreError> {
        let conn = self.pool().get()?;
        let mut sql = "SELECT COUNT(*) FROM metrics WHERE service_name = ?1 AND timestamp >= ?2 AND timestamp <= ?3".to_string();
        if name_like.is_some() {
            sql.push_str(" AND metric_name LIKE ?4");
        }
        if min_status.is_some() {
            sql.push_str(if name_like.is_some() { " AND status_code >= ?5" } else { " AND status_code >= ?4" });
        }
        let count: i64 = match (name_like, min_status) {
            (Some(like), Some(status)) => {
                conn.query_row(&sql, params![service_name, start_ms, end_ms, like, status], |r| r.get(0))?
            }
            (Some(like), None) => conn.query_row(&sql, params![service_name, start_ms, end_ms, like], |r| r.get(0))?,
            (None, Some(status)) => {
                conn.query_row(&sql, params![service_name, start_ms, end_ms, status], |r| r.get(0))?
            }
            (None, None) => conn.query_row(&sql, params![service_name, start_ms, end_ms], |r| r.get(0))?,
        };
        Ok(count.max(0) as u64)
    }

    /// All non-null `duration_ms` values for a service in range, used by the
    /// health score's p95 latency term.
    pub fn fetch_durations(&self, service_name: &str, start_ms: i64, end_ms: i64) -> Result<Vec<f64>, StoreError> {
        let conn = self.pool().get()?;
        let mut stmt = conn.prepare(
            "SELECT duration_ms FROM metrics
             WHERE service_name = ?1 AND timestamp >= ?2 AND timestamp <= ?3 AND duration_ms IS NOT NULL
             ORDER BY duration_ms",
        )?;
        let rows = stmt.query_map(params![service_name, start_ms, end_ms], |row| row.get(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Access counts per `(service_name, metric_name)` over the window, used
    /// by the downsampler's access-frequency term.
    pub fn access_counts_since(&self, since_ms: i64) -> Result<Vec<(String, String, u64)>, StoreError> {
        let conn = self.pool().get()?;
        let mut stmt = conn.prepare(
            "SELECT service_name, metric_name, COUNT(*) FROM query_log
             WHERE timestamp >= ?1 GROUP BY service_name, metric_name",
        )?;
        let rows = stmt.query_map([since_ms], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get::<_, i64>(2)? as u64))
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::*;
    use crate::model::{HttpFacet, Tags};

    fn temp_store() -> Store {
        let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
        let path = std::env::temp_dir().join(format!("vantage-test-{nanos}.db"));
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
    fn insert_and_fetch_round_trips() {
        let store = temp_store();
        let metrics = vec![sample("svc", "cpu", 1_000, 10.0), sample("svc", "cpu", 2_000, 20.0)];
        assert_eq!(store.insert_metrics_batch(&metrics).unwrap(), 2);
        let points = store.fetch_timeseries("svc", "cpu", 0, 10_000).unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].value, 10.0);
        assert_eq!(points[1].value, 20.0);
    }

    #[test]
    fn downsample_replace_is_atomic() {
        let store = temp_store();
        let metrics = vec![sample("svc", "cpu", 1_000, 10.0), sample("svc", "cpu", 2_000, 20.0)];
        store.insert_metrics_batch(&metrics).unwrap();
        let bucket = AggregatedBucket {
            bucket_start: 0,
            resolution_minutes: 5,
            avg: 15.0,
            facet: DownsampleFacet {
                resolution_minutes: 5,
                min: 10.0,
                max: 20.0,
                p50: 15.0,
                p95: 19.0,
                p99: 20.0,
                sample_count: 2,
                error_count: 0,
            },
        };
        let removed = store.apply_downsample_rule("svc", "cpu", 0, 3_000, &[bucket]).unwrap();
        assert_eq!(removed, 2);
        let points = store.fetch_timeseries("svc", "cpu", 0, 3_000).unwrap();
        assert!(points.is_empty(), "raw rows were replaced; fetch_timeseries must not surface the aggregated row");

        let aggregated = store.fetch_aggregated("svc", "cpu", 0, 3_000).unwrap();
        assert_eq!(aggregated.len(), 1);
        assert!(aggregated[0].aggregated);
        assert_eq!(aggregated[0].value, 15.0);
        let facet = aggregated[0].downsample.as_ref().unwrap();
        assert_eq!(facet.min, 10.0);
        assert_eq!(facet.max, 20.0);
    }

    #[test]
    fn span_record_rejected_by_insert() {
        let store = temp_store();
        let mut span_metric = sample("svc", "op", 1_000, 0.0);
        span_metric.kind = MetricKind::TraceSpan;
        let err = store.insert_metrics_batch(&[span_metric]).unwrap_err();
        assert!(matches!(err, StoreError::Fatal(_)));
    }
}

use rusqlite::{params, OptionalExtension};

use crate::error::StoreError;
use crate::model::{normalize_parent_span_id, Metric, Span, Trace, TraceStatus};

use super::{tags_from_json, tags_to_json, Store};

fn status_str(status: TraceStatus) -> &'static str {
    match status {
        TraceStatus::Active => "active",
        TraceStatus::Ok => "ok",
        TraceStatus::Error => "error",
    }
}

fn parse_status(raw: &str) -> TraceStatus {
    match raw {
        "ok" => TraceStatus::Ok,
        "error" => TraceStatus::Error,
        _ => TraceStatus::Active,
    }
}

impl Store {
    /// Routes a `trace.span` metric into `traces`/`spans` instead of the
    /// metrics table. Creates the parent trace row on first sight of a
    /// `trace_id` and keeps `traces.end_time`/`status` in sync as spans
    /// close.
    pub fn upsert_span(&self, metric: &Metric) -> Result<(), StoreError> {
        let trace_id = metric.trace_id.clone().ok_or_else(|| {
            StoreError::Fatal("trace.span metric missing trace_id".into())
        })?;
        let span_id = metric.span_id.clone().ok_or_else(|| {
            StoreError::Fatal("trace.span metric missing span_id".into())
        })?;
        let parent_span_id = normalize_parent_span_id(metric.tags.get("parent_span_id").map(|s| s.as_str()));
        let operation_name = metric
            .tags
            .get("operation")
            .cloned()
            .unwrap_or_else(|| metric.metric_name.clone());
        let is_error = metric.http.status_code.map(|c| c >= 500).unwrap_or(false)
            || metric.tags.get("error").map(|v| v == "true").unwrap_or(false);
        let end_time = metric.http.duration_ms.map(|_| metric.timestamp);
        let status = if is_error { TraceStatus::Error } else { TraceStatus::Ok };

        let mut conn = self.pool().get()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO traces (trace_id, service_name, start_time, status, error_flag)
             VALUES (?1, ?2, ?3, 'active', 0)
             ON CONFLICT(trace_id) DO UPDATE SET
                start_time = MIN(traces.start_time, excluded.start_time)",
            params![trace_id, metric.service_name, metric.timestamp],
        )?;
        tx.execute(
            "INSERT INTO spans (
                span_id, trace_id, parent_span_id, service_name, operation_name,
                start_time, end_time, duration_ms, tags, logs, status, error_flag
            ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,'[]',?10,?11)
            ON CONFLICT(span_id) DO UPDATE SET
                end_time = excluded.end_time,
                duration_ms = excluded.duration_ms,
                status = excluded.status,
                error_flag = excluded.error_flag",
            params![
                span_id,
                trace_id,
                parent_span_id,
                metric.service_name,
                operation_name,
                metric.timestamp,
                end_time,
                metric.http.duration_ms,
                tags_to_json(&metric.tags),
                status_str(status),
                is_error as i64,
            ],
        )?;
        if parent_span_id.is_none() {
            // Root span closing: the trace as a whole is done.
            if let Some(end) = end_time {
                tx.execute(
                    "UPDATE traces SET end_time = ?1, duration_ms = ?2,
                        status = ?3, error_flag = error_flag OR ?4
                     WHERE trace_id = ?5",
                    params![end, metric.http.duration_ms, status_str(status), is_error as i64, trace_id],
                )?;
            }
        } else if is_error {
            tx.execute("UPDATE traces SET error_flag = 1 WHERE trace_id = ?1", params![trace_id])?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn fetch_trace(&self, trace_id: &str) -> Result<Option<Trace>, StoreError> {
        let conn = self.pool().get()?;
        let trace = conn
            .query_row(
                "SELECT trace_id, service_name, start_time, end_time, duration_ms, status, error_flag
                 FROM traces WHERE trace_id = ?1",
                [trace_id],
                |row| {
                    Ok(Trace {
                        trace_id: row.get(0)?,
                        service_name: row.get(1)?,
                        start_time: row.get(2)?,
                        end_time: row.get(3)?,
                        duration_ms: row.get(4)?,
                        status: parse_status(&row.get::<_, String>(5)?),
                        error_flag: row.get::<_, i64>(6)? != 0,
                    })
                },
            )
            .optional()?;
        Ok(trace)
    }

    pub fn fetch_spans_for_trace(&self, trace_id: &str) -> Result<Vec<Span>, StoreError> {
        let conn = self.pool().get()?;
        let mut stmt = conn.prepare(
            "SELECT span_id, trace_id, parent_span_id, service_name, operation_name,
                    start_time, end_time, duration_ms, tags, logs, status, error_flag
             FROM spans WHERE trace_id = ?1 ORDER BY start_time ASC",
        )?;
        let rows = stmt.query_map([trace_id], |row| {
            let tags_json: String = row.get(8)?;
            let logs_json: String = row.get(9)?;
            Ok(Span {
                span_id: row.get(0)?,
                trace_id: row.get(1)?,
                parent_span_id: row.get(2)?,
                service_name: row.get(3)?,
                operation_name: row.get(4)?,
                start_time: row.get(5)?,
                end_time: row.get(6)?,
                duration_ms: row.get(7)?,
                tags: tags_from_json(&tags_json),
                logs: serde_json::from_str(&logs_json).unwrap_or_default(),
                status: parse_status(&row.get::<_, String>(10)?),
                error_flag: row.get::<_, i64>(11)? != 0,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Traces matching a service and optional error-only filter, newest
    /// first, used by `/traces/search`.
    pub fn search_traces(
        &self,
        service_name: &str,
        errors_only: bool,
        since_ms: i64,
        limit: u32,
    ) -> Result<Vec<Trace>, StoreError> {
        let conn = self.pool().get()?;
        let sql = if errors_only {
            "SELECT trace_id, service_name, start_time, end_time, duration_ms, status, error_flag
             FROM traces WHERE service_name = ?1 AND start_time >= ?2 AND error_flag = 1
             ORDER BY start_time DESC LIMIT ?3"
        } else {
            "SELECT trace_id, service_name, start_time, end_time, duration_ms, status, error_flag
             FROM traces WHERE service_name = ?1 AND start_time >= ?2
             ORDER BY start_time DESC LIMIT ?3"
        };
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params![service_name, since_ms, limit], |row| {
            Ok(Trace {
                trace_id: row.get(0)?,
                service_name: row.get(1)?,
                start_time: row.get(2)?,
                end_time: row.get(3)?,
                duration_ms: row.get(4)?,
                status: parse_status(&row.get::<_, String>(5)?),
                error_flag: row.get::<_, i64>(6)? != 0,
            })
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
    use crate::model::{HttpFacet, MetricKind, Tags};

    fn temp_store() -> Store {
        let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
        let path = std::env::temp_dir().join(format!("vantage-trace-test-{nanos}.db"));
        Store::open_writer(path.to_str().unwrap()).unwrap()
    }

    fn span_metric(trace: &str, span: &str, parent: Option<&str>, ts: i64, duration: Option<f64>) -> Metric {
        let mut tags = Tags::new();
        tags.insert("operation".into(), "handle".into());
        if let Some(p) = parent {
            tags.insert("parent_span_id".into(), p.into());
        }
        Metric {
            id: None,
            timestamp: ts,
            service_name: "svc".into(),
            metric_name: "handle".into(),
            kind: MetricKind::TraceSpan,
            value: 0.0,
            http: HttpFacet { duration_ms: duration, status_code: Some(200), ..Default::default() },
            tags,
            trace_id: Some(trace.into()),
            span_id: Some(span.into()),
            aggregated: false,
            downsample: None,
        }
    }

    #[test]
    fn root_span_closes_trace() {
        let store = temp_store();
        store.upsert_span(&span_metric("t1", "root", Some("root"), 1_000, None)).unwrap();
        store.upsert_span(&span_metric("t1", "child", Some("root"), 1_100, Some(5.0))).unwrap();
        store.upsert_span(&span_metric("t1", "root", None, 1_200, Some(200.0))).unwrap();

        let trace = store.fetch_trace("t1").unwrap().unwrap();
        assert_eq!(trace.duration_ms, Some(200.0));
        let spans = store.fetch_spans_for_trace("t1").unwrap();
        assert_eq!(spans.len(), 2);
    }

    #[test]
    fn error_child_marks_trace_errored() {
        let store = temp_store();
        store.upsert_span(&span_metric("t2", "root", Some("root"), 1_000, None)).unwrap();
        let mut errored = span_metric("t2", "child", Some("root"), 1_100, Some(5.0));
        errored.http.status_code = Some(500);
        store.upsert_span(&errored).unwrap();

        let trace = store.fetch_trace("t2").unwrap().unwrap();
        assert!(trace.error_flag);
    }
}

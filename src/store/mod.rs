//! The time-series store: one SQLite database backing `metrics`, `traces`,
//! `spans`, `alerts` and `query_log`. A wide table partitioned by month and
//! range-partitioned orderings are the contract of a production time-series
//! engine; SQLite gives us the same logical schema with covering indexes,
//! trading physical monthly partitioning for index-backed range scans (see
//! DESIGN.md for the reasoning behind this store backend choice).

mod alerts;
mod metrics;
mod traces;

pub use alerts::*;
pub use metrics::*;
pub use traces::*;

use r2d2::Pool;
use r2d2_sqlite::rusqlite::OpenFlags;
use r2d2_sqlite::SqliteConnectionManager;

use crate::error::StoreError;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS metrics (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp INTEGER NOT NULL,
    service_name TEXT NOT NULL,
    metric_name TEXT NOT NULL,
    metric_type TEXT NOT NULL,
    value REAL NOT NULL,
    endpoint TEXT,
    method TEXT,
    status_code INTEGER,
    duration_ms REAL,
    tags TEXT NOT NULL DEFAULT '{}',
    trace_id TEXT,
    span_id TEXT,
    aggregated INTEGER NOT NULL DEFAULT 0,
    resolution_minutes INTEGER,
    min_value REAL,
    max_value REAL,
    p50 REAL,
    p95 REAL,
    p99 REAL,
    sample_count INTEGER,
    error_count INTEGER,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_metrics_svc_name_ts ON metrics(service_name, metric_name, timestamp);
CREATE INDEX IF NOT EXISTS idx_metrics_aggregated_ts ON metrics(aggregated, timestamp);

CREATE TABLE IF NOT EXISTS traces (
    trace_id TEXT PRIMARY KEY,
    service_name TEXT NOT NULL,
    start_time INTEGER NOT NULL,
    end_time INTEGER,
    duration_ms REAL,
    status TEXT NOT NULL DEFAULT 'active',
    error_flag INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS spans (
    span_id TEXT PRIMARY KEY,
    trace_id TEXT NOT NULL,
    parent_span_id TEXT,
    service_name TEXT NOT NULL,
    operation_name TEXT NOT NULL,
    start_time INTEGER NOT NULL,
    end_time INTEGER,
    duration_ms REAL,
    tags TEXT NOT NULL DEFAULT '{}',
    logs TEXT NOT NULL DEFAULT '[]',
    status TEXT NOT NULL DEFAULT 'ok',
    error_flag INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_spans_trace ON spans(trace_id);

CREATE TABLE IF NOT EXISTS alerts (
    alert_id TEXT PRIMARY KEY,
    service_name TEXT NOT NULL,
    metric_name TEXT NOT NULL,
    severity TEXT NOT NULL,
    status TEXT NOT NULL,
    message TEXT NOT NULL,
    current_value REAL NOT NULL,
    expected_min REAL NOT NULL,
    expected_max REAL NOT NULL,
    breach_count INTEGER NOT NULL DEFAULT 1,
    first_triggered INTEGER NOT NULL,
    last_triggered INTEGER NOT NULL,
    resolved_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_alerts_svc_metric_status ON alerts(service_name, metric_name, status);

CREATE TABLE IF NOT EXISTS query_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    service_name TEXT NOT NULL,
    metric_name TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    duration_ms REAL NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_query_log_svc_metric_ts ON query_log(service_name, metric_name, timestamp);
";

#[derive(Clone)]
pub struct Store {
    pool: Pool<SqliteConnectionManager>,
}

impl Store {
    /// Opens (and migrates) the store for read-write access. Only the
    /// worker process should hold a writer `Store` — single-writer topology.
    pub fn open_writer(db_path: &str) -> Result<Self, StoreError> {
        let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
            conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
        });
        let pool = Pool::builder().max_size(4).build(manager)?;
        {
            let conn = pool.get()?;
            conn.execute_batch(SCHEMA)?;
        }
        Ok(Store { pool })
    }

    /// Opens a view of an already-migrated store for the query API and the
    /// collector's stats endpoint. Neither process runs migrations or
    /// touches `metrics`/`traces`/`spans`/`alerts`, but the query API still
    /// appends to `query_log` on every read, so this is not an OS-level
    /// read-only handle — just a pool that skips `SCHEMA`.
    pub fn open_reader(db_path: &str) -> Result<Self, StoreError> {
        let manager = SqliteConnectionManager::file(db_path)
            .with_flags(OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_URI);
        let pool = Pool::builder().max_size(8).build(manager)?;
        Ok(Store { pool })
    }

    pub(crate) fn pool(&self) -> &Pool<SqliteConnectionManager> {
        &self.pool
    }
}

/// Serializes a tag map the way it is stored in SQLite TEXT columns; JSON
/// text preserves round-trip equality.
pub fn tags_to_json(tags: &crate::model::Tags) -> String {
    serde_json::to_string(tags).unwrap_or_else(|_| "{}".to_string())
}

pub fn tags_from_json(raw: &str) -> crate::model::Tags {
    serde_json::from_str(raw).unwrap_or_default()
}

//! Persistence writer (C7): turns decoded bus records into store rows with
//! exponential-backoff retry and a bounded failed-batch buffer, mirroring
//! `vantage-worker/worker/persistence.py`'s flush protocol. Runs inside the
//! same task as the consumer poll loop — no cross-task handoff, so a
//! deferred batch simply waits in memory until the next idle tick retries
//! it.

use std::collections::VecDeque;
use std::time::Duration;

use tracing::{error, warn};

use crate::bus::{BusRecord, MetricEnvelope};
use crate::error::StoreError;
use crate::model::Metric;
use crate::store::Store;

const MAX_FLUSH_ATTEMPTS: u32 = 3;
const MAX_FAILED_BATCHES: usize = 100;

/// A batch that failed to persist after exhausting retries, queued for a
/// retry on a later idle tick.
struct FailedBatch {
    metrics: Vec<Metric>,
}

/// A bus record whose payload could not be decoded into a `Metric` at all.
/// Kept verbatim rather than silently dropped, so an operator can inspect
/// what was lost.
pub struct DeadRecord {
    pub offset: i64,
    pub raw: Vec<u8>,
    pub error: String,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FlushOutcome {
    pub inserted: usize,
    pub deferred: usize,
}

/// Owns the failed-batch and dead-record buffers alongside the store
/// handle, so retries and the shutdown drain can reach both.
pub struct PersistenceWriter {
    store: Store,
    failed_batches: VecDeque<FailedBatch>,
    dead_records: VecDeque<DeadRecord>,
}

impl PersistenceWriter {
    pub fn new(store: Store) -> Self {
        PersistenceWriter { store, failed_batches: VecDeque::new(), dead_records: VecDeque::new() }
    }

    pub fn failed_batch_count(&self) -> usize {
        self.failed_batches.len()
    }

    pub fn dead_record_count(&self) -> usize {
        self.dead_records.len()
    }

    /// Decodes `records`, routing span records straight to the trace/span
    /// side-channel (C7's trace extraction) and collecting everything else
    /// for the batch insert. Records that fail to decode go to the
    /// dead-letter queue instead of being dropped.
    pub fn decode_records(&mut self, records: Vec<BusRecord>) -> Vec<Metric> {
        let mut raw_batch = Vec::with_capacity(records.len());
        for record in records {
            match MetricEnvelope::decode(&record.payload) {
                Ok(metric) if metric.is_span_record() => {
                    if let Err(e) = self.store.upsert_span(&metric) {
                        error!(event = "span_persist_failed", error = %e, "failed to persist span record");
                    }
                }
                Ok(metric) => raw_batch.push(metric),
                Err(e) => self.push_dead_record(record.offset, record.payload, e.to_string()),
            }
        }
        raw_batch
    }

    fn push_dead_record(&mut self, offset: i64, raw: Vec<u8>, error: String) {
        warn!(
            event = "envelope_decode_failed",
            offset,
            error = %error,
            "routing undecodable bus record to dead-letter queue"
        );
        if self.dead_records.len() >= MAX_FAILED_BATCHES {
            if let Some(dropped) = self.dead_records.pop_front() {
                error!(
                    event = "dead_record_dropped",
                    offset = dropped.offset,
                    "dead-letter queue full, dropping oldest record"
                );
            }
        }
        self.dead_records.push_back(DeadRecord { offset, raw, error });
    }

    /// Inserts `metrics` with exponential-backoff retry; on exhaustion,
    /// defers the whole batch to the bounded failed-batch buffer rather than
    /// losing it. Invariant: `inserted + deferred == metrics.len()`.
    pub fn flush_batch(&mut self, metrics: Vec<Metric>) -> FlushOutcome {
        if metrics.is_empty() {
            return FlushOutcome::default();
        }
        let batch_size = metrics.len();
        match self.try_insert_with_retry(&metrics) {
            Ok(inserted) => FlushOutcome { inserted, deferred: 0 },
            Err(_) => {
                self.defer_batch(metrics);
                FlushOutcome { inserted: 0, deferred: batch_size }
            }
        }
    }

    /// 2^0, 2^1, 2^2 second backoff, 3 attempts total.
    fn try_insert_with_retry(&self, metrics: &[Metric]) -> Result<usize, StoreError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.store.insert_metrics_batch(metrics) {
                Ok(n) => return Ok(n),
                Err(e) => {
                    if attempt >= MAX_FLUSH_ATTEMPTS {
                        error!(
                            event = "batch_persist_exhausted",
                            attempts = attempt,
                            batch_size = metrics.len(),
                            error = %e,
                            "persistence retries exhausted, deferring batch"
                        );
                        return Err(e);
                    }
                    let backoff = Duration::from_secs(2u64.pow(attempt - 1));
                    warn!(
                        event = "batch_persist_retry",
                        attempt,
                        backoff_secs = backoff.as_secs(),
                        error = %e,
                        "retrying batch persist"
                    );
                    std::thread::sleep(backoff);
                }
            }
        }
    }

    fn defer_batch(&mut self, metrics: Vec<Metric>) {
        if self.failed_batches.len() >= MAX_FAILED_BATCHES {
            if let Some(dropped) = self.failed_batches.pop_front() {
                error!(
                    event = "failed_batch_dropped",
                    batch_size = dropped.metrics.len(),
                    "failed-batch buffer full, dropping oldest batch"
                );
            }
        }
        self.failed_batches.push_back(FailedBatch { metrics });
    }

    /// Retries the oldest deferred batch. Call once per idle tick (an empty
    /// poll with nothing new to persist) as spec'd for C7.
    pub fn retry_oldest_failed_batch(&mut self) -> Option<FlushOutcome> {
        let batch = self.failed_batches.pop_front()?;
        let batch_size = batch.metrics.len();
        match self.try_insert_with_retry(&batch.metrics) {
            Ok(inserted) => Some(FlushOutcome { inserted, deferred: 0 }),
            Err(_) => {
                self.failed_batches.push_front(batch);
                Some(FlushOutcome { inserted: 0, deferred: batch_size })
            }
        }
    }

    /// Final drain on shutdown: one more attempt at every deferred batch;
    /// whatever still fails, and every dead record, is logged as lost.
    pub fn shutdown_drain(&mut self) {
        while let Some(batch) = self.failed_batches.pop_front() {
            if let Err(e) = self.try_insert_with_retry(&batch.metrics) {
                error!(
                    event = "batch_lost_on_shutdown",
                    batch_size = batch.metrics.len(),
                    error = %e,
                    "failed batch could not be persisted during shutdown drain"
                );
            }
        }
        for dead in self.dead_records.drain(..) {
            error!(
                event = "dead_record_lost_on_shutdown",
                offset = dead.offset,
                bytes = dead.raw.len(),
                error = %dead.error,
                "undecodable record discarded at shutdown"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    use crate::model::{HttpFacet, MetricKind, Tags};

    fn temp_store() -> Store {
        let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
        let path = std::env::temp_dir().join(format!("vantage-writer-test-{nanos}.db"));
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
    fn flush_batch_inserts_on_success() {
        let mut writer = PersistenceWriter::new(temp_store());
        let outcome = writer.flush_batch(vec![sample("api", "cpu", 1_000, 1.0)]);
        assert_eq!(outcome.inserted, 1);
        assert_eq!(outcome.deferred, 0);
        assert_eq!(writer.failed_batch_count(), 0);
    }

    #[test]
    fn flush_batch_of_empty_vec_is_a_noop() {
        let mut writer = PersistenceWriter::new(temp_store());
        let outcome = writer.flush_batch(Vec::new());
        assert_eq!(outcome.inserted, 0);
        assert_eq!(outcome.deferred, 0);
    }

    #[test]
    fn decode_records_routes_undecodable_payloads_to_dead_letter_queue() {
        let mut writer = PersistenceWriter::new(temp_store());
        let records = vec![BusRecord {
            offset: 1,
            partition_key: "api".into(),
            payload: b"not json".to_vec(),
            produced_at_ms: 0,
        }];
        let decoded = writer.decode_records(records);
        assert!(decoded.is_empty());
        assert_eq!(writer.dead_record_count(), 1);
    }

    #[test]
    fn decode_records_separates_spans_from_raw_metrics() {
        let mut writer = PersistenceWriter::new(temp_store());
        let metric = sample("api", "http.request.duration", 1_000, 5.0);
        let payload = MetricEnvelope::encode(&metric).unwrap();
        let records = vec![BusRecord { offset: 1, partition_key: "api".into(), payload, produced_at_ms: 0 }];
        let decoded = writer.decode_records(records);
        assert_eq!(decoded.len(), 1);
        assert_eq!(writer.dead_record_count(), 0);
    }

    #[test]
    fn retry_oldest_failed_batch_returns_none_when_empty() {
        let mut writer = PersistenceWriter::new(temp_store());
        assert!(writer.retry_oldest_failed_batch().is_none());
    }

    #[test]
    fn shutdown_drain_clears_dead_records() {
        let mut writer = PersistenceWriter::new(temp_store());
        writer.push_dead_record(1, b"bad".to_vec(), "decode failed".into());
        writer.shutdown_drain();
        assert_eq!(writer.dead_record_count(), 0);
    }
}

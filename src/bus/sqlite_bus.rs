use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{BusRecord, LogBusConsumer, LogBusProducer};
use crate::error::BusError;

const MAX_PRODUCE_ATTEMPTS: u32 = 3;
const POLL_STEP: Duration = Duration::from_millis(25);

struct Pending {
    partition_key: String,
    payload: Vec<u8>,
    ack: oneshot::Sender<Result<i64, BusError>>,
}

struct Buffer {
    pending: Vec<Pending>,
    bytes: usize,
}

/// Durable partitioned log backed by SQLite: an append-only `bus_log` table
/// plus one committed offset per consumer group. See module docs for why
/// this stands in for an externally operated log-bus implementation.
pub struct SqliteBus {
    pool: Pool<SqliteConnectionManager>,
    consumer_group: String,
    buffer: Arc<Mutex<Buffer>>,
    linger: Duration,
    byte_cap: usize,
    closed: Arc<AtomicBool>,
    produced_since_flush: Arc<AtomicUsize>,
}

impl SqliteBus {
    pub fn open(
        db_path: &str,
        consumer_group: &str,
        linger: Duration,
        byte_cap: usize,
    ) -> Result<Self, BusError> {
        let manager = SqliteConnectionManager::file(db_path);
        let pool = Pool::new(manager).map_err(|e| BusError::Transient(e.to_string()))?;
        {
            let conn = pool.get().map_err(|e| BusError::Transient(e.to_string()))?;
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS bus_log (
                    offset INTEGER PRIMARY KEY AUTOINCREMENT,
                    partition_key TEXT NOT NULL,
                    payload BLOB NOT NULL,
                    produced_at_ms INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_bus_log_partition ON bus_log(partition_key);
                CREATE TABLE IF NOT EXISTS bus_offsets (
                    consumer_group TEXT PRIMARY KEY,
                    committed_offset INTEGER NOT NULL
                );",
            )
            .map_err(|e| BusError::Transient(e.to_string()))?;
        }

        let bus = SqliteBus {
            pool,
            consumer_group: consumer_group.to_string(),
            buffer: Arc::new(Mutex::new(Buffer { pending: Vec::new(), bytes: 0 })),
            linger,
            byte_cap,
            closed: Arc::new(AtomicBool::new(false)),
            produced_since_flush: Arc::new(AtomicUsize::new(0)),
        };
        bus.spawn_linger_flusher();
        Ok(bus)
    }

    fn spawn_linger_flusher(&self) {
        let pool = self.pool.clone();
        let buffer = self.buffer.clone();
        let linger = self.linger;
        let closed = self.closed.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(linger);
            loop {
                tick.tick().await;
                if closed.load(Ordering::Relaxed) {
                    let mut guard = buffer.lock().await;
                    if guard.pending.is_empty() {
                        break;
                    }
                    let batch = std::mem::take(&mut guard.pending);
                    guard.bytes = 0;
                    drop(guard);
                    flush_batch(&pool, batch).await;
                    break;
                }
                let mut guard = buffer.lock().await;
                if guard.pending.is_empty() {
                    continue;
                }
                let batch = std::mem::take(&mut guard.pending);
                guard.bytes = 0;
                drop(guard);
                flush_batch(&pool, batch).await;
            }
        });
    }

    async fn committed_offset(&self) -> Result<i64, BusError> {
        let pool = self.pool.clone();
        let group = self.consumer_group.clone();
        tokio::task::spawn_blocking(move || -> Result<i64, BusError> {
            let conn = pool.get().map_err(|e| BusError::Transient(e.to_string()))?;
            conn.query_row(
                "SELECT committed_offset FROM bus_offsets WHERE consumer_group = ?1",
                [&group],
                |row| row.get::<_, i64>(0),
            )
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(0),
                other => Err(BusError::Transient(other.to_string())),
            })
        })
        .await
        .map_err(|e| BusError::Transient(e.to_string()))?
    }
}

async fn flush_batch(pool: &Pool<SqliteConnectionManager>, batch: Vec<Pending>) {
    if batch.is_empty() {
        return;
    }
    let pool = pool.clone();
    let (keys, payloads): (Vec<String>, Vec<Vec<u8>>) = batch
        .iter()
        .map(|p| (p.partition_key.clone(), p.payload.clone()))
        .unzip();
    let now_ms = crate::clock::now_ms();

    let mut attempt = 0;
    loop {
        attempt += 1;
        let pool = pool.clone();
        let keys = keys.clone();
        let payloads = payloads.clone();
        let result = tokio::task::spawn_blocking(move || -> Result<Vec<i64>, BusError> {
            let mut conn = pool.get().map_err(|e| BusError::Transient(e.to_string()))?;
            let tx = conn.transaction().map_err(|e| BusError::Transient(e.to_string()))?;
            let mut offsets = Vec::with_capacity(keys.len());
            for (key, payload) in keys.iter().zip(payloads.iter()) {
                tx.execute(
                    "INSERT INTO bus_log (partition_key, payload, produced_at_ms) VALUES (?1, ?2, ?3)",
                    rusqlite::params![key, payload, now_ms],
                )
                .map_err(|e| BusError::Transient(e.to_string()))?;
                offsets.push(tx.last_insert_rowid());
            }
            tx.commit().map_err(|e| BusError::Transient(e.to_string()))?;
            Ok(offsets)
        })
        .await
        .map_err(|e| BusError::Transient(e.to_string()));

        match result {
            Ok(Ok(offsets)) => {
                for (pending, offset) in batch.into_iter().zip(offsets.into_iter()) {
                    let _ = pending.ack.send(Ok(offset));
                }
                return;
            }
            Ok(Err(err)) | Err(err) => {
                if attempt >= MAX_PRODUCE_ATTEMPTS {
                    warn!(event = "bus_produce_failed", attempts = attempt, error = %err, "bus produce exhausted retries");
                    for pending in batch {
                        let _ = pending.ack.send(Err(BusError::Transient(err.to_string())));
                    }
                    return;
                }
                let backoff = Duration::from_millis(50 * 2u64.pow(attempt - 1));
                debug!(event = "bus_produce_retry", attempt, backoff_ms = backoff.as_millis() as u64, "retrying bus flush");
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

#[async_trait]
impl LogBusProducer for SqliteBus {
    async fn produce(&self, partition_key: &str, payload: Vec<u8>) -> Result<i64, BusError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(BusError::Closed);
        }
        const MAX_PAYLOAD_BYTES: usize = 1_000_000;
        if payload.len() > MAX_PAYLOAD_BYTES {
            return Err(BusError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_BYTES,
            });
        }

        let (tx, rx) = oneshot::channel();
        let should_flush_now = {
            let mut guard = self.buffer.lock().await;
            guard.bytes += payload.len();
            guard.pending.push(Pending {
                partition_key: partition_key.to_string(),
                payload,
                ack: tx,
            });
            self.produced_since_flush.fetch_add(1, Ordering::Relaxed);
            guard.bytes >= self.byte_cap
        };

        if should_flush_now {
            let mut guard = self.buffer.lock().await;
            let batch = std::mem::take(&mut guard.pending);
            guard.bytes = 0;
            drop(guard);
            flush_batch(&self.pool, batch).await;
        }

        rx.await.map_err(|_| BusError::Transient("producer task dropped ack".into()))?
    }

    async fn flush(&self) -> Result<(), BusError> {
        let mut guard = self.buffer.lock().await;
        let batch = std::mem::take(&mut guard.pending);
        guard.bytes = 0;
        drop(guard);
        flush_batch(&self.pool, batch).await;
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), BusError> {
        self.closed.store(true, Ordering::Relaxed);
        let mut guard = self.buffer.lock().await;
        let batch = std::mem::take(&mut guard.pending);
        guard.bytes = 0;
        drop(guard);
        flush_batch(&self.pool, batch).await;
        Ok(())
    }
}

#[async_trait]
impl LogBusConsumer for SqliteBus {
    async fn poll(&self, timeout_ms: u64, max_records: usize) -> Result<Vec<BusRecord>, BusError> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            let committed = self.committed_offset().await?;
            let pool = self.pool.clone();
            let limit = max_records as i64;
            let rows = tokio::task::spawn_blocking(move || -> Result<Vec<BusRecord>, BusError> {
                let conn = pool.get().map_err(|e| BusError::Transient(e.to_string()))?;
                let mut stmt = conn
                    .prepare(
                        "SELECT offset, partition_key, payload, produced_at_ms FROM bus_log
                         WHERE offset > ?1 ORDER BY offset LIMIT ?2",
                    )
                    .map_err(|e| BusError::Transient(e.to_string()))?;
                let rows = stmt
                    .query_map(rusqlite::params![committed, limit], |row| {
                        Ok(BusRecord {
                            offset: row.get(0)?,
                            partition_key: row.get(1)?,
                            payload: row.get(2)?,
                            produced_at_ms: row.get(3)?,
                        })
                    })
                    .map_err(|e| BusError::Transient(e.to_string()))?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row.map_err(|e| BusError::Transient(e.to_string()))?);
                }
                Ok(out)
            })
            .await
            .map_err(|e| BusError::Transient(e.to_string()))??;

            if !rows.is_empty() || Instant::now() >= deadline {
                return Ok(rows);
            }
            tokio::time::sleep(POLL_STEP).await;
        }
    }

    async fn commit(&self, offset: i64) -> Result<(), BusError> {
        let pool = self.pool.clone();
        let group = self.consumer_group.clone();
        tokio::task::spawn_blocking(move || -> Result<(), BusError> {
            let conn = pool.get().map_err(|e| BusError::Transient(e.to_string()))?;
            conn.execute(
                "INSERT INTO bus_offsets (consumer_group, committed_offset) VALUES (?1, ?2)
                 ON CONFLICT(consumer_group) DO UPDATE SET committed_offset = excluded.committed_offset",
                rusqlite::params![group, offset],
            )
            .map_err(|e| BusError::Transient(e.to_string()))?;
            Ok(())
        })
        .await
        .map_err(|e| BusError::Transient(e.to_string()))?
    }

    async fn lag(&self) -> Result<u64, BusError> {
        let committed = self.committed_offset().await?;
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || -> Result<u64, BusError> {
            let conn = pool.get().map_err(|e| BusError::Transient(e.to_string()))?;
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM bus_log WHERE offset > ?1",
                    [committed],
                    |row| row.get(0),
                )
                .map_err(|e| BusError::Transient(e.to_string()))?;
            Ok(count.max(0) as u64)
        })
        .await
        .map_err(|e| BusError::Transient(e.to_string()))?
    }
}

//! Stream-processing worker: the sole writer to the store. Consumes the
//! log-bus, persists batches (routing span records to `traces`/`spans`),
//! and runs the periodic downsampling and alerting passes.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vantage::alert::{AlertEngine, Sensitivity};
use vantage::backpressure::{BackpressureConfig, BackpressureController};
use vantage::bus::{LogBusConsumer, SqliteBus};
use vantage::downsample::DownsamplingEngine;
use vantage::prometheus::PrometheusExporter;
use vantage::store::Store;
use vantage::writer::PersistenceWriter;

/// Vantage worker — consumes the log-bus, persists metrics/traces, and runs
/// the downsampling and alerting background passes.
#[derive(Parser)]
#[command(name = "vantage-worker", about = "Vantage stream-processing worker")]
struct Args {
    #[arg(long, env = "VANTAGE_DB_PATH", default_value = "vantage.db")]
    db_path: String,

    /// Metrics/health HTTP bind address
    #[arg(long, env = "VANTAGE_WORKER_HTTP_ADDR", default_value = "0.0.0.0:8081")]
    http_addr: String,

    /// Poll timeout per bus poll, in milliseconds
    #[arg(long, env = "VANTAGE_POLL_TIMEOUT_MS", default_value_t = 1000)]
    poll_timeout_ms: u64,

    /// How often to run the downsampling engine, in seconds
    #[arg(long, env = "VANTAGE_DOWNSAMPLE_INTERVAL_SECS", default_value_t = 3600)]
    downsample_interval_seconds: u64,

    /// How often to re-evaluate alert thresholds, in seconds
    #[arg(long, env = "VANTAGE_ALERT_INTERVAL_SECS", default_value_t = 60)]
    alert_interval_seconds: u64,

    #[arg(long, env = "VANTAGE_ALERT_SENSITIVITY", default_value = "medium")]
    alert_sensitivity: String,
}

fn parse_sensitivity(raw: &str) -> Sensitivity {
    match raw.to_lowercase().as_str() {
        "low" => Sensitivity::Low,
        "high" => Sensitivity::High,
        "very_high" | "very-high" => Sensitivity::VeryHigh,
        _ => Sensitivity::Medium,
    }
}

struct AppState {
    metrics: PrometheusExporter,
}

type SharedState = Arc<AppState>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vantage_worker=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let store = Store::open_writer(&args.db_path)?;
    let bus = Arc::new(SqliteBus::open(
        &args.db_path,
        "worker",
        Duration::from_millis(200),
        256 * 1024,
    )?);

    let metrics = PrometheusExporter::new("vantage_worker");
    let queue_depth_gauge = metrics.gauge("queue_depth", "bus records produced but not yet committed");
    let persisted_counter = metrics.counter("metrics_persisted_total", "total metrics persisted by the writer");
    let downsample_counter = metrics.counter("downsample_runs_total", "total downsampling passes run");
    let alert_counter = metrics.counter("alerts_triggered_total", "total alerts newly triggered");

    let state: SharedState = Arc::new(AppState { metrics });

    // Persistence loop: single writer, backpressure-aware batch pulling.
    // The writer's failed-batch/dead-record buffers live in this task alone
    // and travel in and out of `spawn_blocking` with every round so a
    // deferred batch survives to the next idle tick without any cross-task
    // handoff.
    let writer_bus = bus.clone();
    let persistence_store = store.clone();
    let poll_timeout_ms = args.poll_timeout_ms;
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let persistence_task = tokio::spawn(async move {
        let backpressure = BackpressureController::new(BackpressureConfig::default());
        let recovery_store = persistence_store.clone();
        let mut writer = PersistenceWriter::new(persistence_store);
        loop {
            if shutdown_rx.try_recv().is_ok() {
                break;
            }

            let lag = match writer_bus.lag().await {
                Ok(lag) => lag,
                Err(e) => {
                    error!(event = "bus_lag_query_failed", error = %e, "failed to read bus lag");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };
            queue_depth_gauge.set(lag as f64, &[]);
            let decision = backpressure.evaluate(lag);
            if decision.delay > Duration::ZERO {
                tokio::time::sleep(decision.delay).await;
            }

            let records = match writer_bus.poll(poll_timeout_ms, decision.batch_size).await {
                Ok(records) => records,
                Err(e) => {
                    error!(event = "bus_poll_failed", error = %e, "failed to poll bus");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            if records.is_empty() {
                // Idle tick: nothing new arrived, so this is exactly when
                // the oldest deferred batch (if any) gets another shot.
                writer = tokio::task::spawn_blocking(move || {
                    if let Some(outcome) = writer.retry_oldest_failed_batch() {
                        if outcome.inserted > 0 {
                            info!(event = "failed_batch_retried", inserted = outcome.inserted, "deferred batch persisted on retry");
                        }
                    }
                    writer
                })
                .await
                .unwrap_or_else(|e| {
                    error!(event = "failed_batch_retry_panicked", error = %e, "idle-tick retry task panicked");
                    PersistenceWriter::new(recovery_store.clone())
                });
                continue;
            }

            let max_offset = records.last().map(|r| r.offset).unwrap_or(0);
            let (persisted_writer, outcome) = tokio::task::spawn_blocking(move || {
                let raw_batch = writer.decode_records(records);
                let outcome = writer.flush_batch(raw_batch);
                (writer, outcome)
            })
            .await
            .unwrap_or_else(|e| {
                error!(event = "metrics_persist_panicked", error = %e, "metrics persist task panicked");
                (PersistenceWriter::new(recovery_store.clone()), Default::default())
            });
            writer = persisted_writer;

            if outcome.inserted > 0 {
                persisted_counter.inc_by(outcome.inserted as f64, &[]);
            }
            if outcome.deferred > 0 {
                warn!(
                    event = "batch_deferred",
                    deferred = outcome.deferred,
                    pending_failed_batches = writer.failed_batch_count(),
                    "batch persist failed after retries, deferred for idle-tick retry"
                );
            }

            if let Err(e) = writer_bus.commit(max_offset).await {
                error!(event = "bus_commit_failed", error = %e, "failed to commit bus offset");
            }
        }

        info!(event = "persistence_shutdown_drain", pending = writer.failed_batch_count(), "draining persistence writer before exit");
        tokio::task::spawn_blocking(move || writer.shutdown_drain()).await.ok();
    });

    // Downsampling pass: periodic, independent of ingest rate.
    let downsample_store = store.clone();
    let downsample_interval = Duration::from_secs(args.downsample_interval_seconds);
    let downsample_task = tokio::spawn(async move {
        let mut tick = tokio::time::interval(downsample_interval);
        loop {
            tick.tick().await;
            let store_for_pass = downsample_store.clone();
            match tokio::task::spawn_blocking(move || DownsamplingEngine::new(store_for_pass).run_once()).await {
                Ok(Ok(stats)) => {
                    downsample_counter.inc(&[]);
                    info!(
                        event = "downsample_pass_complete",
                        processed = stats.metrics_processed,
                        downsampled = stats.metrics_downsampled,
                        storage_saved_bytes = stats.storage_saved_bytes,
                        "downsampling pass complete"
                    );
                }
                Ok(Err(e)) => error!(event = "downsample_pass_failed", error = %e, "downsampling pass failed"),
                Err(e) => error!(event = "downsample_pass_panicked", error = %e, "downsampling task panicked"),
            }
        }
    });

    // Alert evaluation pass: re-check every active service/metric pair.
    let alert_store = store.clone();
    let alert_interval = Duration::from_secs(args.alert_interval_seconds);
    let sensitivity = parse_sensitivity(&args.alert_sensitivity);
    let alert_task = tokio::spawn(async move {
        let mut tick = tokio::time::interval(alert_interval);
        loop {
            tick.tick().await;
            let store_for_pass = alert_store.clone();
            let outcome = tokio::task::spawn_blocking(move || {
                let engine = AlertEngine::new(store_for_pass.clone(), sensitivity);
                let pairs = store_for_pass.list_service_metric_pairs(vantage::clock::now_ms() - 3_600_000)?;
                let mut triggered = Vec::new();
                for (service_name, metric_name) in pairs {
                    if let Some(alert) = engine.evaluate_metrics(&service_name, &metric_name)? {
                        triggered.push(alert);
                    }
                }
                Ok::<_, vantage::error::StoreError>(triggered)
            })
            .await;

            match outcome {
                Ok(Ok(triggered)) => {
                    for alert in triggered {
                        alert_counter.inc(&[("severity", alert_severity_label(alert.severity))]);
                        warn!(
                            event = "alert_triggered",
                            service_name = %alert.service_name,
                            metric_name = %alert.metric_name,
                            severity = ?alert.severity,
                            "new alert triggered"
                        );
                    }
                }
                Ok(Err(e)) => error!(event = "alert_pass_failed", error = %e, "alert evaluation pass failed"),
                Err(e) => error!(event = "alert_pass_panicked", error = %e, "alert evaluation task panicked"),
            }
        }
    });

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state);

    info!("worker health/metrics endpoint listening on {}", args.http_addr);
    let listener = tokio::net::TcpListener::bind(&args.http_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!(event = "worker_shutdown", "signalling persistence writer to finish its current batch and drain");
        })
        .await?;

    // Graceful shutdown (spec §5): the consumer finishes its current batch
    // and commits, then the persistence writer drains, then periodic tasks
    // are cancelled at their next sleep boundary. A bounded timeout forces
    // exit rather than hanging forever on a stuck drain.
    let _ = shutdown_tx.send(());
    if tokio::time::timeout(Duration::from_secs(30), persistence_task).await.is_err() {
        warn!(event = "persistence_shutdown_timeout", "persistence drain did not finish within the shutdown timeout");
    }
    downsample_task.abort();
    alert_task.abort();
    Ok(())
}

fn alert_severity_label(severity: vantage::model::Severity) -> &'static str {
    match severity {
        vantage::model::Severity::Info => "info",
        vantage::model::Severity::Warning => "warning",
        vantage::model::Severity::Critical => "critical",
    }
}

async fn health_handler() -> &'static str {
    "ok"
}

async fn metrics_handler(State(state): State<SharedState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.generate_text_format(),
    )
}

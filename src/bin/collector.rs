//! Ingest API: the HTTP front door agents POST metric batches to. Validates,
//! rate-limits, guards the bus producer with a circuit breaker, and hands
//! validated metrics to the log-bus for the worker to persist.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{ConnectInfo, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vantage::auth::ApiKeyAuth;
use vantage::breaker::{CircuitBreaker, CircuitBreakerConfig};
use vantage::bus::{LogBusProducer, MetricEnvelope, SqliteBus};
use vantage::clock::now_ms;
use vantage::error::ApiError;
use vantage::model::MetricBatch;
use vantage::prometheus::PrometheusExporter;
use vantage::ratelimit::{is_exempt_path, RateLimiter, RateLimiterConfig};
use vantage::store::Store;

/// Vantage ingest API — receives metric batches from agents and forwards
/// them to the log-bus for the worker to persist.
#[derive(Parser)]
#[command(name = "vantage-collector", about = "Vantage metrics ingest API")]
struct Args {
    /// HTTP bind address
    #[arg(long, env = "VANTAGE_HTTP_ADDR", default_value = "0.0.0.0:8080")]
    http_addr: String,

    /// SQLite database path, shared with the worker and query API
    #[arg(long, env = "VANTAGE_DB_PATH", default_value = "vantage.db")]
    db_path: String,

    /// Require the `X-API-Key` header on every request
    #[arg(long, env = "VANTAGE_AUTH_ENABLED", default_value_t = false)]
    auth_enabled: bool,

    /// Shared secret checked against `X-API-Key` when auth is enabled
    #[arg(long, env = "VANTAGE_API_KEY")]
    api_key: Option<String>,

    #[arg(long, env = "VANTAGE_RATE_LIMIT_MAX", default_value_t = 1000)]
    rate_limit_max_requests: u32,

    #[arg(long, env = "VANTAGE_RATE_LIMIT_WINDOW_SECS", default_value_t = 60)]
    rate_limit_window_seconds: u64,
}

struct AppState {
    bus: SqliteBus,
    breaker: CircuitBreaker,
    limiter: RateLimiter,
    store: Store,
    metrics: PrometheusExporter,
    ingest_counter: Arc<vantage::prometheus::Counter>,
    rejected_counter: Arc<vantage::prometheus::Counter>,
}

type SharedState = Arc<AppState>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vantage_collector=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let auth = ApiKeyAuth::new(args.auth_enabled, args.api_key.clone())?;

    let store = Store::open_reader(&args.db_path)?;
    let bus = SqliteBus::open(&args.db_path, "worker", Duration::from_millis(200), 256 * 1024)?;
    let breaker = CircuitBreaker::new(CircuitBreakerConfig::default());
    let limiter = RateLimiter::new(RateLimiterConfig {
        max_requests: args.rate_limit_max_requests,
        window_seconds: args.rate_limit_window_seconds,
    });
    let metrics = PrometheusExporter::new("vantage_collector");
    let ingest_counter = metrics.counter("metrics_ingested_total", "total metrics accepted for ingest");
    let rejected_counter = metrics.counter("metrics_rejected_total", "total metrics rejected at ingest");

    let state: SharedState = Arc::new(AppState {
        bus,
        breaker,
        limiter,
        store,
        metrics,
        ingest_counter,
        rejected_counter,
    });

    let rate_limit_state = state.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(300));
        loop {
            tick.tick().await;
            rate_limit_state.limiter.evict_stale();
        }
    });

    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    let mut app = Router::new()
        .route("/v1/metrics", post(ingest_handler))
        .route("/v1/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), rate_limit_middleware));

    if args.auth_enabled {
        app = app.route_layer(middleware::from_fn_with_state(auth, vantage::auth::require_api_key));
    }

    let app = app
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/live", get(live_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    info!("ingest API listening on {}", args.http_addr);
    let listener = tokio::net::TcpListener::bind(&args.http_addr).await?;
    let shutdown_state = state.clone();
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!(event = "collector_shutdown", "draining producer before exit");
            if let Err(e) = shutdown_state.bus.shutdown().await {
                warn!(event = "collector_shutdown_flush_failed", error = %e, "producer drain failed during shutdown");
            }
        })
        .await?;
    Ok(())
}

/// Overall status plus per-dependency state (mirrors spec.md §4.4: "`/health`
/// returns overall status and per-dependency state (producer connection,
/// self)").
async fn health_handler(State(state): State<SharedState>) -> Response {
    let breaker_state = state.breaker.state();
    let producer_up = breaker_state != vantage::breaker::CircuitState::Open;
    let status = if producer_up { "ok" } else { "degraded" };
    let code = if producer_up { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (
        code,
        Json(serde_json::json!({
            "status": status,
            "dependencies": {
                "producer": { "connected": producer_up, "circuit_state": format!("{:?}", breaker_state) },
                "self": { "status": "ok" },
            },
        })),
    )
        .into_response()
}

/// 200 only when the producer is connected and the breaker is not open
/// (spec.md §4.4); otherwise 503 so orchestrators stop sending traffic.
async fn ready_handler(State(state): State<SharedState>) -> Response {
    match state.breaker.state() {
        vantage::breaker::CircuitState::Open => {
            ApiError::CircuitOpen(vantage::error::CircuitError::Open { retry_after_secs: 60 }).into_response()
        }
        _ => (StatusCode::OK, "ready").into_response(),
    }
}

/// Always 200 unless the process is terminating — liveness has no
/// dependency on the bus or breaker.
async fn live_handler() -> &'static str {
    "ok"
}

async fn metrics_handler(State(state): State<SharedState>) -> Response {
    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.generate_text_format(),
    )
        .into_response()
}

/// Rejects requests over the per-client-IP limit before they reach the
/// handler; exempt paths (health checks, the scrape endpoint) bypass it.
async fn rate_limit_middleware(
    State(state): State<SharedState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: axum::extract::Request,
    next: Next,
) -> Response {
    if is_exempt_path(request.uri().path()) {
        return next.run(request).await;
    }
    let decision = state.limiter.check(&addr.ip().to_string());
    if !decision.allowed {
        return ApiError::RateLimited { retry_after_secs: decision.retry_after_secs }.into_response();
    }
    next.run(request).await
}

const TRACE_ID_HEADER: &str = "x-vantage-trace-id";
const SPAN_ID_HEADER: &str = "x-vantage-span-id";

/// Validates the batch, then produces each metric onto the bus guarded by
/// the circuit breaker. A span-record metric and a regular sample are both
/// just `Metric`s on the wire — the worker routes them on the way in.
///
/// Per spec.md §4.4: a breaker-open batch fails fast with no bus I/O
/// attempted (503); otherwise every metric is produced independently and
/// tallied into `accepted`/`rejected` so one bad record doesn't sink the
/// whole batch (at-least-once duplication downstream is tolerated).
async fn ingest_handler(
    State(state): State<SharedState>,
    headers: axum::http::HeaderMap,
    Json(mut batch): Json<MetricBatch>,
) -> Result<Response, ApiError> {
    batch.validate()?;

    let now = now_ms();
    for metric in &batch.metrics {
        metric.validate(now)?;
    }

    let header_trace_id = headers.get(TRACE_ID_HEADER).and_then(|v| v.to_str().ok()).map(str::to_string);
    let header_span_id = headers.get(SPAN_ID_HEADER).and_then(|v| v.to_str().ok()).map(str::to_string);
    for metric in &mut batch.metrics {
        if metric.trace_id.is_none() {
            metric.trace_id = header_trace_id.clone();
        }
        if metric.span_id.is_none() {
            metric.span_id = header_span_id.clone();
        }
    }

    state.breaker.before_call()?;

    let metrics_received = batch.metrics.len();
    let mut accepted = 0usize;
    let mut errors: Vec<String> = Vec::new();

    for metric in &batch.metrics {
        let result = match MetricEnvelope::encode(metric) {
            Ok(payload) => state.bus.produce(&batch.service_name, payload).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(_) => {
                accepted += 1;
                state.breaker.on_success();
            }
            Err(e) => {
                state.breaker.on_failure();
                state.rejected_counter.inc(&[("reason", "bus_produce_failed")]);
                warn!(
                    event = "ingest_produce_failed",
                    service_name = %batch.service_name,
                    metric_name = %metric.metric_name,
                    error = %e,
                    "failed to produce metric to bus"
                );
                errors.push(format!("{}: {}", metric.metric_name, e));
            }
        }
    }

    if let Err(e) = state.bus.flush().await {
        warn!(event = "ingest_flush_failed", error = %e, "producer flush failed after batch");
    }

    let rejected = metrics_received - accepted;
    let status = if rejected == 0 {
        "accepted"
    } else if accepted == 0 {
        "rejected"
    } else {
        "partial"
    };

    state.ingest_counter.inc_by(accepted as f64, &[("service_name", &batch.service_name)]);
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "status": status,
            "metrics_received": metrics_received,
            "metrics_accepted": accepted,
            "metrics_rejected": rejected,
            "errors": errors,
        })),
    )
        .into_response())
}

/// Lightweight ingest summary read straight from the store (the
/// `query_log`/metrics tables the worker has already written), independent
/// of bus lag.
async fn stats_handler(State(state): State<SharedState>) -> Result<Json<serde_json::Value>, ApiError> {
    let services = state.store.list_services()?;
    let active_alerts = state.store.list_active_alerts(None)?;
    Ok(Json(serde_json::json!({
        "services": services,
        "active_alert_count": active_alerts.len(),
        "circuit_state": format!("{:?}", state.breaker.state()),
    })))
}

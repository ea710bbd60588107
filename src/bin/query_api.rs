//! Query API: VQL execution, comparisons, health scoring, alerts and trace
//! reads, plus a `/ws/metrics` push feed. Read-only against the store (it
//! still appends to `query_log` on every read) and runs as its own bus
//! consumer group purely to fan metric arrivals out to WebSocket clients.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::middleware;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vantage::analytics::{HealthScoreCalculator, MetricComparison};
use vantage::auth::ApiKeyAuth;
use vantage::bus::{LogBusConsumer, MetricEnvelope, SqliteBus};
use vantage::clock::now_ms;
use vantage::error::ApiError;
use vantage::model::Severity;
use vantage::prometheus::PrometheusExporter;
use vantage::store::Store;
use vantage::vql;

/// Vantage query API — VQL, comparisons, health scores, alerts and traces.
#[derive(Parser)]
#[command(name = "vantage-query-api", about = "Vantage query and analytics API")]
struct Args {
    #[arg(long, env = "VANTAGE_HTTP_ADDR", default_value = "0.0.0.0:8082")]
    http_addr: String,

    #[arg(long, env = "VANTAGE_DB_PATH", default_value = "vantage.db")]
    db_path: String,

    #[arg(long, env = "VANTAGE_AUTH_ENABLED", default_value_t = false)]
    auth_enabled: bool,

    #[arg(long, env = "VANTAGE_API_KEY")]
    api_key: Option<String>,
}

struct AppState {
    store: Store,
    metrics: PrometheusExporter,
    broadcast: broadcast::Sender<Arc<String>>,
    query_counter: Arc<vantage::prometheus::Counter>,
    query_duration: Arc<vantage::prometheus::Histogram>,
}

type SharedState = Arc<AppState>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vantage_query_api=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let auth = ApiKeyAuth::new(args.auth_enabled, args.api_key.clone())?;

    let store = Store::open_reader(&args.db_path)?;
    let metrics = PrometheusExporter::new("vantage_query_api");
    let query_counter = metrics.counter("vql_queries_total", "total VQL queries executed");
    let query_duration =
        metrics.histogram("vql_query_duration_ms", "VQL query execution time", vec![1.0, 5.0, 25.0, 100.0, 500.0]);

    let (broadcast_tx, _) = broadcast::channel::<Arc<String>>(1024);

    let state: SharedState = Arc::new(AppState {
        store,
        metrics,
        broadcast: broadcast_tx,
        query_counter,
        query_duration,
    });

    // Observes the log-bus under its own consumer group purely to fan
    // metric arrivals out over `/ws/metrics`; never competes with the
    // worker's commit for the same offsets.
    let ws_bus = SqliteBus::open(&args.db_path, "query_api_ws", Duration::from_millis(200), 256 * 1024)?;
    let ws_state = state.clone();
    tokio::spawn(async move {
        loop {
            match ws_bus.poll(1000, 200).await {
                Ok(records) if !records.is_empty() => {
                    let max_offset = records.last().map(|r| r.offset).unwrap_or(0);
                    for record in &records {
                        if let Ok(metric) = MetricEnvelope::decode(&record.payload) {
                            if metric.is_span_record() {
                                continue;
                            }
                            let msg = serde_json::json!({
                                "type": "metric",
                                "service_name": metric.service_name,
                                "metric_name": metric.metric_name,
                                "value": metric.value,
                                "timestamp": metric.timestamp,
                            });
                            if let Ok(text) = serde_json::to_string(&msg) {
                                let _ = ws_state.broadcast.send(Arc::new(text));
                            }
                        }
                    }
                    if let Err(e) = ws_bus.commit(max_offset).await {
                        warn!(event = "ws_bus_commit_failed", error = %e, "failed to commit ws observer offset");
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(event = "ws_bus_poll_failed", error = %e, "failed to poll bus for ws feed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    });

    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    let mut app = Router::new()
        .route("/vql/execute", axum::routing::post(vql_handler))
        .route("/vql/examples", get(vql_examples_handler))
        .route("/compare/services", get(compare_services_handler))
        .route("/compare/time-periods", get(compare_periods_handler))
        .route("/health/score/{service_name}", get(health_handler))
        .route("/health/scores", get(all_health_scores_handler))
        .route("/alerts", get(list_alerts_handler))
        .route("/alerts/active", get(list_active_alerts_handler))
        .route("/alerts/summary", get(alert_summary_handler))
        .route("/traces/{trace_id}", get(trace_handler))
        .route("/traces/search", get(search_traces_handler))
        .route("/api/services", get(list_services_handler))
        .route("/api/metrics/timeseries", get(timeseries_handler))
        .route("/api/metrics/aggregated", get(aggregated_handler))
        .route("/ws/metrics", get(ws_handler))
        .route("/metrics", get(metrics_handler));

    if args.auth_enabled {
        app = app.route_layer(middleware::from_fn_with_state(auth, vantage::auth::require_api_key));
    }

    let app = app
        .route("/health", get(simple_health_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    info!("query API listening on {}", args.http_addr);
    let listener = tokio::net::TcpListener::bind(&args.http_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn simple_health_handler() -> &'static str {
    "ok"
}

async fn metrics_handler(State(state): State<SharedState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.generate_text_format(),
    )
}

#[derive(Debug, Deserialize)]
struct VqlRequest {
    query: String,
}

async fn vql_handler(
    State(state): State<SharedState>,
    Json(req): Json<VqlRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let started = now_ms();
    let result = vql::execute(&state.store, &req.query).map_err(ApiError::from)?;
    let elapsed = (now_ms() - started) as f64;
    state.query_counter.inc(&[]);
    state.query_duration.observe(elapsed, &[]);
    Ok(Json(serde_json::json!({
        "rows": result.rows,
        "row_count": result.row_count,
    })))
}

/// A handful of canned queries demonstrating VQL's surface, the way
/// `vantage-api/api/vql.py`'s example endpoint seeds the dashboard's query
/// builder.
async fn vql_examples_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "examples": [
            {
                "name": "Request count by service",
                "query": "SELECT service_name, COUNT(*) FROM metrics GROUP BY service_name ORDER BY COUNT(*) DESC LIMIT 10",
            },
            {
                "name": "Average latency for a service",
                "query": "SELECT AVG(duration_ms) FROM metrics WHERE service_name = 'api' AND metric_name = 'http.request.duration'",
            },
            {
                "name": "Recent errors",
                "query": "SELECT service_name, endpoint, status_code FROM metrics WHERE status_code >= 500 ORDER BY timestamp DESC LIMIT 20",
            },
            {
                "name": "Firing alerts",
                "query": "SELECT service_name, metric_name, severity FROM alerts WHERE status = 'firing' ORDER BY last_triggered DESC LIMIT 20",
            },
            {
                "name": "Error traces",
                "query": "SELECT trace_id, service_name, duration_ms FROM traces WHERE error_flag = 1 ORDER BY start_time DESC LIMIT 20",
            },
        ],
    }))
}

#[derive(Debug, Deserialize)]
struct CompareServicesParams {
    baseline_service: String,
    candidate_service: String,
    metric_name: String,
    time_start: i64,
    time_end: i64,
}

async fn compare_services_handler(
    State(state): State<SharedState>,
    Query(params): Query<CompareServicesParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let comparison = MetricComparison::new(&state.store);
    let result = comparison
        .compare_services(
            &params.baseline_service,
            &params.candidate_service,
            &params.metric_name,
            params.time_start,
            params.time_end,
        )
        .map_err(ApiError::from)?;
    Ok(Json(serde_json::to_value(result).unwrap_or_default()))
}

#[derive(Debug, Deserialize)]
struct ComparePeriodsParams {
    service_name: String,
    metric_name: String,
    baseline_start: i64,
    baseline_end: i64,
    candidate_start: i64,
    candidate_end: i64,
}

async fn compare_periods_handler(
    State(state): State<SharedState>,
    Query(params): Query<ComparePeriodsParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let comparison = MetricComparison::new(&state.store);
    let result = comparison
        .compare_time_periods(
            &params.service_name,
            &params.metric_name,
            params.baseline_start,
            params.baseline_end,
            params.candidate_start,
            params.candidate_end,
        )
        .map_err(ApiError::from)?;
    Ok(Json(serde_json::to_value(result).unwrap_or_default()))
}

#[derive(Debug, Deserialize)]
struct HealthParams {
    #[serde(default = "default_window_seconds")]
    time_window_seconds: u64,
}

fn default_window_seconds() -> u64 {
    3600
}

async fn health_handler(
    State(state): State<SharedState>,
    axum::extract::Path(service_name): axum::extract::Path<String>,
    Query(params): Query<HealthParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let calculator = HealthScoreCalculator::new(&state.store);
    let score = calculator
        .calculate(&service_name, params.time_window_seconds)
        .map_err(ApiError::from)?;
    Ok(Json(serde_json::to_value(score).unwrap_or_default()))
}

/// Health scores for every known service, backing `GET /health/scores`.
async fn all_health_scores_handler(
    State(state): State<SharedState>,
    Query(params): Query<HealthParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let calculator = HealthScoreCalculator::new(&state.store);
    let services = state.store.list_services()?;
    let mut scores = Vec::with_capacity(services.len());
    for service_name in services {
        scores.push(calculator.calculate(&service_name, params.time_window_seconds).map_err(ApiError::from)?);
    }
    Ok(Json(serde_json::json!({ "scores": scores })))
}

#[derive(Debug, Deserialize)]
struct ListAlertsParams {
    service_name: Option<String>,
}

async fn list_alerts_handler(
    State(state): State<SharedState>,
    Query(params): Query<ListAlertsParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let alerts = state.store.list_alerts(params.service_name.as_deref(), 500)?;
    Ok(Json(serde_json::json!({ "alerts": alerts })))
}

async fn list_active_alerts_handler(
    State(state): State<SharedState>,
    Query(params): Query<ListAlertsParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let alerts = state.store.list_active_alerts(params.service_name.as_deref())?;
    Ok(Json(serde_json::json!({ "alerts": alerts })))
}

async fn alert_summary_handler(State(state): State<SharedState>) -> Result<Json<serde_json::Value>, ApiError> {
    let summary = state.store.alert_summary()?;
    let mut by_severity: HashMap<&str, u64> = HashMap::new();
    for (severity, count) in summary {
        by_severity.insert(severity_label(severity), count);
    }
    Ok(Json(serde_json::json!({ "by_severity": by_severity })))
}

fn severity_label(severity: Severity) -> &'static str {
    match severity {
        Severity::Info => "info",
        Severity::Warning => "warning",
        Severity::Critical => "critical",
    }
}

async fn trace_handler(
    State(state): State<SharedState>,
    axum::extract::Path(trace_id): axum::extract::Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let trace = state.store.fetch_trace(&trace_id)?.ok_or(ApiError::Internal("trace not found".into()))?;
    let spans = state.store.fetch_spans_for_trace(&trace_id)?;
    Ok(Json(serde_json::json!({ "trace": trace, "spans": spans })))
}

#[derive(Debug, Deserialize)]
struct SearchTracesParams {
    service_name: String,
    #[serde(default)]
    errors_only: bool,
    #[serde(default = "default_since_ms")]
    since_ms: i64,
    #[serde(default = "default_limit")]
    limit: u32,
}

fn default_since_ms() -> i64 {
    now_ms() - 3_600_000
}

fn default_limit() -> u32 {
    50
}

async fn search_traces_handler(
    State(state): State<SharedState>,
    Query(params): Query<SearchTracesParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let traces =
        state.store.search_traces(&params.service_name, params.errors_only, params.since_ms, params.limit)?;
    Ok(Json(serde_json::json!({ "traces": traces })))
}

async fn list_services_handler(State(state): State<SharedState>) -> Result<Json<serde_json::Value>, ApiError> {
    let services = state.store.list_services()?;
    Ok(Json(serde_json::json!({ "services": services })))
}

#[derive(Debug, Deserialize)]
struct TimeseriesParams {
    service_name: String,
    metric_name: String,
    since_ms: i64,
    until_ms: i64,
}

async fn timeseries_handler(
    State(state): State<SharedState>,
    Query(params): Query<TimeseriesParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let points =
        state.store.fetch_timeseries(&params.service_name, &params.metric_name, params.since_ms, params.until_ms)?;
    let elapsed_ms = 0.0;
    let _ = state.store.record_query(&params.service_name, &params.metric_name, elapsed_ms);
    Ok(Json(serde_json::json!({ "points": points })))
}

async fn aggregated_handler(
    State(state): State<SharedState>,
    Query(params): Query<TimeseriesParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let points =
        state.store.fetch_aggregated(&params.service_name, &params.metric_name, params.since_ms, params.until_ms)?;
    let _ = state.store.record_query(&params.service_name, &params.metric_name, 0.0);
    Ok(Json(serde_json::json!({ "points": points })))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<SharedState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: SharedState) {
    let (mut sender, mut receiver) = socket.split();
    let mut rx = state.broadcast.subscribe();

    loop {
        tokio::select! {
            msg = rx.recv() => {
                match msg {
                    Ok(event) => {
                        if sender.send(Message::Text((*event).clone().into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!(event = "ws_client_lagged", missed = n, "websocket client lagged behind broadcast");
                    }
                    Err(_) => break,
                }
            }
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    _ => {}
                }
            }
        }
    }
}

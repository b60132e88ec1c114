use crate::dns::DnsCache;
use crate::filter::{AggFilter, RawFilter};
use crate::names::{format_bytes, protocol_name};
use crate::record::PacketRecord;
use crate::state::TrafficState;
use crate::storage::Storage;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use ipnet::IpNet;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

const DEFAULT_LIMIT: usize = 100;
const MAX_HISTORY: usize = 1000;

pub struct AppState {
    pub traffic: Arc<TrafficState>,
    pub storage: Arc<Storage>,
    pub dns: Option<Arc<DnsCache>>,
    pub start_time: Instant,
    /// Default for requests that do not pass `hide_local`.
    pub hide_local: bool,
}

// ── Prometheus Metrics ────────────────────────────────────────────────────────

struct Metrics {
    registry: Registry,
    /// Held across `sync` so concurrent scrapes add each delta once.
    sync_lock: Mutex<()>,
    packets_total: Counter,
    bytes_total: Counter,
    ingress_bytes_total: Counter,
    egress_bytes_total: Counter,
    malformed_total: Counter,
    queue_drops_total: Counter,
    storage_errors_total: Counter,
    aggregate_overflow_total: Counter,
    aggregate_entries: Gauge,
}

impl Metrics {
    fn new() -> Self {
        let mut registry = Registry::default();
        let packets_total = Counter::default();
        let bytes_total = Counter::default();
        let ingress_bytes_total = Counter::default();
        let egress_bytes_total = Counter::default();
        let malformed_total = Counter::default();
        let queue_drops_total = Counter::default();
        let storage_errors_total = Counter::default();
        let aggregate_overflow_total = Counter::default();
        let aggregate_entries = Gauge::default();

        registry.register(
            "ionet_packets",
            "Packets seen at the cgroup boundary",
            packets_total.clone(),
        );
        registry.register("ionet_bytes", "Bytes seen at the cgroup boundary", bytes_total.clone());
        registry.register(
            "ionet_ingress_bytes",
            "Bytes received by the cgroup",
            ingress_bytes_total.clone(),
        );
        registry.register(
            "ionet_egress_bytes",
            "Bytes sent by the cgroup",
            egress_bytes_total.clone(),
        );
        registry.register(
            "ionet_malformed_records",
            "Ring buffer samples too short to decode",
            malformed_total.clone(),
        );
        registry.register(
            "ionet_queue_drops",
            "Events dropped because the storage queue was full",
            queue_drops_total.clone(),
        );
        registry.register(
            "ionet_storage_errors",
            "Events lost because the database rejected them",
            storage_errors_total.clone(),
        );
        registry.register(
            "ionet_aggregate_overflow",
            "Events not aggregated because the aggregate table was full",
            aggregate_overflow_total.clone(),
        );
        registry.register(
            "ionet_aggregate_entries",
            "Distinct remote endpoints being tracked",
            aggregate_entries.clone(),
        );

        Self {
            registry,
            sync_lock: Mutex::new(()),
            packets_total,
            bytes_total,
            ingress_bytes_total,
            egress_bytes_total,
            malformed_total,
            queue_drops_total,
            storage_errors_total,
            aggregate_overflow_total,
            aggregate_entries,
        }
    }

    /// Bring the monotonic counters up to the live totals.
    fn sync(&self, traffic: &TrafficState, storage: &Storage) {
        let _guard = self.sync_lock.lock().unwrap_or_else(PoisonError::into_inner);
        sync_counter(&self.packets_total, traffic.total_packets.load(Ordering::Relaxed));
        sync_counter(&self.bytes_total, traffic.total_bytes.load(Ordering::Relaxed));
        sync_counter(&self.ingress_bytes_total, traffic.ingress_bytes.load(Ordering::Relaxed));
        sync_counter(&self.egress_bytes_total, traffic.egress_bytes.load(Ordering::Relaxed));
        sync_counter(&self.malformed_total, traffic.malformed.load(Ordering::Relaxed));
        sync_counter(&self.queue_drops_total, traffic.queue_drops.load(Ordering::Relaxed));
        sync_counter(&self.storage_errors_total, storage.failed_rows());
        sync_counter(
            &self.aggregate_overflow_total,
            traffic.aggregate_overflow.load(Ordering::Relaxed),
        );
        self.aggregate_entries.set(traffic.aggregates.len() as i64);
    }
}

fn sync_counter(counter: &Counter, total: u64) {
    let current = counter.get();
    if total > current {
        counter.inc_by(total - current);
    }
}

// ── Response Types ────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct HealthResponse {
    status: String,
    total_packets: u64,
}

#[derive(Serialize)]
pub struct StatsResponse {
    uptime_seconds: u64,
    total_packets: u64,
    total_bytes: u64,
    ingress_bytes: u64,
    egress_bytes: u64,
    packets_per_second: f64,
    bytes_per_second: f64,
    malformed_records: u64,
    queue_drops: u64,
    storage_errors: u64,
    aggregate_overflow: u64,
    aggregate_entries: usize,
    recent_events: usize,
}

#[derive(Serialize)]
pub struct AggregateRow {
    ip: String,
    port: u16,
    protocol: String,
    count: u64,
    ingress_bytes: u64,
    egress_bytes: u64,
    total_bytes: u64,
    ingress: String,
    egress: String,
    total: String,
    is_local: bool,
    owner: Option<String>,
}

/// Options shared by the listing endpoints. Filter fields are read from the
/// same query string separately.
#[derive(Deserialize, Default)]
pub struct ListParams {
    /// Text form of the filter, e.g. `proto=tcp dport=443`. Wins over the
    /// individual query fields when present.
    q: Option<String>,
    limit: Option<usize>,
    hide_local: Option<bool>,
}

#[derive(Deserialize)]
pub struct HistoryParams {
    limit: Option<usize>,
}

// ── Router ────────────────────────────────────────────────────────────────────

pub fn router(state: Arc<AppState>, allowed_ips: &[String]) -> Router {
    let metrics = Arc::new(Metrics::new());

    let mut app = Router::new()
        .route("/api/health", get(get_health))
        .route("/api/stats", get(get_stats))
        .route("/api/events", get(get_events))
        .route("/api/aggregates", get(get_aggregates))
        .route("/api/history", get(get_history))
        .route("/api/stream", get(ws_handler))
        .route(
            "/metrics",
            get({
                let m = metrics.clone();
                let s = state.clone();
                move || get_metrics(s.clone(), m.clone())
            }),
        );

    // Apply IP allowlist middleware if configured.
    if !allowed_ips.is_empty() {
        let nets: Arc<Vec<IpNet>> = Arc::new(
            allowed_ips
                .iter()
                .filter_map(|s| match s.parse::<IpNet>() {
                    Ok(net) => Some(net),
                    Err(_) => {
                        tracing::warn!("ignoring invalid allowlist entry {:?}", s);
                        None
                    }
                })
                .collect(),
        );
        app = app.layer(middleware::from_fn(move |req, next| {
            let nets = nets.clone();
            ip_allowlist(req, next, nets)
        }));
    }

    app.layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ── IP Allowlist Middleware ────────────────────────────────────────────────────

async fn ip_allowlist(
    req: axum::extract::Request,
    next: middleware::Next,
    allowed: Arc<Vec<IpNet>>,
) -> impl IntoResponse {
    if let Some(connect_info) = req.extensions().get::<ConnectInfo<SocketAddr>>() {
        let ip = connect_info.0.ip();
        if allowed.iter().any(|net| net.contains(&ip)) {
            return next.run(req).await.into_response();
        }
        tracing::debug!("rejected API request from {}", ip);
        return StatusCode::FORBIDDEN.into_response();
    }
    // Served without connect info (tests); nothing to check against.
    next.run(req).await.into_response()
}

// ── Handlers ──────────────────────────────────────────────────────────────────

async fn get_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        total_packets: state.traffic.total_packets.load(Ordering::Relaxed),
    })
}

async fn get_stats(State(state): State<Arc<AppState>>) -> Json<StatsResponse> {
    let traffic = &state.traffic;
    let uptime = state.start_time.elapsed().as_secs();
    let total_packets = traffic.total_packets.load(Ordering::Relaxed);
    let total_bytes = traffic.total_bytes.load(Ordering::Relaxed);

    let per_second = |n: u64| if uptime > 0 { n as f64 / uptime as f64 } else { 0.0 };

    Json(StatsResponse {
        uptime_seconds: uptime,
        total_packets,
        total_bytes,
        ingress_bytes: traffic.ingress_bytes.load(Ordering::Relaxed),
        egress_bytes: traffic.egress_bytes.load(Ordering::Relaxed),
        packets_per_second: per_second(total_packets),
        bytes_per_second: per_second(total_bytes),
        malformed_records: traffic.malformed.load(Ordering::Relaxed),
        queue_drops: traffic.queue_drops.load(Ordering::Relaxed),
        storage_errors: state.storage.failed_rows(),
        aggregate_overflow: traffic.aggregate_overflow.load(Ordering::Relaxed),
        aggregate_entries: traffic.aggregates.len(),
        recent_events: traffic.recent_len(),
    })
}

async fn get_events(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<RawFilter>,
    Query(params): Query<ListParams>,
) -> Json<Vec<PacketRecord>> {
    let filter = match params.q.as_deref() {
        Some(text) => RawFilter::parse(text),
        None => filter,
    };
    let hide_local = params.hide_local.unwrap_or(state.hide_local);
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT);
    Json(state.traffic.recent_events(&filter, hide_local, limit))
}

async fn get_aggregates(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<AggFilter>,
    Query(params): Query<ListParams>,
) -> Json<Vec<AggregateRow>> {
    let filter = match params.q.as_deref() {
        Some(text) => AggFilter::parse(text),
        None => filter,
    };
    let hide_local = params.hide_local.unwrap_or(state.hide_local);
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT);

    let rows = state
        .traffic
        .top_aggregates(&filter, hide_local)
        .into_iter()
        .take(limit)
        .map(|(key, val)| AggregateRow {
            ip: key.ip.to_string(),
            port: key.port,
            protocol: protocol_name(key.protocol),
            count: val.count,
            ingress_bytes: val.ingress_bytes,
            egress_bytes: val.egress_bytes,
            total_bytes: val.total_bytes,
            ingress: format_bytes(val.ingress_bytes),
            egress: format_bytes(val.egress_bytes),
            total: format_bytes(val.total_bytes),
            is_local: val.is_local,
            owner: state.dns.as_ref().map(|dns| dns.label(&key.ip)),
        })
        .collect();
    Json(rows)
}

async fn get_history(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HistoryParams>,
) -> impl IntoResponse {
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_HISTORY);
    match state.storage.query_history(limit) {
        Ok(data) => Json(serde_json::json!(data)).into_response(),
        Err(e) => {
            tracing::error!("history query failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

async fn get_metrics(state: Arc<AppState>, metrics: Arc<Metrics>) -> impl IntoResponse {
    metrics.sync(&state.traffic, &state.storage);

    let mut buf = String::new();
    if let Err(e) = encode(&mut buf, &metrics.registry) {
        tracing::error!("metrics encoding failed: {}", e);
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        buf,
    )
        .into_response()
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

fn stream_snapshot(traffic: &TrafficState) -> serde_json::Value {
    serde_json::json!({
        "total_packets": traffic.total_packets.load(Ordering::Relaxed),
        "total_bytes": traffic.total_bytes.load(Ordering::Relaxed),
        "ingress_bytes": traffic.ingress_bytes.load(Ordering::Relaxed),
        "egress_bytes": traffic.egress_bytes.load(Ordering::Relaxed),
        "aggregate_entries": traffic.aggregates.len(),
    })
}

async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>) {
    let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(1));

    loop {
        interval.tick().await;

        let stats = stream_snapshot(&state.traffic);
        if socket.send(Message::Text(stats.to_string())).await.is_err() {
            break;
        }
    }
}

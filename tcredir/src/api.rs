use crate::kernel::{Channel, KernelStats, KernelTables};
use axum::{
    extract::{ConnectInfo, Path, State},
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
use serde::Serialize;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tcredir::state::TrafficState;
use tcredir_common::TwoTuple;
use tower_http::trace::TraceLayer;

pub struct AppState {
    pub traffic: Arc<TrafficState>,
    pub kernel: Arc<KernelTables>,
    pub channel: Channel,
    pub sentinel: Ipv4Addr,
    pub start_time: Instant,
}

// ── Prometheus Metrics ────────────────────────────────────────────────────────

struct Metrics {
    registry: Registry,
    observed_total: Counter,
    telemetry_lost_total: Counter,
    redirected_total: Counter,
    restored_total: Counter,
    conntrack_full_total: Counter,
    active_flows: Gauge,
    conntrack_entries: Gauge,
}

impl Metrics {
    fn new() -> Self {
        let mut registry = Registry::default();
        let observed_total = Counter::default();
        let telemetry_lost_total = Counter::default();
        let redirected_total = Counter::default();
        let restored_total = Counter::default();
        let conntrack_full_total = Counter::default();
        let active_flows = Gauge::default();
        let conntrack_entries = Gauge::default();

        registry.register(
            "tcredir_observed_packets",
            "Packets reported by the observation hook",
            observed_total.clone(),
        );
        registry.register(
            "tcredir_telemetry_lost",
            "Observation records lost before userspace read them",
            telemetry_lost_total.clone(),
        );
        registry.register(
            "tcredir_redirected_packets",
            "Inbound packets rewritten towards the sentinel",
            redirected_total.clone(),
        );
        registry.register(
            "tcredir_restored_packets",
            "Outbound packets rewritten back to the original server",
            restored_total.clone(),
        );
        registry.register(
            "tcredir_conntrack_full",
            "Connection-track inserts refused because the table was full",
            conntrack_full_total.clone(),
        );
        registry.register(
            "tcredir_active_flows",
            "Observed flows seen within the flow timeout",
            active_flows.clone(),
        );
        registry.register(
            "tcredir_conntrack_entries",
            "Entries currently in the kernel connection-track table",
            conntrack_entries.clone(),
        );

        Self {
            registry,
            observed_total,
            telemetry_lost_total,
            redirected_total,
            restored_total,
            conntrack_full_total,
            active_flows,
            conntrack_entries,
        }
    }
}

/// prometheus-client counters are monotonic, so advance by the delta.
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
    channel: Channel,
    active_flows: usize,
    total_packets: u64,
}

#[derive(Serialize)]
pub struct StatsResponse {
    uptime_seconds: u64,
    sentinel: Ipv4Addr,
    total_packets: u64,
    tcp_packets: u64,
    udp_packets: u64,
    lost_events: u64,
    active_flows: usize,
    packets_per_second: f64,
    kernel: KernelStats,
}

#[derive(Serialize)]
pub struct ConnTrackEntry {
    client: SocketAddrV4,
    server: SocketAddrV4,
}

impl From<(TwoTuple, TwoTuple)> for ConnTrackEntry {
    fn from((client, server): (TwoTuple, TwoTuple)) -> Self {
        Self {
            client: socket_addr(&client),
            server: socket_addr(&server),
        }
    }
}

fn socket_addr(tuple: &TwoTuple) -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::from(tuple.addr), tuple.host_port())
}

// ── Routers ───────────────────────────────────────────────────────────────────

/// The local service redirected connections land on.
pub fn service_router() -> Router {
    Router::new()
        .route("/", get(|| async { "Hello, world!" }))
        .layer(TraceLayer::new_for_http())
}

pub fn router(state: Arc<AppState>, allowed_ips: &[String]) -> Router {
    let metrics = Arc::new(Metrics::new());

    let mut app = Router::new()
        .route("/api/live", get(get_live_stats))
        .route("/api/health", get(get_health))
        .route("/api/stats", get(get_stats))
        .route("/api/conntrack", get(get_conntrack))
        .route("/api/conntrack/:client", get(get_conntrack_entry))
        .route("/metrics", get({
            let m = metrics.clone();
            let s = state.clone();
            move || get_metrics(s.clone(), m.clone())
        }));

    // Apply IP allowlist middleware if configured.
    if !allowed_ips.is_empty() {
        let nets: Arc<Vec<IpNet>> = Arc::new(parse_allowlist(allowed_ips));
        app = app.layer(middleware::from_fn(move |req, next| {
            let nets = nets.clone();
            ip_allowlist(req, next, nets)
        }));
    }

    app.layer(TraceLayer::new_for_http()).with_state(state)
}

fn parse_allowlist(allowed_ips: &[String]) -> Vec<IpNet> {
    allowed_ips
        .iter()
        .filter_map(|s| match s.parse::<IpNet>() {
            Ok(net) => Some(net),
            Err(e) => {
                tracing::warn!("ignoring allowlist entry {:?}: {}", s, e);
                None
            }
        })
        .collect()
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
        tracing::debug!(%ip, "admin API request refused by allowlist");
        return StatusCode::FORBIDDEN.into_response();
    }
    next.run(req).await.into_response()
}

// ── Handlers ──────────────────────────────────────────────────────────────────

async fn get_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        channel: state.channel,
        active_flows: state.traffic.active_flows.load(Ordering::Relaxed),
        total_packets: state.traffic.total_packets.load(Ordering::Relaxed),
    })
}

async fn get_stats(State(state): State<Arc<AppState>>) -> Json<StatsResponse> {
    let uptime = state.start_time.elapsed().as_secs();
    let total_packets = state.traffic.total_packets.load(Ordering::Relaxed);

    let packets_per_second = if uptime > 0 {
        total_packets as f64 / uptime as f64
    } else {
        0.0
    };

    Json(StatsResponse {
        uptime_seconds: uptime,
        sentinel: state.sentinel,
        total_packets,
        tcp_packets: state.traffic.tcp_packets.load(Ordering::Relaxed),
        udp_packets: state.traffic.udp_packets.load(Ordering::Relaxed),
        lost_events: state.traffic.lost_events.load(Ordering::Relaxed),
        active_flows: state.traffic.active_flows.load(Ordering::Relaxed),
        packets_per_second,
        kernel: state.kernel.stats(),
    })
}

async fn get_live_stats(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let mut flows: Vec<_> = state
        .traffic
        .flows
        .iter()
        .map(|entry| {
            let (key, stats) = entry.pair();
            (key.clone(), stats.clone())
        })
        .collect();

    flows.sort_by(|a, b| b.1.packets_count.cmp(&a.1.packets_count));
    flows.truncate(50);

    let flows: Vec<_> = flows
        .into_iter()
        .map(|(flow, stats)| serde_json::json!({ "flow": flow, "stats": stats }))
        .collect();

    Json(serde_json::json!({
        "flows": flows,
        "total_packets": state.traffic.total_packets.load(Ordering::Relaxed),
    }))
}

async fn get_conntrack(State(state): State<Arc<AppState>>) -> Json<Vec<ConnTrackEntry>> {
    Json(
        state
            .kernel
            .conn_track()
            .into_iter()
            .map(ConnTrackEntry::from)
            .collect(),
    )
}

/// Looks up one client, given as `addr:port`.
async fn get_conntrack_entry(
    State(state): State<Arc<AppState>>,
    Path(client): Path<String>,
) -> Result<Json<ConnTrackEntry>, StatusCode> {
    let client: SocketAddrV4 = client.parse().map_err(|_| StatusCode::BAD_REQUEST)?;
    let key = TwoTuple::new(u32::from(*client.ip()), client.port());
    let server = state.kernel.lookup(&key).ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(ConnTrackEntry::from((key, server))))
}

async fn get_metrics(state: Arc<AppState>, metrics: Arc<Metrics>) -> impl IntoResponse {
    let kernel = state.kernel.stats();

    sync_counter(
        &metrics.observed_total,
        state.traffic.total_packets.load(Ordering::Relaxed),
    );
    sync_counter(
        &metrics.telemetry_lost_total,
        state.traffic.lost_events.load(Ordering::Relaxed) + kernel.observed_lost,
    );
    sync_counter(&metrics.redirected_total, kernel.redirected);
    sync_counter(&metrics.restored_total, kernel.restored);
    sync_counter(&metrics.conntrack_full_total, kernel.conn_track_full);
    metrics
        .active_flows
        .set(state.traffic.active_flows.load(Ordering::Relaxed) as i64);
    metrics
        .conntrack_entries
        .set(state.kernel.conn_track().len() as i64);

    let mut buf = String::new();
    if let Err(e) = encode(&mut buf, &metrics.registry) {
        tracing::error!("failed to encode metrics: {}", e);
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        buf,
    )
        .into_response()
}

use anyhow::Context as _;
use clap::Parser;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use tokio::time::{interval, Duration};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use aya::maps::perf::AsyncPerfEventArray;
use aya::maps::RingBuf;

use tcredir::config::{CliArgs, Config};
use tcredir::state::TrafficState;

mod api;
mod kernel;
mod telemetry;

use kernel::{Channel, KernelTables};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = CliArgs::parse();

    // Load config from file if provided, otherwise use defaults.
    let mut config = if let Some(ref config_path) = cli.config {
        Config::from_file(Path::new(config_path))
            .with_context(|| format!("failed to load {config_path}"))?
    } else {
        Config::default()
    };
    config.merge_cli(&cli);
    config.validate()?;

    // Logging.
    let filter = if config.quiet {
        tracing_subscriber::EnvFilter::new("error")
    } else {
        tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        )
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    // ── eBPF setup ────────────────────────────────────────────────────
    let redirect = config.redirect();
    let channel = Channel::resolve(config.telemetry);
    let mut bpf = kernel::load(redirect.sentinel)?;
    if let Err(e) = aya_log::EbpfLogger::init(&mut bpf) {
        // This can happen if the programs carry no log statements.
        tracing::warn!("failed to initialize eBPF logger: {}", e);
    }

    kernel::attach(&mut bpf, &config.interface, channel)?;
    tracing::info!(
        "redirecting inbound TCP on {} to {} (telemetry via {:?})",
        config.interface,
        config.sentinel,
        channel
    );

    let kernel_tables = Arc::new(KernelTables::take(&mut bpf)?);
    let traffic_state = Arc::new(TrafficState::new());

    // ── Telemetry ─────────────────────────────────────────────────────
    match channel {
        Channel::Ring => {
            let map = bpf
                .take_map(kernel::RING_MAP)
                .with_context(|| format!("map {} not found", kernel::RING_MAP))?;
            let ring_buf = RingBuf::try_from(map)?;
            tokio::spawn(telemetry::drain_ring(ring_buf, traffic_state.clone()));
        }
        Channel::Perf => {
            let map = bpf
                .take_map(kernel::PERF_MAP)
                .with_context(|| format!("map {} not found", kernel::PERF_MAP))?;
            let perf_array = AsyncPerfEventArray::try_from(map)?;
            telemetry::spawn_perf_readers(perf_array, traffic_state.clone())?;
        }
    }

    // ── Flow Cleanup Task ─────────────────────────────────────────────
    let traffic_state_cleanup = traffic_state.clone();
    let flow_timeout = Duration::from_secs(config.flow_timeout);
    tokio::spawn(async move {
        let mut cleanup_interval = interval(Duration::from_secs(10));
        loop {
            cleanup_interval.tick().await;
            traffic_state_cleanup.cleanup_stale_flows(flow_timeout);
        }
    });

    // ── Local Service ─────────────────────────────────────────────────
    let service = tokio::net::TcpListener::bind((Ipv4Addr::UNSPECIFIED, config.service_port))
        .await
        .with_context(|| format!("failed to bind service port {}", config.service_port))?;
    tracing::info!("Service listening on http://0.0.0.0:{}", config.service_port);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(service, api::service_router()).await {
            tracing::error!("local service stopped: {}", e);
        }
    });

    // ── HTTP API ──────────────────────────────────────────────────────
    let app_state = Arc::new(api::AppState {
        traffic: traffic_state.clone(),
        kernel: kernel_tables,
        channel,
        sentinel: config.sentinel,
        start_time: std::time::Instant::now(),
    });

    let app = api::router(app_state, &config.allowed_ips);

    let listener = tokio::net::TcpListener::bind((Ipv4Addr::UNSPECIFIED, config.api_port))
        .await
        .with_context(|| format!("failed to bind API port {}", config.api_port))?;
    tracing::info!("Admin API running on http://0.0.0.0:{}", config.api_port);
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Exiting, detaching programs from {}", config.interface);
    drop(bpf);
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Ctrl-C received");
}

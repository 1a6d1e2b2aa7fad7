use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use kube::Client;
use prometheus::{Encoder, TextEncoder};
use tokio::signal;
use tokio::sync::broadcast;
use tracing::info;

use sandbox_operator::controllers::{claim, sandbox, warmpool};
use sandbox_operator::metrics::{self, REGISTRY};

/// Boots the three reconcilers plus the health/metrics HTTP server, all
/// under one `tokio::select!` against `ctrl_c()`.
pub async fn run(metrics_addr: String, requeue_interval_secs: u64) -> Result<()> {
    let requeue_interval = Duration::from_secs(requeue_interval_secs);
    println!("Starting sandbox operator...\n");

    let client = Client::try_default()
        .await
        .context("Failed to load kubeconfig")?;

    print!("  Cluster connection .......... ");
    match client.apiserver_version().await {
        Ok(v) => println!("OK (v{}.{})", v.major, v.minor),
        Err(e) => {
            println!("FAIL");
            anyhow::bail!("Cannot reach cluster: {e}. Is the cluster running?");
        }
    }

    metrics::init();

    let addr: SocketAddr = metrics_addr
        .parse()
        .with_context(|| format!("Invalid --metrics-addr '{metrics_addr}'"))?;

    println!("  Watching ..................... Sandbox, SandboxClaim, SandboxWarmPool");
    println!("  Metrics server ............... http://{addr}");
    println!();
    println!("  Available endpoints:");
    println!("    GET /healthz ............... Liveness probe (always 200 OK)");
    println!("    GET /readyz ................. 503 until each controller dispatches once");
    println!("    GET /metrics ................ Prometheus metrics scrape endpoint");
    println!();
    println!("Operator running. Press Ctrl+C to stop.\n");

    info!("operator_started");

    let sandbox_ready = Arc::new(AtomicBool::new(false));
    let warmpool_ready = Arc::new(AtomicBool::new(false));
    let claim_ready = Arc::new(AtomicBool::new(false));

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let http_shutdown = shutdown_tx.subscribe();
    let http_state = ReadyState {
        sandbox: sandbox_ready.clone(),
        warmpool: warmpool_ready.clone(),
        claim: claim_ready.clone(),
    };
    let http_handle = tokio::spawn(start_http_server(http_state, http_shutdown, addr));

    let sandbox_fut = sandbox::run(client.clone(), sandbox_ready, requeue_interval);
    let warmpool_fut = warmpool::run(client.clone(), warmpool_ready, requeue_interval);
    let claim_fut = claim::run(client, claim_ready, requeue_interval);

    tokio::select! {
        _ = sandbox_fut => {
            info!("sandbox_controller_stream_ended");
        }
        _ = warmpool_fut => {
            info!("warmpool_controller_stream_ended");
        }
        _ = claim_fut => {
            info!("claim_controller_stream_ended");
        }
        _ = signal::ctrl_c() => {
            info!("shutdown_signal_received");
            println!("\nShutdown signal received. Stopping operator...");
        }
    }

    let _ = shutdown_tx.send(());
    let _ = http_handle.await?;

    info!("operator_stopped");
    println!("Operator stopped.");

    Ok(())
}

#[derive(Clone)]
struct ReadyState {
    sandbox: Arc<AtomicBool>,
    warmpool: Arc<AtomicBool>,
    claim: Arc<AtomicBool>,
}

impl ReadyState {
    fn all_ready(&self) -> bool {
        self.sandbox.load(Ordering::Relaxed)
            && self.warmpool.load(Ordering::Relaxed)
            && self.claim.load(Ordering::Relaxed)
    }
}

pub(crate) fn build_router(state: ReadyState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(|| async { (StatusCode::OK, "OK") }))
        .route("/readyz", get(move || ready_handler(state.clone())))
}

async fn start_http_server(
    state: ReadyState,
    mut shutdown: broadcast::Receiver<()>,
    addr: SocketAddr,
) -> Result<()> {
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind HTTP server on {addr}"))?;

    info!(addr = %addr, "operator_http_server_started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;

    Ok(())
}

async fn ready_handler(state: ReadyState) -> impl IntoResponse {
    if state.all_ready() {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();

    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => match String::from_utf8(buffer) {
            Ok(body) => (StatusCode::OK, body),
            Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding error".to_string()),
        },
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding error".to_string()),
    }
}

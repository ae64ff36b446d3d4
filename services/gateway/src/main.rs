use clap::Parser;
use gate_backend::{IdentityOptions, MemoryIdentity, MemoryRules, MemoryStore};
use gateway::config::GatewayConfig;
use gateway::state::AppState;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "gatehouse", about = "JSON-over-WebSocket gateway")]
struct Args {
    /// Path to the TOML config file.  Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => GatewayConfig::load(path).expect("failed to load config"),
        None => GatewayConfig::default(),
    };

    let identity = MemoryIdentity::new(IdentityOptions {
        session_ttl_ms: config.auth.session_ttl_ms,
        superadmin_secret: config.auth.superadmin_secret.clone(),
    });
    let state = AppState::new(
        config,
        Arc::new(MemoryStore::new()),
        Some(Arc::new(MemoryRules::new())),
        Arc::new(identity),
    );

    let router = gateway::build_router(state.clone());
    let bind_addr = state.config.server.bind.clone();
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .expect("failed to bind");
    info!(addr = %bind_addr, path = %state.config.server.ws_path, "gateway listening");

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown(state.clone()))
    .await
    .expect("server error");
    info!("gateway shut down gracefully");
}

/// Waits for SIGTERM or Ctrl-C (SIGINT), then drains every connection
/// within the configured grace period.
async fn shutdown(state: AppState) {
    shutdown_signal().await;
    let grace = state.config.shutdown.grace_period_ms;
    state.supervisor.stop(Some(grace)).await;
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}

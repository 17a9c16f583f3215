use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

mod app;
mod auth;
mod http;
mod ws;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Config first — the log level lives in it.
    let config_path = std::env::var("ARIA_CONFIG").ok();
    let config = aria_core::config::AriaConfig::load(config_path.as_deref())?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("aria_gateway={},tower_http=debug", config.logging.level).into()
            }),
        )
        .init();

    let db_path = config.database.path.clone();
    if let Some(parent) = Path::new(&db_path).parent() {
        std::fs::create_dir_all(parent)?;
    }

    let bind = config.server.host.clone();
    let port = config.server.port;
    let state = Arc::new(app::AppState::build(config)?);

    // First boot: provision the admin account if none exists.
    let data_dir = Path::new(&db_path)
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| ".".into());
    if let Err(e) = aria_users::bootstrap::ensure_admin(&state.users, &data_dir) {
        warn!(error = %e, "admin bootstrap failed");
    }

    let router = app::build_router(state.clone());
    let addr: SocketAddr = format!("{}:{}", bind, port).parse()?;
    info!(%addr, "Aria gateway listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(state.clone()))
        .await?;

    Ok(())
}

async fn shutdown_signal(state: Arc<app::AppState>) {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutting down, snapshotting rate counters");
    state.snapshot_rate_counters();
}

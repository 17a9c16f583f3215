use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::app::AppState;

/// GET /health — liveness probe, never requires auth.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let degraded = state.provider_degraded.load(Ordering::Relaxed);
    Json(json!({
        "status": if degraded { "degraded" } else { "ok" },
        "uptime_s": state.started_at.elapsed().as_secs(),
        "version": env!("CARGO_PKG_VERSION"),
        "ws_clients": state.ws_clients.len(),
    }))
}

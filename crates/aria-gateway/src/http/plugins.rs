//! Plugin management endpoints: GET /plugins, POST /plugins/{name}/enable|disable.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::Serialize;

use aria_plugins::PluginError;

use crate::app::AppState;
use crate::auth::{self, ErrorBody};

#[derive(Serialize)]
pub struct PluginEntry {
    pub name: String,
    pub enabled: bool,
    pub tier_required: String,
}

pub async fn list_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<PluginEntry>>, (StatusCode, Json<ErrorBody>)> {
    let authed = auth::authenticate(&state, &headers)?;

    let entries = state
        .plugins
        .discover()
        .into_iter()
        .map(|desc| {
            let enabled = state
                .plugins
                .is_enabled(&authed.user.id, &desc.name)
                .unwrap_or(false);
            PluginEntry {
                name: desc.name,
                enabled,
                tier_required: desc.tier_required.to_string(),
            }
        })
        .collect();
    Ok(Json(entries))
}

pub async fn enable_handler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, (StatusCode, Json<ErrorBody>)> {
    toggle(&state, &headers, &name, true)
}

pub async fn disable_handler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, (StatusCode, Json<ErrorBody>)> {
    toggle(&state, &headers, &name, false)
}

fn toggle(
    state: &AppState,
    headers: &HeaderMap,
    name: &str,
    enable: bool,
) -> Result<StatusCode, (StatusCode, Json<ErrorBody>)> {
    let authed = auth::authenticate(state, headers)?;
    let result = if enable {
        state.plugins.enable(&authed.user.id, name)
    } else {
        state.plugins.disable(&authed.user.id, name)
    };

    match result {
        Ok(()) => Ok(StatusCode::NO_CONTENT),
        Err(PluginError::NotFound { .. }) => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorBody {
                code: "PLUGIN_NOT_FOUND",
                error: format!("no plugin named '{name}'"),
            }),
        )),
        Err(e) => {
            tracing::warn!(plugin = name, error = %e, "plugin toggle failed");
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorBody {
                    code: "INTERNAL_ERROR",
                    error: "toggle failed".to_string(),
                }),
            ))
        }
    }
}

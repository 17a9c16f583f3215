//! POST /api/get_user_history — page through a user's turn log.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::app::AppState;
use crate::auth::{self, ErrorBody};

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 500;

#[derive(Deserialize)]
pub struct HistoryRequest {
    pub user_id: String,
    pub limit: Option<usize>,
    /// Return turns strictly older than this turn id.
    pub before: Option<String>,
}

#[derive(Serialize)]
pub struct HistoryReply {
    pub turns: Vec<serde_json::Value>,
}

pub async fn history_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<HistoryRequest>,
) -> Result<Json<HistoryReply>, (StatusCode, Json<ErrorBody>)> {
    let authed = auth::authenticate(&state, &headers)?;
    if authed.user.id != req.user_id {
        return Err(auth::forbidden("token does not match user_id"));
    }

    let limit = req.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);
    let turns = state
        .memory
        .history(&authed.user.id, limit, req.before.as_deref())
        .await
        .map_err(|e| {
            warn!(user_id = %authed.user.id, error = %e, "history read failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorBody {
                    code: "MEMORY_READ_FAILURE",
                    error: "history unavailable".to_string(),
                }),
            )
        })?;

    let turns = turns
        .into_iter()
        .map(|t| {
            serde_json::json!({
                "turn_id": t.turn_id,
                "session_id": t.session_id,
                "role": t.role.to_string(),
                "content": t.content,
                "tool_name": t.tool_name,
                "token_count": t.token_count,
                "created_at": t.created_at,
            })
        })
        .collect();

    Ok(Json(HistoryReply { turns }))
}

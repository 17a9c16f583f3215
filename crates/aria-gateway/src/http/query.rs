//! POST /api/ai_query — the REST query surface.
//!
//! Auth → identity match → rate-limit admission → orchestrator. Rejected
//! requests never reach the orchestrator, so they leave no turn behind.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use aria_agent::QueryError;
use aria_core::config::QUERY_DEADLINE_SECS;

use crate::app::AppState;
use crate::auth;

#[derive(Deserialize)]
pub struct AiQueryRequest {
    pub query: String,
    pub user_id: String,
}

#[derive(Serialize)]
pub struct AiQueryReply {
    pub text: String,
    pub metadata: serde_json::Value,
}

pub async fn ai_query_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<AiQueryRequest>,
) -> Response {
    let authed = match auth::authenticate(&state, &headers) {
        Ok(a) => a,
        Err(rejection) => return rejection.into_response(),
    };

    // The bearer's session must own the user_id named in the body.
    if authed.user.id != req.user_id {
        return auth::forbidden("token does not match user_id").into_response();
    }

    if req.query.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "code": "PROTOCOL_ERROR", "error": "query cannot be empty" })),
        )
            .into_response();
    }

    // Admission before any state is touched.
    if let Err(limited) = state.limits.admit_request(&authed.user.id, authed.user.tier) {
        return rate_limited_response(limited);
    }

    let session_root = state.session_token(&authed.session.id);
    let cancel = session_root.child_token();

    let result = tokio::time::timeout(
        Duration::from_secs(QUERY_DEADLINE_SECS),
        state.orchestrator.handle_query(
            &authed.user.id,
            authed.user.tier,
            &authed.session.id,
            &req.query,
            &cancel,
        ),
    )
    .await;

    let result = match result {
        Ok(r) => r,
        Err(_) => {
            cancel.cancel();
            warn!(user_id = %authed.user.id, "query deadline exceeded");
            return (
                StatusCode::GATEWAY_TIMEOUT,
                Json(json!({ "code": "TIMEOUT", "error": "query deadline exceeded" })),
            )
                .into_response();
        }
    };

    match result {
        Ok(reply) => {
            state
                .provider_degraded
                .store(reply.metadata.from_fallback, Ordering::Relaxed);
            Json(AiQueryReply {
                text: reply.text,
                metadata: metadata_json(&reply.metadata),
            })
            .into_response()
        }
        Err(QueryError::Overloaded) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "code": "OVERLOADED", "error": "server overloaded, retry later" })),
        )
            .into_response(),
        Err(QueryError::Unavailable(msg)) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "code": "LLM_PROVIDER_ERROR", "error": msg })),
        )
            .into_response(),
        Err(QueryError::Cancelled) => (
            StatusCode::REQUEST_TIMEOUT,
            Json(json!({ "code": "TIMEOUT", "error": "query cancelled" })),
        )
            .into_response(),
    }
}

pub fn metadata_json(meta: &aria_agent::orchestrator::ReplyMetadata) -> serde_json::Value {
    json!({
        "model": meta.model,
        "used_tools": meta.used_tools
            .iter()
            .map(|t| json!({ "name": t.name, "ok": t.ok }))
            .collect::<Vec<_>>(),
        "latency_ms": meta.latency_ms,
        "from_fallback": meta.from_fallback,
    })
}

fn rate_limited_response(limited: aria_limits::RateLimited) -> Response {
    let mut response = (
        StatusCode::TOO_MANY_REQUESTS,
        Json(json!({
            "code": "RATE_LIMITED",
            "error": "rate limit exceeded",
            "limit": limited.limit,
            "window_s": limited.window_s,
            "retry_after_seconds": limited.retry_after_s,
        })),
    )
        .into_response();
    if let Ok(value) = limited.retry_after_s.to_string().parse() {
        response.headers_mut().insert("Retry-After", value);
    }
    response
}

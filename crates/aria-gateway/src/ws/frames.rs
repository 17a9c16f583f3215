//! Inbound WS frame dispatch.
//!
//! The receive loop calls `handle` for each text frame, in arrival order.
//! Queries are admitted and their user turns appended here (still in
//! order), then the heavy work runs on its own task so the connection
//! keeps multiplexing.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{info, warn};

use aria_agent::QueryError;
use aria_core::config::QUERY_DEADLINE_SECS;
use aria_core::types::TurnRole;
use aria_memory::ConversationTurn;
use aria_protocol::frames::{
    ClientFrame, QueryMetadata, ServerFrame, ToggleAction, ToggleStatus, UsedTool,
};

use crate::app::AppState;
use crate::auth::{self, AuthedUser};

pub async fn handle(
    state: &Arc<AppState>,
    conn_id: &str,
    text: &str,
    authed: &mut Option<AuthedUser>,
    out: &mpsc::Sender<String>,
) {
    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(e) => {
            warn!(conn_id, error = %e, "malformed frame");
            let _ = out
                .send(ServerFrame::error("PROTOCOL_ERROR", "malformed frame").to_json())
                .await;
            return;
        }
    };

    match frame {
        ClientFrame::Auth { token } => match auth::resolve_token(state, &token) {
            Ok(a) => {
                info!(conn_id, user_id = %a.user.id, "WS authenticated");
                state
                    .ws_attached
                    .insert(a.session.id.clone(), conn_id.to_string());
                *authed = Some(a);
            }
            Err(_) => {
                let _ = out
                    .send(ServerFrame::error("UNAUTHORIZED", "invalid session token").to_json())
                    .await;
            }
        },

        ClientFrame::AiQuery {
            correlation_id,
            query,
            context: _,
        } => {
            let Some(a) = authed.as_ref() else {
                let _ = out
                    .send(ServerFrame::error("UNAUTHORIZED", "authenticate first").to_json())
                    .await;
                return;
            };
            handle_query(state, a, correlation_id, query, out).await;
        }

        ClientFrame::PluginToggle { plugin, action } => {
            let Some(a) = authed.as_ref() else {
                let _ = out
                    .send(ServerFrame::error("UNAUTHORIZED", "authenticate first").to_json())
                    .await;
                return;
            };
            let (result, status) = match action {
                ToggleAction::Enable => (
                    state.plugins.enable(&a.user.id, &plugin),
                    ToggleStatus::Enabled,
                ),
                ToggleAction::Disable => (
                    state.plugins.disable(&a.user.id, &plugin),
                    ToggleStatus::Disabled,
                ),
            };
            let reply = match result {
                Ok(()) => ServerFrame::PluginToggled { plugin, status },
                Err(e) => {
                    warn!(plugin = %plugin, error = %e, "plugin toggle failed");
                    ServerFrame::error("PLUGIN_NOT_FOUND", e.to_string())
                }
            };
            let _ = out.send(reply.to_json()).await;
        }

        ClientFrame::PluginList => {
            let Some(a) = authed.as_ref() else {
                let _ = out
                    .send(ServerFrame::error("UNAUTHORIZED", "authenticate first").to_json())
                    .await;
                return;
            };
            let mut plugins = serde_json::Map::new();
            for desc in state.plugins.discover() {
                let enabled = state
                    .plugins
                    .is_enabled(&a.user.id, &desc.name)
                    .unwrap_or(false);
                plugins.insert(desc.name, serde_json::Value::Bool(enabled));
            }
            let _ = out.send(ServerFrame::PluginList { plugins }.to_json()).await;
        }
    }
}

/// Admit, append the user turn (in frame order), then run the query on its
/// own task so the connection loop keeps serving other frames.
async fn handle_query(
    state: &Arc<AppState>,
    authed: &AuthedUser,
    correlation_id: String,
    query: String,
    out: &mpsc::Sender<String>,
) {
    if query.trim().is_empty() {
        let _ = out
            .send(ServerFrame::error("PROTOCOL_ERROR", "query cannot be empty").to_json())
            .await;
        return;
    }

    // Admission first: a rejected query leaves no turn behind.
    if let Err(limited) = state.limits.admit_request(&authed.user.id, authed.user.tier) {
        let _ = out
            .send(
                ServerFrame::rate_limited(
                    format!("limit {} per {}s", limited.limit, limited.window_s),
                    limited.retry_after_s,
                )
                .to_json(),
            )
            .await;
        return;
    }

    let turn = ConversationTurn::new(
        authed.user.id.as_str(),
        authed.session.id.as_str(),
        TurnRole::User,
        query.clone(),
    );
    state.orchestrator.append_user_turn(&turn).await;

    let cancel = state.session_token(&authed.session.id).child_token();
    let tier = authed.user.tier;
    let state = state.clone();
    let out = out.clone();

    tokio::spawn(async move {
        let result = tokio::time::timeout(
            Duration::from_secs(QUERY_DEADLINE_SECS),
            state.orchestrator.run_prepared(turn, tier, &cancel),
        )
        .await;

        let result = match result {
            Ok(r) => r,
            Err(_) => {
                cancel.cancel();
                let _ = out
                    .send(ServerFrame::error("TIMEOUT", "query deadline exceeded").to_json())
                    .await;
                return;
            }
        };

        match result {
            Ok(reply) => {
                state
                    .provider_degraded
                    .store(reply.metadata.from_fallback, Ordering::Relaxed);

                // Per-correlation ordering: progress frames first, then the
                // final response, all through the same outbound queue.
                for event in &reply.tool_events {
                    let frame = ServerFrame::FunctionResult {
                        correlation_id: correlation_id.clone(),
                        function: event.function.clone(),
                        result: event.result.clone(),
                    };
                    let _ = out.send(frame.to_json()).await;
                }

                let frame = ServerFrame::AiResponse {
                    correlation_id,
                    text: reply.text,
                    metadata: QueryMetadata {
                        model: reply.metadata.model,
                        used_tools: reply
                            .metadata
                            .used_tools
                            .iter()
                            .map(|t| UsedTool {
                                name: t.name.clone(),
                                ok: t.ok,
                            })
                            .collect(),
                        latency_ms: reply.metadata.latency_ms,
                        from_fallback: reply.metadata.from_fallback,
                    },
                };
                let _ = out.send(frame.to_json()).await;
            }
            Err(QueryError::Overloaded) => {
                let _ = out
                    .send(ServerFrame::error("OVERLOADED", "server overloaded").to_json())
                    .await;
            }
            Err(QueryError::Unavailable(msg)) => {
                let _ = out
                    .send(ServerFrame::error("LLM_PROVIDER_ERROR", msg).to_json())
                    .await;
            }
            Err(QueryError::Cancelled) => {
                // Transport gone or query aborted; nothing to deliver.
            }
        }
    });
}

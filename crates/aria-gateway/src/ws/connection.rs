//! Per-connection WebSocket loop.
//!
//! Connection lifecycle: upgrade at GET /ws/{client_id} → optional bearer
//! auth from the upgrade headers (or a later `auth` frame) → frame loop.
//! One connection belongs to exactly one session; queries multiplex over
//! it with client-supplied correlation ids.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    http::HeaderMap,
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use aria_core::config::{HEARTBEAT_INTERVAL_SECS, IDLE_TIMEOUT_SECS, MAX_FRAME_BYTES};
use aria_protocol::frames::ServerFrame;

use crate::app::AppState;
use crate::auth::{self, AuthedUser};
use crate::ws::frames;

/// Outbound queue depth per connection; slow consumers drop the connection
/// rather than ballooning memory.
const OUTBOUND_QUEUE: usize = 64;

/// Axum handler — upgrades HTTP to WebSocket at GET /ws/{client_id}.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(client_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    // Header auth is optional here; a client may instead send an `auth`
    // frame as its first message.
    let authed = auth::authenticate(&state, &headers).ok();
    ws.on_upgrade(move |socket| handle_connection(socket, state, client_id, authed))
}

/// Per-connection task — lives for the entire WS session lifetime.
async fn handle_connection(
    socket: WebSocket,
    state: Arc<AppState>,
    client_id: String,
    mut authed: Option<AuthedUser>,
) {
    let conn_id = uuid::Uuid::new_v4().to_string();
    info!(%conn_id, %client_id, authed = authed.is_some(), "new WS connection");

    let (mut tx, mut rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<String>(OUTBOUND_QUEUE);
    state.ws_clients.insert(conn_id.clone(), out_tx.clone());
    if let Some(a) = &authed {
        state.ws_attached.insert(a.session.id.clone(), conn_id.clone());
    }

    let mut last_traffic = Instant::now();
    let mut heartbeat =
        tokio::time::interval(Duration::from_secs(HEARTBEAT_INTERVAL_SECS));
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            // client sent us something
            msg = rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        last_traffic = Instant::now();
                        let text_ref: &str = &text;
                        if text_ref.len() > MAX_FRAME_BYTES {
                            warn!(%conn_id, size = text_ref.len(), "frame too large, dropping");
                            let err = ServerFrame::error(
                                "FRAME_TOO_LARGE",
                                format!("frame is {} bytes, cap is {}", text_ref.len(), MAX_FRAME_BYTES),
                            );
                            let _ = out_tx.send(err.to_json()).await;
                            continue;
                        }
                        frames::handle(&state, &conn_id, text_ref, &mut authed, &out_tx).await;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        last_traffic = Instant::now();
                        let _ = tx.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_traffic = Instant::now();
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(%conn_id, error = %e, "WS read error");
                        break;
                    }
                }
            }

            // queued outbound frame → forward to this client
            frame = out_rx.recv() => {
                match frame {
                    Some(frame) => {
                        if tx.send(Message::Text(frame.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }

            // heartbeat tick: close idle connections, ping the rest
            _ = heartbeat.tick() => {
                if last_traffic.elapsed() > Duration::from_secs(IDLE_TIMEOUT_SECS) {
                    info!(%conn_id, "idle timeout, closing connection");
                    break;
                }
                if tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }

    state.ws_clients.remove(&conn_id);
    if let Some(a) = authed {
        detach_with_grace(state, a.session.id, conn_id).await;
    } else {
        info!(%conn_id, "WS connection closed");
    }
}

/// On disconnect, the session stays resumable for the grace window; if no
/// new connection attaches in time, its in-flight queries are cancelled.
async fn detach_with_grace(state: Arc<AppState>, session_id: String, conn_id: String) {
    let attached_here = state
        .ws_attached
        .get(&session_id)
        .map(|c| *c == conn_id)
        .unwrap_or(false);
    if attached_here {
        state.ws_attached.remove(&session_id);
    }
    info!(%conn_id, %session_id, "WS connection closed, grace window started");

    let grace = Duration::from_secs(state.config.security.session_grace_s);
    tokio::spawn(async move {
        tokio::time::sleep(grace).await;
        if !state.ws_attached.contains_key(&session_id) {
            debug!(%session_id, "grace window elapsed, cancelling in-flight queries");
            state.cancel_session_tasks(&session_id);
        }
    });
}

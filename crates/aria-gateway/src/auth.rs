//! Bearer-token authentication shared by the REST and WS surfaces.

use axum::http::{HeaderMap, StatusCode};
use serde::Serialize;

use aria_sessions::{Session, SessionError};
use aria_users::User;

use crate::app::AppState;

/// A resolved caller: the session the token named plus its owning user.
pub struct AuthedUser {
    pub user: User,
    pub session: Session,
}

#[derive(Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub error: String,
}

pub type AuthRejection = (StatusCode, axum::Json<ErrorBody>);

pub fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// Resolve the Authorization header to a live session + user, or a 401.
pub fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<AuthedUser, AuthRejection> {
    let token = extract_bearer(headers).ok_or_else(|| unauthorized("missing bearer token"))?;
    resolve_token(state, token)
}

/// Token-string variant used by the WS `auth` frame.
pub fn resolve_token(state: &AppState, token: &str) -> Result<AuthedUser, AuthRejection> {
    let session = state.sessions.resume(token).map_err(|e| match e {
        SessionError::Expired => unauthorized("session expired"),
        SessionError::Unknown => unauthorized("unknown session"),
        other => {
            tracing::error!(error = %other, "session lookup failed");
            internal()
        }
    })?;

    let user = state
        .users
        .get(&session.user_id)
        .map_err(|e| {
            tracing::error!(error = %e, "user lookup failed");
            internal()
        })?
        .ok_or_else(|| unauthorized("session user no longer exists"))?;

    Ok(AuthedUser { user, session })
}

pub fn unauthorized(message: &str) -> AuthRejection {
    (
        StatusCode::UNAUTHORIZED,
        axum::Json(ErrorBody {
            code: "UNAUTHORIZED",
            error: message.to_string(),
        }),
    )
}

pub fn forbidden(message: &str) -> AuthRejection {
    (
        StatusCode::FORBIDDEN,
        axum::Json(ErrorBody {
            code: "UNAUTHORIZED",
            error: message.to_string(),
        }),
    )
}

fn internal() -> AuthRejection {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        axum::Json(ErrorBody {
            code: "INTERNAL_ERROR",
            error: "internal error".to_string(),
        }),
    )
}

//! Identity endpoints: POST /register, /login, /logout.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

use aria_users::UserError;

use crate::app::AppState;
use crate::auth::{self, ErrorBody};

#[derive(Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
}

#[derive(Serialize)]
pub struct RegisterReply {
    pub user_id: String,
}

pub async fn register_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<RegisterReply>), (StatusCode, Json<ErrorBody>)> {
    if req.email.trim().is_empty() || req.password.len() < 8 {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorBody {
                code: "PROTOCOL_ERROR",
                error: "email required and password must be at least 8 characters".to_string(),
            }),
        ));
    }

    match state.users.register(req.email.trim(), &req.password) {
        Ok(user) => Ok((
            StatusCode::CREATED,
            Json(RegisterReply { user_id: user.id }),
        )),
        Err(UserError::UserExists) => Err((
            StatusCode::CONFLICT,
            Json(ErrorBody {
                code: "USER_EXISTS",
                error: "a user with this email already exists".to_string(),
            }),
        )),
        Err(e) => {
            warn!(error = %e, "registration failed");
            Err(internal())
        }
    }
}

#[derive(Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Serialize)]
pub struct LoginReply {
    pub session_token: String,
    pub user_id: String,
}

pub async fn login_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginReply>, (StatusCode, Json<ErrorBody>)> {
    let user = state
        .users
        .authenticate(&req.email, &req.password)
        .map_err(|e| match e {
            UserError::InvalidCredentials => (
                StatusCode::UNAUTHORIZED,
                Json(ErrorBody {
                    code: "INVALID_CREDENTIALS",
                    error: "invalid email or password".to_string(),
                }),
            ),
            UserError::AccountLocked { until } => (
                StatusCode::UNAUTHORIZED,
                Json(ErrorBody {
                    code: "ACCOUNT_LOCKED",
                    error: format!("account locked until {until}"),
                }),
            ),
            other => {
                warn!(error = %other, "login failed");
                internal()
            }
        })?;

    let (token, session) = state.sessions.issue(&user.id).map_err(|e| {
        warn!(error = %e, "session issue failed");
        internal()
    })?;

    tracing::info!(user_id = %user.id, session_id = %session.id, "login ok");
    Ok(Json(LoginReply {
        session_token: token,
        user_id: user.id,
    }))
}

/// POST /logout — revoke the presented token. Always 204 on valid auth.
pub async fn logout_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<StatusCode, (StatusCode, Json<ErrorBody>)> {
    let token =
        auth::extract_bearer(&headers).ok_or_else(|| auth::unauthorized("missing bearer token"))?;
    let authed = auth::resolve_token(&state, token)?;

    state.cancel_session_tasks(&authed.session.id);
    if let Err(e) = state.sessions.revoke(token) {
        warn!(error = %e, "logout revoke failed");
    }
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct ChangePasswordRequest {
    pub old_password: String,
    pub new_password: String,
}

/// POST /api/change_password — rotate the credential and revoke every
/// session the user holds, including the one making this call.
pub async fn change_password_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<ChangePasswordRequest>,
) -> Result<StatusCode, (StatusCode, Json<ErrorBody>)> {
    let authed = auth::authenticate(&state, &headers)?;

    // Re-verify the current password before rotating.
    state
        .users
        .authenticate(&authed.user.email, &req.old_password)
        .map_err(|_| auth::unauthorized("current password incorrect"))?;

    if req.new_password.len() < 8 {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorBody {
                code: "PROTOCOL_ERROR",
                error: "password must be at least 8 characters".to_string(),
            }),
        ));
    }

    state
        .users
        .set_password(&authed.user.id, &req.new_password)
        .map_err(|e| {
            warn!(error = %e, "password change failed");
            internal()
        })?;

    state.cancel_session_tasks(&authed.session.id);
    if let Err(e) = state.sessions.revoke_all_for_user(&authed.user.id) {
        warn!(error = %e, "session revocation after password change failed");
    }
    Ok(StatusCode::NO_CONTENT)
}

fn internal() -> (StatusCode, Json<ErrorBody>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorBody {
            code: "INTERNAL_ERROR",
            error: "internal error".to_string(),
        }),
    )
}

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::audit::{AuditEntry, Subsystem};
use crate::auth::middleware::AuthUser;
use crate::auth::{password, session, token, users};
use crate::error::ApiError;
use crate::store::AppState;

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub user: UserResponse,
    pub token: String,
    pub refresh_token: String,
    pub session: String,
    pub expires_at: i64,
}

#[derive(Debug, Serialize)]
pub struct UserResponse {
    pub id: String,
    pub username: String,
    pub role: String,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/auth/login", post(login))
        .route("/auth/logout", post(logout))
}

#[tracing::instrument(skip(state, body), fields(username = %body.username), err)]
async fn login(
    State(state): State<AppState>,
    Json(body): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    let audit_fail = |reason: &str| {
        AuditEntry::new(Subsystem::Auth, &body.username, "login")
            .resource("user", &body.username)
            .failed(reason)
    };

    if body.password.len() > password::MAX_PASSWORD_BYTES {
        state.audit.emit(audit_fail("password too long")).await;
        return Err(ApiError::BadRequest(format!(
            "password exceeds {} bytes",
            password::MAX_PASSWORD_BYTES
        )));
    }

    let user = users::find_by_username(&state.db, &body.username)
        .await
        .map_err(ApiError::Internal)?;

    let Some(user) = user else {
        state.audit.emit(audit_fail("unknown user")).await;
        return Err(ApiError::Unauthenticated);
    };
    if !user.is_active {
        state.audit.emit(audit_fail("user disabled")).await;
        return Err(ApiError::Unauthenticated);
    }

    let ok = password::verify_password(&body.password, &user.password_hash)
        .map_err(ApiError::Internal)?;
    if !ok {
        state.audit.emit(audit_fail("bad password")).await;
        return Err(ApiError::Unauthenticated);
    }

    let session_id = Uuid::new_v4().to_string();
    let (jwt, expires_at) = token::issue_token(
        &state.config.jwt,
        &user.id,
        &user.username,
        &user.role,
        &session_id,
    )
    .map_err(ApiError::Internal)?;
    let (refresh_raw, refresh_hash) = token::generate_refresh_token();

    session::create(
        &state.db,
        &session::NewSession {
            id: &session_id,
            user_id: &user.id,
            token_hash: &token::hash_token(&jwt),
            refresh_hash: &refresh_hash,
            expires_at,
            ip: None,
            user_agent: None,
        },
        state.config.auth.max_concurrent_sessions,
    )
    .await
    .map_err(ApiError::Internal)?;

    state
        .audit
        .emit(
            AuditEntry::new(Subsystem::Auth, &user.username, "login")
                .resource("user", &user.username),
        )
        .await;

    Ok(Json(LoginResponse {
        user: UserResponse {
            id: user.id,
            username: user.username,
            role: user.role,
        },
        token: jwt,
        refresh_token: refresh_raw,
        session: session_id,
        expires_at,
    }))
}

#[tracing::instrument(skip(state, auth), fields(username = %auth.username), err)]
async fn logout(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<serde_json::Value>, ApiError> {
    session::deactivate(&state.db, &auth.session_id)
        .await
        .map_err(ApiError::Internal)?;

    state
        .audit
        .emit(
            AuditEntry::new(Subsystem::Auth, &auth.username, "logout")
                .resource("user", &auth.username)
                .client_ip(auth.ip_addr.as_deref()),
        )
        .await;

    Ok(Json(serde_json::json!({ "ok": true })))
}

use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;

use super::helpers::{ListResponse, page_to_offset};
use crate::audit::{AuditEntry, Subsystem};
use crate::auth::middleware::AuthUser;
use crate::error::ApiError;
use crate::recording::storage::RecordingStorage;
use crate::recording::store::{self, RecordingFilter, RecordingRow};
use crate::store::AppState;

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub recording_type: Option<String>,
    pub user_id: Option<String>,
    pub from: Option<i64>,
    pub to: Option<i64>,
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/recordings", get(list_recordings))
        .route("/recordings/{id}/playback", get(playback))
        .route("/recordings/{id}/download", get(download))
        .route("/recordings/cleanup/trigger", post(trigger_cleanup))
        .route("/recordings/cleanup/status", get(cleanup_status))
}

async fn list_recordings(
    State(state): State<AppState>,
    auth: AuthUser,
    Query(params): Query<ListParams>,
) -> Result<Json<ListResponse<RecordingRow>>, ApiError> {
    auth.require("recordings", "read")?;

    let (limit, offset) = page_to_offset(params.page, params.limit, 200);
    let filter = RecordingFilter {
        recording_type: params.recording_type,
        user_id: params.user_id,
        from_ms: params.from,
        to_ms: params.to,
        limit,
        offset,
    };
    let (items, total) = store::list(&state.db, &filter)
        .await
        .map_err(ApiError::Internal)?;
    Ok(Json(ListResponse { items, total }))
}

async fn fetch(state: &AppState, id: &str) -> Result<(RecordingRow, Vec<u8>), ApiError> {
    let row = store::get(&state.db, id)
        .await
        .map_err(ApiError::Internal)?
        .ok_or_else(|| ApiError::NotFound("recording".into()))?;
    let bytes = state
        .storage
        .read(&row.storage_path)
        .await
        .map_err(|_| ApiError::NotFound("recording file".into()))?;
    Ok((row, bytes))
}

/// Raw cast body, playable by any asciinema player.
async fn playback(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    auth.require("recordings", "read")?;
    let (_, bytes) = fetch(&state, &id).await?;
    Ok((
        [(header::CONTENT_TYPE, "application/x-asciicast")],
        bytes,
    ))
}

async fn download(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    auth.require("recordings", "read")?;
    let (row, bytes) = fetch(&state, &id).await?;
    let disposition = format!("attachment; filename=\"{}.cast\"", row.id);
    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_owned()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    ))
}

#[tracing::instrument(skip(state, auth), fields(username = %auth.username), err)]
async fn trigger_cleanup(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<impl IntoResponse, ApiError> {
    auth.require("recordings", "admin")?;

    let task_id = state
        .cleanup
        .trigger()
        .map_err(|e| ApiError::Unavailable(e.to_string()))?;

    state
        .audit
        .emit(
            AuditEntry::new(Subsystem::Host, &auth.username, "recording.cleanup")
                .resource("recordings", "cleanup")
                .client_ip(auth.ip_addr.as_deref())
                .details(serde_json::json!({ "task_id": task_id })),
        )
        .await;

    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "task_id": task_id })),
    ))
}

async fn cleanup_status(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<impl IntoResponse, ApiError> {
    auth.require("recordings", "read")?;
    let status = state.cleanup.status().await;
    Ok(Json(status))
}

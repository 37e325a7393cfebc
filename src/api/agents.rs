use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use base64::Engine;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::helpers::ListResponse;
use crate::agent::proto::AgentTask;
use crate::agent::store;
use crate::audit::{AuditEntry, Subsystem};
use crate::auth::middleware::AuthUser;
use crate::error::ApiError;
use crate::store::AppState;
use crate::store::now_ms;

#[derive(Debug, Serialize)]
pub struct AgentResponse {
    #[serde(flatten)]
    pub agent: store::AgentRow,
    pub online: bool,
    pub pending_tasks: usize,
}

#[derive(Debug, Deserialize)]
pub struct StateParams {
    pub from: Option<i64>,
    pub to: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    /// `probe` or `command`; streaming task types are opened via their own
    /// surfaces.
    pub task_type: String,
    #[serde(default)]
    pub params: HashMap<String, String>,
    /// Base64 task payload (e.g. the command line to run).
    pub payload: Option<String>,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/agents", get(list_agents))
        .route("/agents/{uuid}/state", get(state_series))
        .route("/agents/{uuid}/tasks", axum::routing::post(create_task))
}

async fn list_agents(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<ListResponse<AgentResponse>>, ApiError> {
    auth.require("agents", "read")?;

    let rows = store::list_agents(&state.db).await.map_err(ApiError::Internal)?;
    let items: Vec<AgentResponse> = rows
        .into_iter()
        .map(|agent| AgentResponse {
            online: state.registry.is_online(&agent.uuid),
            pending_tasks: state.registry.pending_tasks(&agent.uuid),
            agent,
        })
        .collect();
    let total = i64::try_from(items.len()).unwrap_or(i64::MAX);
    Ok(Json(ListResponse { items, total }))
}

async fn state_series(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(uuid): Path<String>,
    Query(params): Query<StateParams>,
) -> Result<Json<Vec<store::StateSample>>, ApiError> {
    auth.require("agents", "read")?;

    let agent = store::find_by_uuid(&state.db, &uuid)
        .await
        .map_err(ApiError::Internal)?
        .ok_or_else(|| ApiError::NotFound("agent".into()))?;

    let to = params.to.unwrap_or_else(now_ms);
    let from = params.from.unwrap_or(to - 3600 * 1000);
    let samples = store::state_series(&state.db, &agent.id, from, to, params.limit.unwrap_or(500))
        .await
        .map_err(ApiError::Internal)?;
    Ok(Json(samples))
}

#[tracing::instrument(skip(state, auth, body), fields(%uuid, task_type = %body.task_type), err)]
async fn create_task(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(uuid): Path<String>,
    Json(body): Json<CreateTaskRequest>,
) -> Result<impl IntoResponse, ApiError> {
    auth.require("agents", "admin")?;

    if !matches!(body.task_type.as_str(), "probe" | "command") {
        return Err(ApiError::BadRequest(
            "task_type must be probe or command".into(),
        ));
    }

    store::find_by_uuid(&state.db, &uuid)
        .await
        .map_err(ApiError::Internal)?
        .ok_or_else(|| ApiError::NotFound("agent".into()))?;

    let payload = match &body.payload {
        Some(b64) => base64::engine::general_purpose::STANDARD
            .decode(b64)
            .map_err(|e| ApiError::BadRequest(format!("payload is not valid base64: {e}")))?,
        None => Vec::new(),
    };

    let task = AgentTask {
        task_id: Uuid::new_v4().to_string(),
        task_type: body.task_type.clone(),
        params: body.params.clone(),
        payload,
    };
    let task_id = task.task_id.clone();

    state
        .registry
        .enqueue_task(&uuid, task)
        .await
        .map_err(|e| match e {
            crate::agent::AgentError::QueueFull => {
                ApiError::Unavailable("agent task queue full".into())
            }
            other => ApiError::Internal(other.into()),
        })?;

    state
        .audit
        .emit(
            AuditEntry::new(Subsystem::Host, &auth.username, "task.create")
                .resource("agent", &uuid)
                .client_ip(auth.ip_addr.as_deref())
                .details(serde_json::json!({ "task_type": body.task_type, "task_id": task_id })),
        )
        .await;

    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "task_id": task_id })),
    ))
}

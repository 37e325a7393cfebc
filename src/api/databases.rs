use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use super::helpers::ListResponse;
use crate::audit::{AuditEntry, Subsystem};
use crate::auth::middleware::AuthUser;
use crate::error::ApiError;
use crate::query::executor::{self, QueryResult};
use crate::query::store::{self, DatabaseInstance, NewInstance};
use crate::secrets::engine;
use crate::store::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateInstanceRequest {
    pub name: String,
    #[serde(rename = "type")]
    pub db_type: String,
    pub host: String,
    pub port: i64,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub ssl_mode: Option<String>,
    #[serde(default)]
    pub allow_risky_filters: bool,
}

#[derive(Debug, Serialize)]
pub struct InstanceResponse {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub db_type: String,
    pub host: String,
    pub port: i64,
    pub username: String,
    pub ssl_mode: String,
    pub allow_risky_filters: bool,
    pub status: String,
    pub last_check_at: Option<i64>,
    pub created_at: i64,
}

#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    pub query: String,
    #[serde(default)]
    pub database: String,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/databases", get(list_instances).post(create_instance))
        .route("/databases/{id}/query", post(run_query))
        .route("/databases/{id}/check", post(check_instance))
}

/// Credentials never leave the server; responses carry metadata only.
fn to_response(instance: DatabaseInstance) -> InstanceResponse {
    InstanceResponse {
        id: instance.id,
        name: instance.name,
        db_type: instance.db_type,
        host: instance.host,
        port: instance.port,
        username: instance.username,
        ssl_mode: instance.ssl_mode,
        allow_risky_filters: instance.allow_risky_filters,
        status: instance.status,
        last_check_at: instance.last_check_at,
        created_at: instance.created_at,
    }
}

#[tracing::instrument(skip(state, auth, body), fields(name = %body.name), err)]
async fn create_instance(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(body): Json<CreateInstanceRequest>,
) -> Result<impl IntoResponse, ApiError> {
    auth.require("databases", "admin")?;

    if !matches!(body.db_type.as_str(), "mysql" | "postgresql" | "redis") {
        return Err(ApiError::BadRequest(
            "type must be mysql, postgresql, or redis".into(),
        ));
    }
    if body.name.is_empty() || body.name.len() > 255 {
        return Err(ApiError::BadRequest("name must be 1-255 characters".into()));
    }
    if !(1..=65535).contains(&body.port) {
        return Err(ApiError::BadRequest("port must be 1-65535".into()));
    }

    let cipher = engine::encrypt(body.password.as_bytes(), &state.master_key)
        .map_err(ApiError::Internal)?;

    let instance = store::create_instance(
        &state.db,
        &NewInstance {
            name: &body.name,
            db_type: &body.db_type,
            host: &body.host,
            port: body.port,
            username: &body.username,
            password_cipher: &cipher,
            ssl_mode: body.ssl_mode.as_deref().unwrap_or("prefer"),
            allow_risky_filters: body.allow_risky_filters,
        },
    )
    .await
    .map_err(|e| match e.downcast_ref::<sqlx::Error>() {
        Some(sqlx::Error::Database(db)) if db.is_unique_violation() => {
            ApiError::AlreadyExists("instance name already in use".into())
        }
        _ => ApiError::Internal(e),
    })?;

    state
        .audit
        .emit(
            AuditEntry::new(Subsystem::Database, &auth.username, "instance.create")
                .resource("instance", &instance.name)
                .instance(&instance.id)
                .client_ip(auth.ip_addr.as_deref()),
        )
        .await;

    Ok((StatusCode::CREATED, Json(to_response(instance))))
}

async fn list_instances(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<ListResponse<InstanceResponse>>, ApiError> {
    auth.require("databases", "read")?;

    let instances = store::list_instances(&state.db)
        .await
        .map_err(ApiError::Internal)?;
    let total = i64::try_from(instances.len()).unwrap_or(i64::MAX);
    let items = instances.into_iter().map(to_response).collect();
    Ok(Json(ListResponse { items, total }))
}

#[tracing::instrument(skip(state, auth, body), fields(instance_id = %id), err)]
async fn run_query(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<String>,
    Json(body): Json<QueryRequest>,
) -> Result<Json<QueryResult>, ApiError> {
    auth.require("databases", "exec")?;

    if body.query.trim().is_empty() {
        return Err(ApiError::BadRequest("query must not be empty".into()));
    }

    let instance = store::get_instance(&state.db, &id)
        .await
        .map_err(ApiError::Internal)?
        .ok_or_else(|| ApiError::NotFound("database instance".into()))?;

    let result = executor::run_query(
        &state,
        &instance,
        &body.database,
        &body.query,
        &auth.username,
        auth.ip_addr.as_deref(),
    )
    .await?;
    Ok(Json(result))
}

/// On-demand connectivity probe; refreshes `status` and `last_check_at`.
#[tracing::instrument(skip(state, auth), fields(instance_id = %id), err)]
async fn check_instance(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    auth.require("databases", "exec")?;

    let instance = store::get_instance(&state.db, &id)
        .await
        .map_err(ApiError::Internal)?
        .ok_or_else(|| ApiError::NotFound("database instance".into()))?;

    let probe = if instance.db_type == "redis" {
        "PING"
    } else {
        "SELECT 1"
    };
    let status = match executor::run_query(
        &state,
        &instance,
        "",
        probe,
        &auth.username,
        auth.ip_addr.as_deref(),
    )
    .await
    {
        Ok(_) => "online",
        Err(_) => "offline",
    };

    store::update_status(&state.db, &id, status)
        .await
        .map_err(ApiError::Internal)?;
    Ok(Json(serde_json::json!({ "status": status })))
}

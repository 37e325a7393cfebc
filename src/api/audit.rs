use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;

use super::helpers::{ListResponse, page_to_offset};
use crate::audit::store::{self, AuditEventRow, AuditFilter};
use crate::auth::middleware::AuthUser;
use crate::error::ApiError;
use crate::store::AppState;

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub subsystem: Option<String>,
    pub operator: Option<String>,
    pub action: Option<String>,
    pub from: Option<i64>,
    pub to: Option<i64>,
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/audit", get(list_events))
}

async fn list_events(
    State(state): State<AppState>,
    auth: AuthUser,
    Query(params): Query<ListParams>,
) -> Result<Json<ListResponse<AuditEventRow>>, ApiError> {
    auth.require("audit", "read")?;

    if let Some(ref subsystem) = params.subsystem {
        subsystem
            .parse::<crate::audit::Subsystem>()
            .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    }

    let (limit, offset) = page_to_offset(params.page, params.limit, 500);
    let filter = AuditFilter {
        subsystem: params.subsystem,
        operator: params.operator,
        action: params.action,
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

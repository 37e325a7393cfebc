use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use serde::Deserialize;

use crate::agent::store as agent_store;
use crate::auth::middleware::{AuthUser, authenticate_token};
use crate::store::AppState;
use crate::terminal::{self, TerminalOrigin};

#[derive(Debug, Deserialize)]
pub struct TermParams {
    pub rows: Option<u32>,
    pub cols: Option<u32>,
    /// Browsers cannot set Authorization on a WebSocket upgrade; the token
    /// may ride a query parameter instead.
    pub token: Option<String>,
    pub container: Option<String>,
    #[serde(default = "default_record")]
    pub record: bool,
}

fn default_record() -> bool {
    true
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/ws/ssh/{agent_uuid}", get(webssh))
        .route("/ws/docker/{agent_uuid}/{container_id}", get(docker_exec))
        .route("/ws/k8s/{namespace}/{pod}", get(k8s_exec))
}

/// Authenticate the upgrade from either the Authorization header or the
/// `token` query param. Failures still upgrade, then close with 4401 so the
/// client sees the proper code.
async fn ws_auth(
    state: &AppState,
    headers: &HeaderMap,
    params: &TermParams,
) -> Option<AuthUser> {
    let raw = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(ToOwned::to_owned)
        .or_else(|| params.token.clone())?;
    authenticate_token(state, &raw, None).await.ok()
}

async fn webssh(
    State(state): State<AppState>,
    Path(agent_uuid): Path<String>,
    Query(params): Query<TermParams>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let auth = ws_auth(&state, &headers, &params).await;
    ws.on_upgrade(move |socket| async move {
        let Some(user) = auth else {
            terminal::reject(socket, terminal::CLOSE_UNAUTHENTICATED, "unauthenticated").await;
            return;
        };
        if state.config.agent.disable_webssh {
            terminal::reject(socket, terminal::CLOSE_FORBIDDEN, "webssh is disabled").await;
            return;
        }
        if user.require("terminal", "exec").is_err() {
            terminal::reject(socket, terminal::CLOSE_FORBIDDEN, "forbidden").await;
            return;
        }
        match agent_store::find_by_uuid(&state.db, &agent_uuid).await {
            Ok(Some(agent)) if agent.ssh_enabled && !agent.disabled => {}
            Ok(Some(_)) => {
                terminal::reject(socket, terminal::CLOSE_FORBIDDEN, "ssh disabled for agent").await;
                return;
            }
            _ => {
                terminal::reject(socket, terminal::CLOSE_BACKEND_GATEWAY, "unknown agent").await;
                return;
            }
        }

        terminal::run_session(
            state,
            socket,
            user,
            TerminalOrigin::WebSsh { agent_uuid },
            params.rows.unwrap_or(40),
            params.cols.unwrap_or(120),
            params.record,
        )
        .await;
    })
}

async fn docker_exec(
    State(state): State<AppState>,
    Path((agent_uuid, container_id)): Path<(String, String)>,
    Query(params): Query<TermParams>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let auth = ws_auth(&state, &headers, &params).await;
    ws.on_upgrade(move |socket| async move {
        let Some(user) = auth else {
            terminal::reject(socket, terminal::CLOSE_UNAUTHENTICATED, "unauthenticated").await;
            return;
        };
        if user.require("terminal", "exec").is_err() {
            terminal::reject(socket, terminal::CLOSE_FORBIDDEN, "forbidden").await;
            return;
        }

        terminal::run_session(
            state,
            socket,
            user,
            TerminalOrigin::Docker {
                agent_uuid,
                container_id,
            },
            params.rows.unwrap_or(40),
            params.cols.unwrap_or(120),
            params.record,
        )
        .await;
    })
}

async fn k8s_exec(
    State(state): State<AppState>,
    Path((namespace, pod)): Path<(String, String)>,
    Query(params): Query<TermParams>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let auth = ws_auth(&state, &headers, &params).await;
    ws.on_upgrade(move |socket| async move {
        let Some(user) = auth else {
            terminal::reject(socket, terminal::CLOSE_UNAUTHENTICATED, "unauthenticated").await;
            return;
        };
        if user.require("terminal", "exec").is_err() {
            terminal::reject(socket, terminal::CLOSE_FORBIDDEN, "forbidden").await;
            return;
        }

        terminal::run_session(
            state,
            socket,
            user,
            TerminalOrigin::K8sPod {
                namespace,
                pod,
                container: params.container.clone(),
            },
            params.rows.unwrap_or(40),
            params.cols.unwrap_or(120),
            params.record,
        )
        .await;
    })
}

pub mod agents;
pub mod audit;
pub mod auth;
pub mod databases;
pub mod helpers;
pub mod recordings;
pub mod terminal;

use axum::Router;
use axum::extract::State;
use axum::routing::get;

use crate::store::AppState;

/// Full HTTP surface: health, metrics, and the versioned API.
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .merge(auth::router())
        .merge(agents::router())
        .merge(recordings::router())
        .merge(audit::router())
        .merge(databases::router())
        .merge(terminal::router());

    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/metrics", get(metrics))
        .nest("/api/v1", api)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

async fn metrics(State(state): State<AppState>) -> String {
    state.metrics.render()
}

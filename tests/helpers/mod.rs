#![allow(dead_code)]

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use base64::Engine;
use http_body_util::BodyExt;
use serde_json::Value;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use opshub::audit::writer::{self, AuditWriter};
use opshub::agent::registry::AgentRegistry;
use opshub::config::Config;
use opshub::metrics::Metrics;
use opshub::recording::cleanup;
use opshub::recording::storage::{LocalStorage, RecordingStorage};
use opshub::store::{AppState, ConnectionGuard, Db, bootstrap, schema};

pub const TEST_PASSWORD: &str = "testpassword";

pub struct TestEnv {
    pub state: AppState,
    pub writer: AuditWriter,
    pub cancel: CancellationToken,
    pub tmp: TempDir,
}

/// Test defaults: fast bcrypt, 1s audit flush, tiny dial timeout, recording
/// storage under a tempdir.
pub fn test_config(tmp: &TempDir) -> Config {
    let mut cfg = Config::default();
    cfg.jwt.secret = "integration-Xk39fJq8LmPw2Zr7Tb5Nv4Hd6Sg1".into();
    cfg.security.encryption_key =
        base64::engine::general_purpose::STANDARD.encode([9u8; 32]);
    cfg.security.bcrypt_cost = 4;
    cfg.audit.channel_buffer = 64;
    cfg.audit.batch_size = 8;
    cfg.audit.flush_period_secs = 1;
    cfg.audit.worker_count = 2;
    cfg.agent.dial_timeout_secs = 3;
    cfg.auth.max_concurrent_sessions = 5;
    cfg.recording.base_path = tmp
        .path()
        .join("recordings")
        .to_string_lossy()
        .into_owned();
    cfg.recording.idle_timeout_secs = 60;
    cfg
}

/// Build a full `AppState` over a file-backed SQLite store (single
/// connection, so no cross-connection in-memory surprises).
pub async fn test_env() -> TestEnv {
    test_env_with(|_| {}).await
}

pub async fn test_env_with(tweak: impl FnOnce(&mut Config)) -> TestEnv {
    let tmp = TempDir::new().expect("tempdir");
    let mut cfg = test_config(&tmp);
    tweak(&mut cfg);
    cfg.validate().expect("test config invalid");

    let db_path = tmp.path().join("opshub-test.db");
    let url = format!("sqlite://{}?mode=rwc", db_path.display());
    let db = Db::connect_lite(&url).await.expect("db connect");
    schema::migrate(&db).await.expect("migrate");
    bootstrap::run(&db, Some(TEST_PASSWORD), cfg.security.bcrypt_cost)
        .await
        .expect("bootstrap");

    let metrics = Arc::new(Metrics::new().expect("metrics"));
    let (audit_logger, writer) = writer::spawn(db.clone(), &cfg.audit, Arc::clone(&metrics));
    let registry = AgentRegistry::new(db.clone(), cfg.agent.clone(), Arc::clone(&metrics));

    let storage: Arc<dyn RecordingStorage> =
        Arc::new(LocalStorage::new(tmp.path().join("recordings")));

    let cancel = CancellationToken::new();
    let cleanup_handle = cleanup::spawn(
        db.clone(),
        Arc::clone(&storage),
        cfg.recording.clone(),
        Arc::clone(&metrics),
        cancel.clone(),
    )
    .expect("cleanup scheduler");

    let master_key = cfg.master_key().expect("master key");
    let config = Arc::new(cfg);

    let state = AppState {
        db,
        config: Arc::clone(&config),
        metrics,
        audit: audit_logger,
        registry,
        storage,
        cleanup: cleanup_handle,
        conn_guard: Arc::new(ConnectionGuard::new(config.query.max_connections)),
        master_key,
        kube: None,
    };

    TestEnv {
        state,
        writer,
        cancel,
        tmp,
    }
}

pub fn app(env: &TestEnv) -> Router {
    opshub::api::router(env.state.clone())
}

pub async fn send_json(
    app: &Router,
    method: &str,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    let request = match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .expect("request"),
        None => builder.body(Body::empty()).expect("request"),
    };

    let response = app.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::String(
            String::from_utf8_lossy(&bytes).into_owned(),
        ))
    };
    (status, json)
}

/// Log in and return the bearer token.
pub async fn login(app: &Router, username: &str, password: &str) -> String {
    let (status, body) = send_json(
        app,
        "POST",
        "/api/v1/auth/login",
        None,
        Some(serde_json::json!({ "username": username, "password": password })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "login failed: {body}");
    body["token"].as_str().expect("token").to_owned()
}

/// Create an extra user directly in the store.
pub async fn create_user(env: &TestEnv, username: &str, role: &str) {
    let hash = opshub::auth::password::hash_password(TEST_PASSWORD, 4).expect("hash");
    sqlx::query(&env.state.db.sql(
        "INSERT INTO users (id, username, password_hash, role, is_active, created_at)
         VALUES ($1, $2, $3, $4, 1, $5)",
    ))
    .bind(uuid::Uuid::new_v4().to_string())
    .bind(username)
    .bind(&hash)
    .bind(role)
    .bind(chrono::Utc::now().timestamp_millis())
    .execute(&env.state.db.pool)
    .await
    .expect("insert user");
}

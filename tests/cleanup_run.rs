mod helpers;

use axum::http::StatusCode;
use helpers::{TEST_PASSWORD, app, login, send_json, test_env};
use opshub::recording::cleanup;
use opshub::recording::storage::RecordingStorage;
use opshub::recording::store::{self, NewRecording};

const DAY_MS: i64 = 24 * 3600 * 1000;

/// Insert a finished recording and its cast file, returning `(id, rel_path)`.
async fn seed_recording(
    env: &helpers::TestEnv,
    name: &str,
    ended_ago_ms: i64,
    duration: i64,
    write_file: bool,
) -> (String, String) {
    let id = store::create(
        &env.state.db,
        &NewRecording {
            session_id: name,
            user_id: "u1",
            username: "admin",
            recording_type: "webssh",
            type_metadata: serde_json::json!({}),
            storage_type: "local",
            storage_path: "",
            rows: 40,
            cols: 120,
            shell: "/bin/sh",
            client_ip: None,
            tags: &[],
        },
    )
    .await
    .unwrap();

    let rel_path = format!("2026-07-01/{id}.cast");
    let mut size = 0i64;
    if write_file {
        env.state
            .storage
            .append(&rel_path, b"{\"version\":2}\n[0.1,\"o\",\"x\"]\n")
            .await
            .unwrap();
        size = i64::try_from(env.state.storage.finalize(&rel_path).await.unwrap()).unwrap();
    }

    sqlx::query(&env.state.db.sql(
        "UPDATE terminal_recordings
         SET storage_path = $1, ended_at = $2, duration_seconds = $3, file_size_bytes = $4
         WHERE id = $5",
    ))
    .bind(&rel_path)
    .bind(chrono::Utc::now().timestamp_millis() - ended_ago_ms)
    .bind(duration)
    .bind(size)
    .bind(&id)
    .execute(&env.state.db.pool)
    .await
    .unwrap();

    (id, rel_path)
}

async fn recording_exists(env: &helpers::TestEnv, id: &str) -> bool {
    store::get(&env.state.db, id).await.unwrap().is_some()
}

#[tokio::test]
async fn sweeps_expired_and_invalid_but_not_fresh() {
    let env = test_env().await;

    // r1: expired (ended 91 days ago), r2: invalid (zero size + duration),
    // r3: fresh (ended yesterday).
    let (r1, p1) = seed_recording(&env, "s-r1", 91 * DAY_MS, 30, true).await;
    let (r2, p2) = seed_recording(&env, "s-r2", DAY_MS, 0, false).await;
    let (r3, p3) = seed_recording(&env, "s-r3", DAY_MS, 30, true).await;

    let report = cleanup::run_sweeps(
        &env.state.db,
        &env.state.storage,
        &env.state.config.recording,
        &env.state.metrics,
    )
    .await
    .unwrap();

    assert_eq!(report.invalid, 1);
    assert_eq!(report.expired, 1);
    assert!(report.bytes_freed > 0);

    assert!(!recording_exists(&env, &r1).await);
    assert!(!recording_exists(&env, &r2).await);
    assert!(recording_exists(&env, &r3).await);

    assert!(!env.state.storage.exists(&p1).await.unwrap());
    assert!(!env.state.storage.exists(&p2).await.unwrap());
    assert!(env.state.storage.exists(&p3).await.unwrap());
}

#[tokio::test]
async fn rerun_on_clean_state_changes_nothing() {
    let env = test_env().await;
    let (_r1, _) = seed_recording(&env, "s-a", 100 * DAY_MS, 30, true).await;
    let (_r3, _) = seed_recording(&env, "s-b", DAY_MS, 30, true).await;

    let first = cleanup::run_sweeps(
        &env.state.db,
        &env.state.storage,
        &env.state.config.recording,
        &env.state.metrics,
    )
    .await
    .unwrap();
    assert_eq!(first.expired, 1);

    let second = cleanup::run_sweeps(
        &env.state.db,
        &env.state.storage,
        &env.state.config.recording,
        &env.state.metrics,
    )
    .await
    .unwrap();
    assert_eq!(second.invalid, 0);
    assert_eq!(second.expired, 0);
    assert_eq!(second.orphan, 0);
    assert_eq!(second.missing, 0);
    assert_eq!(second.bytes_freed, 0);
}

#[tokio::test]
async fn orphan_files_and_missing_rows_are_reaped() {
    let env = test_env().await;

    // Orphan: a cast file with no row.
    env.state
        .storage
        .append("2026-07-02/deadbeef-0000.cast", b"stray")
        .await
        .unwrap();
    env.state
        .storage
        .finalize("2026-07-02/deadbeef-0000.cast")
        .await
        .unwrap();

    // Missing: a finished row whose cast file is gone.
    let (gone, rel) = seed_recording(&env, "s-miss", DAY_MS, 30, true).await;
    env.state.storage.delete(&rel).await.unwrap();

    let report = cleanup::run_sweeps(
        &env.state.db,
        &env.state.storage,
        &env.state.config.recording,
        &env.state.metrics,
    )
    .await
    .unwrap();

    assert_eq!(report.orphan, 1);
    assert_eq!(report.missing, 1);
    assert!(
        !env.state
            .storage
            .exists("2026-07-02/deadbeef-0000.cast")
            .await
            .unwrap()
    );
    assert!(!recording_exists(&env, &gone).await);
}

#[tokio::test]
async fn trigger_endpoint_runs_and_reports_status() {
    let env = test_env().await;
    let app = app(&env);

    seed_recording(&env, "s-t1", 120 * DAY_MS, 30, true).await;
    seed_recording(&env, "s-t2", DAY_MS, 0, false).await;

    let token = login(&app, "admin", TEST_PASSWORD).await;
    let (status, body) = send_json(
        &app,
        "POST",
        "/api/v1/recordings/cleanup/trigger",
        Some(&token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert!(body["task_id"].as_str().is_some());

    // The run is asynchronous; poll the status endpoint.
    let mut last = serde_json::Value::Null;
    for _ in 0..50 {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        let (status, body) = send_json(
            &app,
            "GET",
            "/api/v1/recordings/cleanup/status",
            Some(&token),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        last = body;
        if last["status"] == "ok" {
            break;
        }
    }
    assert_eq!(last["status"], "ok", "cleanup never finished: {last}");
    assert_eq!(last["expired_cleaned"], 1);
    assert_eq!(last["invalid_cleaned"], 1);
    assert!(last["last_run_at"].as_i64().is_some());
}

#[tokio::test]
async fn viewer_cannot_trigger_cleanup() {
    let env = test_env().await;
    let app = app(&env);
    helpers::create_user(&env, "viewer1", "viewer").await;

    let token = login(&app, "viewer1", TEST_PASSWORD).await;
    let (status, body) = send_json(
        &app,
        "POST",
        "/api/v1/recordings/cleanup/trigger",
        Some(&token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], "Forbidden");
}

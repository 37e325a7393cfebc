mod helpers;

use axum::http::StatusCode;
use helpers::{TEST_PASSWORD, app, login, send_json, test_env};
use opshub::recording::storage::RecordingStorage;
use opshub::recording::store::{self, NewRecording};

async fn seed(env: &helpers::TestEnv, session: &str, kind: &str, content: &[u8]) -> String {
    let id = store::create(
        &env.state.db,
        &NewRecording {
            session_id: session,
            user_id: "u1",
            username: "admin",
            recording_type: kind,
            type_metadata: serde_json::json!({"agent_uuid": "a1"}),
            storage_type: "local",
            storage_path: "",
            rows: 40,
            cols: 120,
            shell: "/bin/sh",
            client_ip: Some("10.1.2.3"),
            tags: &[],
        },
    )
    .await
    .unwrap();

    let rel = format!("2026-07-30/{id}.cast");
    env.state.storage.append(&rel, content).await.unwrap();
    let size = env.state.storage.finalize(&rel).await.unwrap();

    sqlx::query(&env.state.db.sql(
        "UPDATE terminal_recordings
         SET storage_path = $1, ended_at = $2, duration_seconds = 5, file_size_bytes = $3
         WHERE id = $4",
    ))
    .bind(&rel)
    .bind(chrono::Utc::now().timestamp_millis())
    .bind(i64::try_from(size).unwrap())
    .bind(&id)
    .execute(&env.state.db.pool)
    .await
    .unwrap();
    id
}

#[tokio::test]
async fn list_filters_by_type() {
    let env = test_env().await;
    let app = app(&env);
    seed(&env, "l1", "webssh", b"{}\n").await;
    seed(&env, "l2", "docker", b"{}\n").await;

    let token = login(&app, "admin", TEST_PASSWORD).await;

    let (status, body) = send_json(&app, "GET", "/api/v1/recordings", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 2);

    let (status, body) = send_json(
        &app,
        "GET",
        "/api/v1/recordings?recording_type=docker",
        Some(&token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 1);
    assert_eq!(body["items"][0]["recording_type"], "docker");
    // Geometry invariants hold on everything served.
    let rows = body["items"][0]["rows"].as_i64().unwrap();
    let cols = body["items"][0]["cols"].as_i64().unwrap();
    assert!((10..=200).contains(&rows));
    assert!((40..=300).contains(&cols));
}

#[tokio::test]
async fn playback_serves_the_raw_cast() {
    let env = test_env().await;
    let app = app(&env);
    let content = b"{\"version\":2,\"width\":120,\"height\":40}\n[0.5,\"o\",\"hello\"]\n";
    let id = seed(&env, "p1", "webssh", content).await;

    let token = login(&app, "admin", TEST_PASSWORD).await;

    use http_body_util::BodyExt;
    use tower::ServiceExt;
    let request = axum::http::Request::builder()
        .method("GET")
        .uri(format!("/api/v1/recordings/{id}/playback"))
        .header("authorization", format!("Bearer {token}"))
        .body(axum::body::Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "application/x-asciicast"
    );
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&bytes[..], content);

    let request = axum::http::Request::builder()
        .method("GET")
        .uri(format!("/api/v1/recordings/{id}/download"))
        .header("authorization", format!("Bearer {token}"))
        .body(axum::body::Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let disposition = response
        .headers()
        .get("content-disposition")
        .unwrap()
        .to_str()
        .unwrap();
    assert!(disposition.contains(&format!("{id}.cast")));
}

#[tokio::test]
async fn missing_recording_is_404() {
    let env = test_env().await;
    let app = app(&env);
    let token = login(&app, "admin", TEST_PASSWORD).await;

    let (status, body) = send_json(
        &app,
        "GET",
        "/api/v1/recordings/00000000-0000-0000-0000-000000000000/playback",
        Some(&token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "NotFound");
}

mod helpers;

use axum::http::StatusCode;
use helpers::{TEST_PASSWORD, app, login, send_json, test_env, test_env_with};

#[tokio::test]
async fn login_returns_token_and_session() {
    let env = test_env().await;
    let app = app(&env);

    let (status, body) = send_json(
        &app,
        "POST",
        "/api/v1/auth/login",
        None,
        Some(serde_json::json!({ "username": "admin", "password": TEST_PASSWORD })),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["user"]["username"], "admin");
    assert_eq!(body["user"]["role"], "admin");
    assert!(body["token"].as_str().is_some_and(|t| t.contains('.')));
    assert!(body["refresh_token"].as_str().is_some_and(|t| t.starts_with("oh_r_")));
    assert!(body["session"].as_str().is_some());
    assert!(body["expires_at"].as_i64().unwrap() > chrono::Utc::now().timestamp_millis());
}

#[tokio::test]
async fn wrong_password_is_rejected_and_audited() {
    let env = test_env().await;
    let app = app(&env);

    let (status, body) = send_json(
        &app,
        "POST",
        "/api/v1/auth/login",
        None,
        Some(serde_json::json!({ "username": "admin", "password": "not-the-password" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "Unauthenticated");

    // The failed attempt flows through the async audit pipeline.
    tokio::time::sleep(std::time::Duration::from_millis(1500)).await;
    let token = login(&app, "admin", TEST_PASSWORD).await;
    let (status, body) = send_json(
        &app,
        "GET",
        "/api/v1/audit?subsystem=auth",
        Some(&token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let items = body["items"].as_array().unwrap();
    assert!(
        items
            .iter()
            .any(|e| e["action"] == "login" && e["success"] == false),
        "expected a failed login audit event, got: {items:?}"
    );
}

#[tokio::test]
async fn oversized_password_is_rejected() {
    let env = test_env().await;
    let app = app(&env);

    let (status, body) = send_json(
        &app,
        "POST",
        "/api/v1/auth/login",
        None,
        Some(serde_json::json!({ "username": "admin", "password": "a".repeat(73) })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "BadRequest");
}

#[tokio::test]
async fn requests_without_token_are_unauthenticated() {
    let env = test_env().await;
    let app = app(&env);

    let (status, _) = send_json(&app, "GET", "/api/v1/audit", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send_json(&app, "GET", "/api/v1/recordings", Some("garbage"), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn concurrent_session_cap_invalidates_oldest() {
    let env = test_env_with(|cfg| cfg.auth.max_concurrent_sessions = 2).await;
    let app = app(&env);

    let mut sessions = Vec::new();
    for _ in 0..3 {
        let (status, body) = send_json(
            &app,
            "POST",
            "/api/v1/auth/login",
            None,
            Some(serde_json::json!({ "username": "admin", "password": TEST_PASSWORD })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        sessions.push(body["session"].as_str().unwrap().to_owned());
        // Distinct issue timestamps so eviction order is deterministic.
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    let user_id: String =
        sqlx::query_scalar(&env.state.db.sql("SELECT id FROM users WHERE username = $1"))
            .bind("admin")
            .fetch_one(&env.state.db.pool)
            .await
            .unwrap();

    let active = opshub::auth::session::active_count(&env.state.db, &user_id)
        .await
        .unwrap();
    assert_eq!(active, 2);

    // The first session was evicted, the last two survive.
    assert!(
        !opshub::auth::session::is_active(&env.state.db, &sessions[0])
            .await
            .unwrap()
    );
    assert!(
        opshub::auth::session::is_active(&env.state.db, &sessions[1])
            .await
            .unwrap()
    );
    assert!(
        opshub::auth::session::is_active(&env.state.db, &sessions[2])
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn logout_revokes_the_session() {
    let env = test_env().await;
    let app = app(&env);
    let token = login(&app, "admin", TEST_PASSWORD).await;

    let (status, _) = send_json(&app, "GET", "/api/v1/audit", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send_json(&app, "POST", "/api/v1/auth/logout", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send_json(&app, "GET", "/api/v1/audit", Some(&token), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

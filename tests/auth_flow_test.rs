mod common;

use axum::http::{Method, StatusCode};
use common::{body_json, TestApp};
use serde_json::json;

async fn refresh(app: &TestApp, token: &str) -> axum::response::Response {
    app.request(
        Method::POST,
        "/api/auth/refresh",
        Some(json!({"refreshToken": token})),
        None,
    )
    .await
}

#[tokio::test]
async fn rotated_token_replay_revokes_the_whole_family() {
    let app = TestApp::new().await;
    let user = app.register("rotate@example.com").await;

    let rotated = refresh(&app, &user.refresh_token).await;
    assert_eq!(rotated.status(), StatusCode::OK);
    let rotated = body_json(rotated).await;
    let newest = rotated["refreshToken"].as_str().unwrap().to_string();
    assert_ne!(newest, user.refresh_token);
    assert_eq!(rotated["tokenType"], "Bearer");

    // Presenting the already-rotated token is treated as theft.
    let replay = refresh(&app, &user.refresh_token).await;
    assert_eq!(replay.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        body_json(replay).await["error"]["code"],
        "AUTH_TOKEN_REUSE_DETECTED"
    );

    // The legitimate successor died with the family.
    let successor = refresh(&app, &newest).await;
    assert_eq!(successor.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn unknown_refresh_token_is_invalid() {
    let app = TestApp::new().await;
    let response = refresh(&app, "not-a-real-token").await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(response).await["error"]["code"], "AUTH_INVALID_TOKEN");
}

#[tokio::test]
async fn logout_revokes_and_is_idempotent() {
    let app = TestApp::new().await;
    let user = app.register("bye@example.com").await;

    for _ in 0..2 {
        let response = app
            .request(
                Method::POST,
                "/api/auth/logout",
                Some(json!({"refreshToken": user.refresh_token})),
                None,
            )
            .await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    let response = refresh(&app, &user.refresh_token).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn duplicate_email_and_bad_password_are_reported() {
    let app = TestApp::new().await;
    app.register("taken@example.com").await;

    let duplicate = app
        .request(
            Method::POST,
            "/api/auth/register",
            Some(json!({
                "username": "someone",
                "email": "Taken@Example.com",
                "password": "another password"
            })),
            None,
        )
        .await;
    assert_eq!(duplicate.status(), StatusCode::CONFLICT);
    assert_eq!(body_json(duplicate).await["error"]["code"], "AUTH_EMAIL_TAKEN");

    let wrong = app
        .request(
            Method::POST,
            "/api/auth/login",
            Some(json!({"email": "taken@example.com", "password": "wrong password"})),
            None,
        )
        .await;
    assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn protected_routes_require_a_bearer_token() {
    let app = TestApp::new().await;

    let anonymous = app.request(Method::GET, "/api/orders", None, None).await;
    assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);

    let garbage = app
        .request(Method::GET, "/api/orders", None, Some("not.a.jwt"))
        .await;
    assert_eq!(garbage.status(), StatusCode::UNAUTHORIZED);

    let health = app.request(Method::GET, "/health", None, None).await;
    assert_eq!(health.status(), StatusCode::OK);
}

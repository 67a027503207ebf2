mod common;

use axum::http::StatusCode;
use serde_json::json;

// ── GET /users/@me — authenticated success ───────────────────────────────────

#[tokio::test]
async fn get_current_user_success() {
    let pool = common::test_pool().await;
    let app = common::create_test_app(pool);
    let username = common::unique_username();

    let token = common::register_and_get_token(app.clone(), &username, "password123").await;
    let (status, body) = common::get_authed(app, "/users/@me", &token).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["username"], username.as_str());
    assert!(body["id"].is_string(), "response should contain 'id' field");
    assert!(body["status"].is_string(), "response should contain 'status' field");
    assert!(
        body.get("password_hash").is_none(),
        "response must NOT expose password_hash"
    );
}

// ── GET /users/@me — no Authorization header → 401 ───────────────────────────

#[tokio::test]
async fn get_current_user_no_auth() {
    let pool = common::test_pool().await;
    let app = common::create_test_app(pool);

    let (status, body) = common::get_no_auth(app, "/users/@me").await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(
        body.get("error").is_some(),
        "response body should contain 'error' key, got: {body}"
    );
}

// ── GET /users/@me — malformed token → 401 ───────────────────────────────────

#[tokio::test]
async fn get_current_user_invalid_token() {
    let pool = common::test_pool().await;
    let app = common::create_test_app(pool);

    let (status, body) = common::get_authed(app, "/users/@me", "garbage").await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(
        body.get("error").is_some(),
        "response body should contain 'error' key, got: {body}"
    );
}

// ── GET /users/@me — JWT signed with wrong secret → 401 ──────────────────────

#[tokio::test]
async fn get_current_user_wrong_secret() {
    let pool = common::test_pool().await;
    let app = common::create_test_app(pool);

    use jsonwebtoken::{encode, EncodingKey, Header};

    let fake_token = encode(
        &Header::default(),
        &json!({
            "sub": "00000000-0000-0000-0000-000000000000",
            "exp": 9999999999i64,
            "iat": 0,
            "username": "x",
            "token_type": "access"
        }),
        &EncodingKey::from_secret(b"wrong-secret-wrong-secret-wrong!!"),
    )
    .unwrap();

    let (status, body) = common::get_authed(app, "/users/@me", &fake_token).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(
        body.get("error").is_some(),
        "response body should contain 'error' key, got: {body}"
    );
}

// ── GET /users/:id — another user's public profile ──────────────────────────

#[tokio::test]
async fn get_user_by_id_success() {
    let pool = common::test_pool().await;
    let app = common::create_test_app(pool);

    let (token, _id) =
        common::register_user_with_id(app.clone(), &common::unique_username(), "password123").await;
    let (_other_token, other_id) =
        common::register_user_with_id(app.clone(), &common::unique_username(), "password123").await;

    let (status, body) = common::get_authed(app, &format!("/users/{other_id}"), &token).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], other_id);
    assert!(body.get("password_hash").is_none());
}

#[tokio::test]
async fn get_user_by_id_not_found() {
    let pool = common::test_pool().await;
    let app = common::create_test_app(pool);

    let token =
        common::register_and_get_token(app.clone(), &common::unique_username(), "password123").await;

    let (status, _body) =
        common::get_authed(app, &format!("/users/{}", uuid::Uuid::new_v4()), &token).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn get_user_by_id_requires_auth() {
    let pool = common::test_pool().await;
    let app = common::create_test_app(pool);

    let (_token, id) =
        common::register_user_with_id(app.clone(), &common::unique_username(), "password123").await;

    let (status, _body) = common::get_no_auth(app, &format!("/users/{id}")).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

// ── GET /status/:user_id — presence snapshot ─────────────────────────────────

#[tokio::test]
async fn get_status_defaults_to_offline_without_a_live_session() {
    let pool = common::test_pool().await;
    let app = common::create_test_app(pool);

    let (token, _id) =
        common::register_user_with_id(app.clone(), &common::unique_username(), "password123").await;
    let (_other_token, other_id) =
        common::register_user_with_id(app.clone(), &common::unique_username(), "password123").await;

    let (status, body) = common::get_authed(app, &format!("/status/{other_id}"), &token).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["kind"], "offline");
}

// ── PUT /status — set presence kind/custom message ───────────────────────────

#[tokio::test]
async fn update_status_to_busy() {
    let pool = common::test_pool().await;
    let app = common::create_test_app(pool);

    let token =
        common::register_and_get_token(app.clone(), &common::unique_username(), "password123").await;

    let (status, body) = common::put_json_authed(
        app,
        "/status",
        &token,
        json!({ "status": "busy", "custom_message": null, "custom_emoji": null }),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["kind"], "busy");
}

#[tokio::test]
async fn update_status_with_custom_message_and_emoji() {
    let pool = common::test_pool().await;
    let app = common::create_test_app(pool);

    let token =
        common::register_and_get_token(app.clone(), &common::unique_username(), "password123").await;

    let (status, body) = common::put_json_authed(
        app,
        "/status",
        &token,
        json!({
            "status": "custom",
            "custom_message": "In a meeting",
            "custom_emoji": "📅",
        }),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["kind"], "custom");
    assert_eq!(body["custom_message"], "In a meeting");
    assert_eq!(body["custom_emoji"], "📅");
}

#[tokio::test]
async fn update_status_rejects_away_as_directly_settable() {
    let pool = common::test_pool().await;
    let app = common::create_test_app(pool);

    let token =
        common::register_and_get_token(app.clone(), &common::unique_username(), "password123").await;

    let (status, body) = common::put_json_authed(
        app,
        "/status",
        &token,
        json!({ "status": "away", "custom_message": null, "custom_emoji": null }),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.get("error").is_some());
}

#[tokio::test]
async fn update_status_requires_auth() {
    use axum::body::Body;
    use axum::http::{header, Method, Request};
    use tower::ServiceExt;

    let pool = common::test_pool().await;
    let app = common::create_test_app(pool);

    let req = Request::builder()
        .method(Method::PUT)
        .uri("/status")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            json!({ "status": "busy", "custom_message": null, "custom_emoji": null }).to_string(),
        ))
        .unwrap();

    let response = app.oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

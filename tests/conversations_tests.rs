mod common;

use axum::http::StatusCode;
use serde_json::json;

/// Register two fresh users; return (token_a, id_a, token_b, id_b).
async fn setup_two_users(app: axum::Router) -> (String, String, String, String) {
    let (token_a, id_a) =
        common::register_user_with_id(app.clone(), &common::unique_username(), "pass1234").await;
    let (token_b, id_b) =
        common::register_user_with_id(app.clone(), &common::unique_username(), "pass1234").await;
    (token_a, id_a, token_b, id_b)
}

// ============================================================================
// POST /conversations/direct — open or retrieve a direct conversation
// ============================================================================

#[tokio::test]
async fn create_direct_conversation_creates_new() {
    let pool = common::test_pool().await;
    let app = common::create_test_app(pool);
    let (token_a, _id_a, _token_b, id_b) = setup_two_users(app.clone()).await;

    let (status, body) =
        common::post_json_authed(app, "/conversations/direct", &token_a, json!({ "peer_id": id_b })).await;

    assert_eq!(status, StatusCode::CREATED);
    assert!(body["id"].is_string());
    assert_eq!(body["kind"], "direct");
    let participants = body["participant_ids"].as_array().unwrap();
    assert_eq!(participants.len(), 2);
}

#[tokio::test]
async fn create_direct_conversation_idempotent() {
    let pool = common::test_pool().await;
    let app = common::create_test_app(pool);
    let (token_a, _id_a, _token_b, id_b) = setup_two_users(app.clone()).await;

    let (s1, b1) =
        common::post_json_authed(app.clone(), "/conversations/direct", &token_a, json!({ "peer_id": id_b })).await;
    let (s2, b2) =
        common::post_json_authed(app, "/conversations/direct", &token_a, json!({ "peer_id": id_b })).await;

    // Second call must return 200 OK (not 201), same conversation id.
    assert_eq!(s1, StatusCode::CREATED);
    assert_eq!(s2, StatusCode::OK);
    assert_eq!(b1["id"], b2["id"]);
}

#[tokio::test]
async fn create_direct_conversation_self_returns_400() {
    let pool = common::test_pool().await;
    let app = common::create_test_app(pool);
    let (token, id) =
        common::register_user_with_id(app.clone(), &common::unique_username(), "pass1234").await;

    let (status, _) =
        common::post_json_authed(app, "/conversations/direct", &token, json!({ "peer_id": id })).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn create_direct_conversation_requires_auth() {
    let pool = common::test_pool().await;
    let app = common::create_test_app(pool);

    let (status, _) =
        common::post_json(app, "/conversations/direct", json!({ "peer_id": uuid::Uuid::new_v4() })).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

// ============================================================================
// POST /conversations — create a group conversation
// ============================================================================

#[tokio::test]
async fn create_group_conversation_success() {
    let pool = common::test_pool().await;
    let app = common::create_test_app(pool);
    let (token_a, _id_a, _token_b, id_b) = setup_two_users(app.clone()).await;

    let body = common::create_group_conversation(app, &token_a, &[&id_b]).await;

    assert_eq!(body["kind"], "group");
    assert_eq!(body["display_name"], "Test Group");
    assert_eq!(body["participant_ids"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn create_group_conversation_adds_caller_even_if_omitted() {
    let pool = common::test_pool().await;
    let app = common::create_test_app(pool);
    let (token_a, id_a, _token_b, id_b) = setup_two_users(app.clone()).await;

    let body = common::create_group_conversation(app, &token_a, &[&id_b]).await;

    let participants: Vec<&str> = body["participant_ids"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap())
        .collect();
    assert!(participants.contains(&id_a.as_str()));
}

#[tokio::test]
async fn create_group_conversation_requires_two_participants() {
    let pool = common::test_pool().await;
    let app = common::create_test_app(pool);
    let token =
        common::register_and_get_token(app.clone(), &common::unique_username(), "pass1234").await;

    let (status, body) = common::post_json_authed(
        app,
        "/conversations",
        &token,
        json!({ "display_name": "Solo", "participant_ids": [] }),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");
}

// ============================================================================
// GET /conversations — list the caller's conversations
// ============================================================================

#[tokio::test]
async fn list_conversations_returns_only_the_callers_conversations() {
    let pool = common::test_pool().await;
    let app = common::create_test_app(pool);
    let (token_a, _id_a, token_b, id_b) = setup_two_users(app.clone()).await;

    common::open_direct_conversation(app.clone(), &token_a, &id_b).await;

    let (status, body) = common::get_authed(app.clone(), "/conversations", &token_a).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);

    // token_b is also a participant of the same direct conversation.
    let (status, body) = common::get_authed(app, "/conversations", &token_b).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn list_conversations_empty_for_fresh_user() {
    let pool = common::test_pool().await;
    let app = common::create_test_app(pool);
    let token =
        common::register_and_get_token(app.clone(), &common::unique_username(), "pass1234").await;

    let (status, body) = common::get_authed(app, "/conversations", &token).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 0);
}

// ============================================================================
// PUT /conversations/:id — rename and adjust group membership
// ============================================================================

#[tokio::test]
async fn update_conversation_renames_group() {
    let pool = common::test_pool().await;
    let app = common::create_test_app(pool);
    let (token_a, _id_a, _token_b, id_b) = setup_two_users(app.clone()).await;

    let group = common::create_group_conversation(app.clone(), &token_a, &[&id_b]).await;
    let conversation_id = group["id"].as_str().unwrap().to_owned();

    let (status, body) = common::put_json_authed(
        app,
        &format!("/conversations/{conversation_id}"),
        &token_a,
        json!({ "display_name": "Renamed" }),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["display_name"], "Renamed");
}

#[tokio::test]
async fn update_conversation_adds_and_removes_participants() {
    let pool = common::test_pool().await;
    let app = common::create_test_app(pool);
    let (token_a, _id_a, _token_b, id_b) = setup_two_users(app.clone()).await;
    let (_token_c, id_c) =
        common::register_user_with_id(app.clone(), &common::unique_username(), "pass1234").await;

    let group = common::create_group_conversation(app.clone(), &token_a, &[&id_b]).await;
    let conversation_id = group["id"].as_str().unwrap().to_owned();

    let (status, body) = common::put_json_authed(
        app,
        &format!("/conversations/{conversation_id}"),
        &token_a,
        json!({ "add_participant_ids": [id_c], "remove_participant_ids": [id_b] }),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let participants: Vec<&str> = body["participant_ids"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap())
        .collect();
    assert!(participants.contains(&id_c.as_str()));
    assert!(!participants.contains(&id_b.as_str()));
}

#[tokio::test]
async fn update_conversation_rejects_direct_conversation() {
    let pool = common::test_pool().await;
    let app = common::create_test_app(pool);
    let (token_a, _id_a, _token_b, id_b) = setup_two_users(app.clone()).await;

    let direct = common::open_direct_conversation(app.clone(), &token_a, &id_b).await;
    let conversation_id = direct["id"].as_str().unwrap().to_owned();

    let (status, _body) = common::put_json_authed(
        app,
        &format!("/conversations/{conversation_id}"),
        &token_a,
        json!({ "display_name": "Nope" }),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn update_conversation_non_participant_forbidden() {
    let pool = common::test_pool().await;
    let app = common::create_test_app(pool);
    let (token_a, _id_a, _token_b, id_b) = setup_two_users(app.clone()).await;

    let group = common::create_group_conversation(app.clone(), &token_a, &[&id_b]).await;
    let conversation_id = group["id"].as_str().unwrap().to_owned();

    let outsider =
        common::register_and_get_token(app.clone(), &common::unique_username(), "pass1234").await;

    let (status, _body) = common::put_json_authed(
        app,
        &format!("/conversations/{conversation_id}"),
        &outsider,
        json!({ "display_name": "Hijacked" }),
    )
    .await;

    assert_eq!(status, StatusCode::FORBIDDEN);
}

// ============================================================================
// GET /conversations/:id/participants
// ============================================================================

#[tokio::test]
async fn list_participants_success() {
    let pool = common::test_pool().await;
    let app = common::create_test_app(pool);
    let (token_a, id_a, _token_b, id_b) = setup_two_users(app.clone()).await;

    let conversation = common::open_direct_conversation(app.clone(), &token_a, &id_b).await;
    let conversation_id = conversation["id"].as_str().unwrap().to_owned();

    let (status, body) =
        common::get_authed(app, &format!("/conversations/{conversation_id}/participants"), &token_a).await;

    assert_eq!(status, StatusCode::OK);
    let participants: Vec<&str> = body.as_array().unwrap().iter().map(|v| v.as_str().unwrap()).collect();
    assert_eq!(participants.len(), 2);
    assert!(participants.contains(&id_a.as_str()));
    assert!(participants.contains(&id_b.as_str()));
}

#[tokio::test]
async fn list_participants_non_participant_forbidden() {
    let pool = common::test_pool().await;
    let app = common::create_test_app(pool);
    let (token_a, _id_a, _token_b, id_b) = setup_two_users(app.clone()).await;

    let conversation = common::open_direct_conversation(app.clone(), &token_a, &id_b).await;
    let conversation_id = conversation["id"].as_str().unwrap().to_owned();

    let outsider =
        common::register_and_get_token(app.clone(), &common::unique_username(), "pass1234").await;

    let (status, _body) =
        common::get_authed(app, &format!("/conversations/{conversation_id}/participants"), &outsider).await;

    assert_eq!(status, StatusCode::FORBIDDEN);
}

mod common;

use axum::http::StatusCode;

// ============================================================================
// Test fixture helpers
// ============================================================================

/// Register a user, open a direct conversation with a second user, and send
/// a message. Returns (token, peer_token, conversation_id, message_id).
async fn setup_with_message(app: axum::Router) -> (String, String, String, String) {
    let (token, _id) =
        common::register_user_with_id(app.clone(), &common::unique_username(), "pass1234").await;
    let (peer_token, peer_id) =
        common::register_user_with_id(app.clone(), &common::unique_username(), "pass1234").await;
    let conversation = common::open_direct_conversation(app.clone(), &token, &peer_id).await;
    let conversation_id = conversation["id"].as_str().unwrap().to_owned();
    let message = common::send_message(app, &token, &conversation_id, "Hello!").await;
    let message_id = message["id"].as_str().unwrap().to_owned();
    (token, peer_token, conversation_id, message_id)
}

// ============================================================================
// PUT /messages/:message_id/reactions/:emoji
// ============================================================================

#[tokio::test]
async fn add_reaction_success() {
    let pool = common::test_pool().await;
    let app = common::create_test_app(pool);
    let (token, _peer_token, _cid, mid) = setup_with_message(app.clone()).await;

    let (status, _) = common::put_authed(app, &format!("/messages/{mid}/reactions/👍"), &token).await;

    assert_eq!(status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn add_reaction_idempotent() {
    let pool = common::test_pool().await;
    let app = common::create_test_app(pool);
    let (token, _peer_token, _cid, mid) = setup_with_message(app.clone()).await;

    let (s1, _) = common::put_authed(app.clone(), &format!("/messages/{mid}/reactions/👍"), &token).await;
    let (s2, _) = common::put_authed(app, &format!("/messages/{mid}/reactions/👍"), &token).await;

    // Both calls succeed — ON CONFLICT DO NOTHING makes it idempotent.
    assert_eq!(s1, StatusCode::NO_CONTENT);
    assert_eq!(s2, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn add_reaction_non_participant_forbidden() {
    let pool = common::test_pool().await;
    let app = common::create_test_app(pool);
    let (_token, _peer_token, _cid, mid) = setup_with_message(app.clone()).await;

    let outsider =
        common::register_and_get_token(app.clone(), &common::unique_username(), "pass1234").await;

    let (status, _) = common::put_authed(app, &format!("/messages/{mid}/reactions/👍"), &outsider).await;

    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn add_reaction_unknown_message_not_found() {
    let pool = common::test_pool().await;
    let app = common::create_test_app(pool);
    let token =
        common::register_and_get_token(app.clone(), &common::unique_username(), "pass1234").await;

    let (status, _) = common::put_authed(
        app,
        &format!("/messages/{}/reactions/👍", uuid::Uuid::new_v4()),
        &token,
    )
    .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn add_reaction_rejects_oversized_emoji() {
    let pool = common::test_pool().await;
    let app = common::create_test_app(pool);
    let (token, _peer_token, _cid, mid) = setup_with_message(app.clone()).await;

    let oversized = "x".repeat(65);
    let (status, _) = common::put_authed(app, &format!("/messages/{mid}/reactions/{oversized}"), &token).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
}

// ============================================================================
// DELETE /messages/:message_id/reactions/:emoji
// ============================================================================

#[tokio::test]
async fn remove_reaction_success() {
    let pool = common::test_pool().await;
    let app = common::create_test_app(pool);
    let (token, _peer_token, _cid, mid) = setup_with_message(app.clone()).await;

    common::put_authed(app.clone(), &format!("/messages/{mid}/reactions/👍"), &token).await;

    let (status, _) = common::delete_authed(app, &format!("/messages/{mid}/reactions/👍"), &token).await;

    assert_eq!(status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn remove_nonexistent_reaction_returns_404() {
    let pool = common::test_pool().await;
    let app = common::create_test_app(pool);
    let (token, _peer_token, _cid, mid) = setup_with_message(app.clone()).await;

    let (status, _) = common::delete_authed(app, &format!("/messages/{mid}/reactions/👍"), &token).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn remove_reaction_non_participant_forbidden() {
    let pool = common::test_pool().await;
    let app = common::create_test_app(pool);
    let (token, _peer_token, _cid, mid) = setup_with_message(app.clone()).await;
    common::put_authed(app.clone(), &format!("/messages/{mid}/reactions/👍"), &token).await;

    let outsider =
        common::register_and_get_token(app.clone(), &common::unique_username(), "pass1234").await;

    let (status, _) = common::delete_authed(app, &format!("/messages/{mid}/reactions/👍"), &outsider).await;

    assert_eq!(status, StatusCode::FORBIDDEN);
}

// ============================================================================
// GET /messages/:message_id/reactions
// ============================================================================

#[tokio::test]
async fn list_reactions_count_and_me_flag() {
    let pool = common::test_pool().await;
    let app = common::create_test_app(pool);
    let (token_a, token_b, _cid, mid) = setup_with_message(app.clone()).await;

    // Both react with 👍; only token_b reacts with ❤️.
    common::put_authed(app.clone(), &format!("/messages/{mid}/reactions/👍"), &token_a).await;
    common::put_authed(app.clone(), &format!("/messages/{mid}/reactions/👍"), &token_b).await;
    common::put_authed(app.clone(), &format!("/messages/{mid}/reactions/❤️"), &token_b).await;

    // token_a sees: 👍 count=2 me=true, ❤️ count=1 me=false.
    let (status, body) = common::get_authed(app, &format!("/messages/{mid}/reactions"), &token_a).await;

    assert_eq!(status, StatusCode::OK);
    let reactions = body.as_array().unwrap();

    let thumbs = reactions.iter().find(|r| r["emoji"] == "👍").unwrap();
    assert_eq!(thumbs["count"], 2);
    assert_eq!(thumbs["me"], true);

    let heart = reactions.iter().find(|r| r["emoji"] == "❤️").unwrap();
    assert_eq!(heart["count"], 1);
    assert_eq!(heart["me"], false);
}

#[tokio::test]
async fn list_reactions_non_participant_forbidden() {
    let pool = common::test_pool().await;
    let app = common::create_test_app(pool);
    let (_token, _peer_token, _cid, mid) = setup_with_message(app.clone()).await;

    let outsider =
        common::register_and_get_token(app.clone(), &common::unique_username(), "pass1234").await;

    let (status, _) = common::get_authed(app, &format!("/messages/{mid}/reactions"), &outsider).await;

    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn list_reactions_empty_when_none_added() {
    let pool = common::test_pool().await;
    let app = common::create_test_app(pool);
    let (token, _peer_token, _cid, mid) = setup_with_message(app.clone()).await;

    let (status, body) = common::get_authed(app, &format!("/messages/{mid}/reactions"), &token).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 0);
}

use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use tracing::info;
use validator::Validate;

use crate::{
    auth::{hash_password, verify_password},
    error::{AppError, AppResult},
    models::UserDto,
    state::AppState,
};

#[derive(Debug, Deserialize, Validate)]
pub struct RegisterRequest {
    #[validate(length(min = 3, max = 32))]
    pub username: String,
    #[validate(email)]
    pub email: Option<String>,
    // Upper bound guards against feeding bcrypt (which only examines the
    // first 72 bytes anyway) an attacker-supplied multi-megabyte string.
    #[validate(length(min = 8, max = 128))]
    pub password: String,
    /// Falls back to the username when omitted — registration clients aren't
    /// required to collect a separate display name up front.
    #[validate(length(min = 1, max = 64))]
    pub display_name: Option<String>,
}

fn is_valid_username(username: &str) -> bool {
    username.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[derive(Debug, Deserialize, Validate)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Serialize)]
pub struct AuthResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub user: UserDto,
}

pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> AppResult<(StatusCode, Json<AuthResponse>)> {
    req.validate().map_err(|e| AppError::BadRequest(e.to_string()))?;
    if !is_valid_username(&req.username) {
        return Err(AppError::BadRequest(
            "Username may only contain letters, digits, and underscores".into(),
        ));
    }
    info!(username = %req.username, "registering new user");

    let password_hash = hash_password(&req.password)?;
    let display_name = req.display_name.clone().unwrap_or_else(|| req.username.clone());
    let user = state
        .repository
        .create_user(&req.username, req.email.as_deref(), &password_hash, &display_name)
        .await?;

    let tokens = state.authenticator.issue_tokens(user.id, &user.username)?;
    persist_refresh_token(&state, user.id, &tokens.refresh_token).await?;

    Ok((
        StatusCode::CREATED,
        Json(AuthResponse {
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            user: user.into(),
        }),
    ))
}

pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> AppResult<Json<AuthResponse>> {
    req.validate().map_err(|e| AppError::BadRequest(e.to_string()))?;

    let user = state
        .repository
        .get_user_by_username(&req.username)
        .await?
        .ok_or_else(|| AppError::Unauthorized("Invalid username or password".into()))?;

    if !verify_password(&req.password, &user.password_hash)? {
        return Err(AppError::Unauthorized("Invalid username or password".into()));
    }

    let tokens = state.authenticator.issue_tokens(user.id, &user.username)?;
    persist_refresh_token(&state, user.id, &tokens.refresh_token).await?;

    Ok(Json(AuthResponse {
        access_token: tokens.access_token,
        refresh_token: tokens.refresh_token,
        user: user.into(),
    }))
}

pub async fn refresh(
    State(state): State<AppState>,
    Json(req): Json<RefreshRequest>,
) -> AppResult<Json<AuthResponse>> {
    let claims = state.authenticator.validate_refresh_token(&req.refresh_token)?;
    let user_id = claims.user_id()?;

    let token_hash = state.authenticator.hash_refresh_token(&req.refresh_token);
    let session = state
        .repository
        .get_refresh_session_by_hash(&token_hash)
        .await?
        .ok_or_else(|| AppError::Unauthorized("Refresh token not recognized".into()))?;

    if session.revoked || session.expires_at <= chrono::Utc::now() {
        return Err(AppError::Unauthorized("Refresh token expired or revoked".into()));
    }

    let user = state
        .repository
        .get_user(user_id)
        .await?
        .ok_or_else(|| AppError::Unauthorized("User no longer exists".into()))?;

    state.repository.revoke_refresh_session(session.id).await?;
    let tokens = state.authenticator.issue_tokens(user.id, &user.username)?;
    persist_refresh_token(&state, user.id, &tokens.refresh_token).await?;

    Ok(Json(AuthResponse {
        access_token: tokens.access_token,
        refresh_token: tokens.refresh_token,
        user: user.into(),
    }))
}

/// POST /auth/logout — revokes the refresh session so the refresh token can
/// no longer mint new access tokens. The client is expected to discard its
/// access token client-side; the core has no mechanism to revoke an
/// already-issued short-lived access token early (spec.md §6's access-token
/// TTL is deliberately short for this reason).
pub async fn logout(
    State(state): State<AppState>,
    Json(req): Json<RefreshRequest>,
) -> AppResult<StatusCode> {
    let token_hash = state.authenticator.hash_refresh_token(&req.refresh_token);
    if let Some(session) = state.repository.get_refresh_session_by_hash(&token_hash).await? {
        state.repository.revoke_refresh_session(session.id).await?;
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn persist_refresh_token(state: &AppState, user_id: uuid::Uuid, refresh_token: &str) -> AppResult<()> {
    let token_hash = state.authenticator.hash_refresh_token(refresh_token);
    let expires_at = chrono::Utc::now()
        + chrono::Duration::from_std(state.config.refresh_token_ttl).unwrap_or_else(|_| chrono::Duration::days(7));
    state.repository.create_refresh_session(user_id, &token_hash, expires_at).await?;
    Ok(())
}

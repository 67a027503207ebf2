use axum::{
    extract::{Path, State},
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    error::{AppError, AppResult},
    models::{PresenceKind, PresenceStatus, UserDto},
    state::AppState,
};

pub async fn get_current_user(State(state): State<AppState>, user: AuthUser) -> AppResult<Json<UserDto>> {
    let record = state
        .repository
        .get_user(user.user_id())
        .await?
        .ok_or_else(|| AppError::NotFound("User not found".into()))?;
    Ok(Json(record.into()))
}

pub async fn get_user(State(state): State<AppState>, _user: AuthUser, Path(user_id): Path<Uuid>) -> AppResult<Json<UserDto>> {
    let record = state
        .repository
        .get_user(user_id)
        .await?
        .ok_or_else(|| AppError::NotFound("User not found".into()))?;
    Ok(Json(record.into()))
}

/// GET /status/:userId — current presence snapshot, the REST fallback for
/// clients without an open Gateway session (spec.md §3's Presence Registry
/// is otherwise only observed through `user-status` push events).
pub async fn get_status(
    State(state): State<AppState>,
    _user: AuthUser,
    Path(user_id): Path<Uuid>,
) -> Json<PresenceStatus> {
    Json(state.presence.snapshot(user_id))
}

#[derive(Debug, Deserialize)]
pub struct UpdateStatusRequest {
    pub status: PresenceKind,
    pub custom_message: Option<String>,
    pub custom_emoji: Option<String>,
}

/// PUT /status — same semantics as the Gateway's `status` op, for clients
/// that want to set presence without a live connection open.
pub async fn update_status(
    State(state): State<AppState>,
    user: AuthUser,
    Json(req): Json<UpdateStatusRequest>,
) -> AppResult<Json<PresenceStatus>> {
    if req.status == PresenceKind::Away {
        return Err(AppError::BadRequest("Away is inferred, not settable directly".into()));
    }
    state
        .presence
        .set_status(user.user_id(), req.status, req.custom_message, req.custom_emoji);
    Ok(Json(state.presence.snapshot(user.user_id())))
}

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    error::{AppError, AppResult},
    models::{CreatePushSubscriptionDto, NotificationSettings, PushSubscription},
    state::AppState,
};

#[derive(Debug, Serialize)]
pub struct VapidPublicKeyResponse {
    pub public_key: String,
}

/// GET /notifications/vapid-public-key — the public half of the push
/// identity key pair, handed to clients so they can create a browser push
/// subscription against this server (spec.md §6's "Push identity keys").
/// The private key never leaves `Config`; it is used only inside the
/// `PushTransport` collaborator.
pub async fn get_vapid_public_key(State(state): State<AppState>) -> AppResult<Json<VapidPublicKeyResponse>> {
    let public_key = state
        .config
        .push_public_key
        .clone()
        .ok_or_else(|| AppError::NotFound("No push identity configured".into()))?;
    Ok(Json(VapidPublicKeyResponse { public_key }))
}

/// POST /notifications/subscriptions — register a push subscription
/// (spec.md §4.7's "Push Dispatcher" target set).
pub async fn create_push_subscription(
    State(state): State<AppState>,
    user: AuthUser,
    Json(dto): Json<CreatePushSubscriptionDto>,
) -> AppResult<(StatusCode, Json<PushSubscription>)> {
    let subscription = state
        .repository
        .create_push_subscription(user.user_id(), &dto.endpoint, &dto.key_material, dto.user_agent.as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(subscription)))
}

/// GET /notifications/subscriptions
pub async fn list_push_subscriptions(
    State(state): State<AppState>,
    user: AuthUser,
) -> AppResult<Json<Vec<PushSubscription>>> {
    let subscriptions = state.repository.list_push_subscriptions(user.user_id()).await?;
    Ok(Json(subscriptions))
}

#[derive(Debug, Deserialize)]
pub struct DeleteSubscriptionRequest {
    pub endpoint: String,
}

/// DELETE /notifications/subscriptions — unregister by endpoint (device logout).
pub async fn delete_push_subscription(
    State(state): State<AppState>,
    user: AuthUser,
    Json(req): Json<DeleteSubscriptionRequest>,
) -> AppResult<StatusCode> {
    state
        .repository
        .delete_push_subscription_by_endpoint(user.user_id(), &req.endpoint)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /notifications/settings
pub async fn get_notification_settings(
    State(state): State<AppState>,
    user: AuthUser,
) -> AppResult<Json<NotificationSettings>> {
    let settings = state.repository.get_notification_settings(user.user_id()).await?;
    Ok(Json(settings))
}

#[derive(Debug, Deserialize)]
pub struct UpdateNotificationSettingsRequest {
    pub messages_enabled: bool,
    pub mentions_enabled: bool,
    pub reactions_enabled: bool,
    pub contact_requests_enabled: bool,
    pub quiet_hours_start_minute: Option<i32>,
    pub quiet_hours_end_minute: Option<i32>,
    #[serde(default)]
    pub muted_conversation_ids: Vec<Uuid>,
}

/// PUT /notifications/settings — quiet hours, per-type toggles, and the mute
/// list the Push Dispatcher filters against (spec.md §4.7).
pub async fn put_notification_settings(
    State(state): State<AppState>,
    user: AuthUser,
    Json(req): Json<UpdateNotificationSettingsRequest>,
) -> AppResult<Json<NotificationSettings>> {
    let settings = NotificationSettings {
        user_id: user.user_id(),
        messages_enabled: req.messages_enabled,
        mentions_enabled: req.mentions_enabled,
        reactions_enabled: req.reactions_enabled,
        contact_requests_enabled: req.contact_requests_enabled,
        quiet_hours_start_minute: req.quiet_hours_start_minute,
        quiet_hours_end_minute: req.quiet_hours_end_minute,
        muted_conversation_ids: req.muted_conversation_ids,
    };
    state.repository.put_notification_settings(settings.clone()).await?;
    Ok(Json(settings))
}

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde_json::json;
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    error::{AppError, AppResult},
    models::{CreateMessageDto, Message},
    router::RoutedEvent,
    state::AppState,
    websocket::events::EVENT_MESSAGE,
};

/// POST /messages — the REST-surface equivalent of sending a `message` op
/// over the Gateway. Primarily useful for clients without an open Gateway
/// session yet; the send path is otherwise identical (same router dispatch,
/// same delivery-record bookkeeping).
pub async fn create_message(
    State(state): State<AppState>,
    user: AuthUser,
    Json(dto): Json<CreateMessageDto>,
) -> AppResult<(StatusCode, Json<Message>)> {
    let participants = state.repository.list_participants(dto.conversation_id).await?;
    if !participants.contains(&user.user_id()) {
        return Err(AppError::Forbidden("Not a participant in this conversation".into()));
    }

    let conversation_id = dto.conversation_id;
    let message = state.repository.create_message(user.user_id(), dto).await?;

    let payload = json!({
        "message_id": message.id,
        "conversation_id": conversation_id,
        "sender_id": message.sender_id,
        "payload": message.payload,
        "parent_message_id": message.parent_message_id,
        "media_ref": message.media_ref,
        "created_at": message.created_at,
    });
    state
        .router
        .dispatch(
            conversation_id,
            RoutedEvent {
                event_type: EVENT_MESSAGE,
                payload,
                message_id: Some(message.id),
                exclude: Some(user.user_id()),
            },
        )
        .await?;

    Ok((StatusCode::CREATED, Json(message)))
}

/// GET /messages/:id
pub async fn get_message(
    State(state): State<AppState>,
    user: AuthUser,
    Path(message_id): Path<Uuid>,
) -> AppResult<Json<Message>> {
    let message = state
        .repository
        .get_message(message_id)
        .await?
        .ok_or_else(|| AppError::NotFound("Message not found".into()))?;

    let participants = state.repository.list_participants(message.conversation_id).await?;
    if !participants.contains(&user.user_id()) {
        return Err(AppError::Forbidden("Not a participant in this conversation".into()));
    }
    Ok(Json(message))
}

/// DELETE /messages/:id — soft-delete (tombstone), sender only.
pub async fn delete_message(
    State(state): State<AppState>,
    user: AuthUser,
    Path(message_id): Path<Uuid>,
) -> AppResult<StatusCode> {
    let message = state
        .repository
        .get_message(message_id)
        .await?
        .ok_or_else(|| AppError::NotFound("Message not found".into()))?;

    if message.sender_id != user.user_id() {
        return Err(AppError::Forbidden("Only the sender can delete this message".into()));
    }

    state.repository.soft_delete_message(message_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

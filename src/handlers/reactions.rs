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
    models::ReactionCount,
    pipeline::ReactionKind,
    state::AppState,
};

const MAX_EMOJI_BYTES: usize = 64;

fn validate_emoji(emoji: &str) -> AppResult<()> {
    if emoji.is_empty() || emoji.len() > MAX_EMOJI_BYTES {
        return Err(AppError::BadRequest("Emoji must be between 1 and 64 bytes".into()));
    }
    Ok(())
}

/// PUT /messages/:message_id/reactions/:emoji — idempotent: adding the same
/// emoji twice is not an error.
pub async fn add_reaction(
    State(state): State<AppState>,
    user: AuthUser,
    Path((message_id, emoji)): Path<(Uuid, String)>,
) -> AppResult<StatusCode> {
    validate_emoji(&emoji)?;

    let message = state
        .repository
        .get_message(message_id)
        .await?
        .ok_or_else(|| AppError::NotFound("Message not found".into()))?;
    let participants = state.repository.list_participants(message.conversation_id).await?;
    if !participants.contains(&user.user_id()) {
        return Err(AppError::Forbidden("Not a participant in this conversation".into()));
    }

    state.repository.add_reaction(message_id, user.user_id(), &emoji).await?;
    dispatch_reaction_update(&state, &message, message_id, user.user_id(), ReactionKind::Add).await?;

    Ok(StatusCode::NO_CONTENT)
}

/// DELETE /messages/:message_id/reactions/:emoji
pub async fn remove_reaction(
    State(state): State<AppState>,
    user: AuthUser,
    Path((message_id, emoji)): Path<(Uuid, String)>,
) -> AppResult<StatusCode> {
    validate_emoji(&emoji)?;

    let message = state
        .repository
        .get_message(message_id)
        .await?
        .ok_or_else(|| AppError::NotFound("Message not found".into()))?;
    let participants = state.repository.list_participants(message.conversation_id).await?;
    if !participants.contains(&user.user_id()) {
        return Err(AppError::Forbidden("Not a participant in this conversation".into()));
    }

    let removed = state.repository.remove_reaction(message_id, user.user_id(), &emoji).await?;
    if !removed {
        return Err(AppError::NotFound("Reaction not found".into()));
    }
    dispatch_reaction_update(&state, &message, message_id, user.user_id(), ReactionKind::Remove).await?;

    Ok(StatusCode::NO_CONTENT)
}

/// GET /messages/:message_id/reactions — aggregated counts with a `me` flag.
pub async fn list_reactions(
    State(state): State<AppState>,
    user: AuthUser,
    Path(message_id): Path<Uuid>,
) -> AppResult<Json<Vec<ReactionCount>>> {
    let message = state
        .repository
        .get_message(message_id)
        .await?
        .ok_or_else(|| AppError::NotFound("Message not found".into()))?;
    let participants = state.repository.list_participants(message.conversation_id).await?;
    if !participants.contains(&user.user_id()) {
        return Err(AppError::Forbidden("Not a participant in this conversation".into()));
    }

    let counts = state.repository.list_reactions(message_id, user.user_id()).await?;
    Ok(Json(counts))
}

/// Fans a batched reaction-count update out through the Ephemeral Signal
/// Pipeline's reaction batcher, matching the behavior of the Gateway's own
/// `reaction:add`/`reaction:remove` ops (spec.md §4.5).
async fn dispatch_reaction_update(
    state: &AppState,
    message: &crate::models::Message,
    message_id: Uuid,
    caller_id: Uuid,
    kind: ReactionKind,
) -> AppResult<()> {
    let counts = state.repository.list_reactions(message_id, caller_id).await?;
    state.pipeline.signal_reaction(
        message.conversation_id,
        message_id,
        kind,
        json!({ "message_id": message_id, "reactions": counts }),
    );
    Ok(())
}

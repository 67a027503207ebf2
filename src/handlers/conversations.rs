use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    error::{AppError, AppResult},
    models::{ConversationDto, ConversationKind, CreateConversationDto, Message},
    state::AppState,
};

async fn to_dto(state: &AppState, conversation: crate::models::Conversation) -> AppResult<ConversationDto> {
    let participant_ids = state.repository.list_participants(conversation.id).await?;
    let kind = conversation
        .kind
        .parse::<ConversationKind>()
        .map_err(|_| AppError::Internal)?;
    Ok(ConversationDto {
        id: conversation.id,
        kind,
        display_name: conversation.display_name,
        participant_ids,
        created_at: conversation.created_at,
        last_active_at: conversation.last_active_at,
    })
}

/// GET /conversations — every conversation the caller participates in.
pub async fn list_conversations(
    State(state): State<AppState>,
    user: AuthUser,
) -> AppResult<Json<Vec<ConversationDto>>> {
    let ids = state.repository.list_conversation_ids_for_user(user.user_id()).await?;
    let mut out = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(conversation) = state.repository.get_conversation(id).await? {
            out.push(to_dto(&state, conversation).await?);
        }
    }
    Ok(Json(out))
}

/// POST /conversations — create a group conversation. The caller is added as
/// a participant even if they omitted themselves from the request body.
pub async fn create_conversation(
    State(state): State<AppState>,
    user: AuthUser,
    Json(mut dto): Json<CreateConversationDto>,
) -> AppResult<(StatusCode, Json<ConversationDto>)> {
    if !dto.participant_ids.contains(&user.user_id()) {
        dto.participant_ids.push(user.user_id());
    }
    if dto.participant_ids.len() < 2 {
        return Err(AppError::BadRequest("A conversation needs at least two participants".into()));
    }

    let conversation = state.repository.create_conversation("group", dto).await?;
    Ok((StatusCode::CREATED, Json(to_dto(&state, conversation).await?)))
}

#[derive(Debug, Deserialize)]
pub struct CreateDirectRequest {
    pub peer_id: Uuid,
}

/// POST /conversations/direct — find-or-create the 1:1 conversation between
/// the caller and `peer_id` (spec.md §3's direct-conversation uniqueness).
pub async fn create_direct_conversation(
    State(state): State<AppState>,
    user: AuthUser,
    Json(req): Json<CreateDirectRequest>,
) -> AppResult<(StatusCode, Json<ConversationDto>)> {
    if req.peer_id == user.user_id() {
        return Err(AppError::BadRequest("Cannot open a direct conversation with yourself".into()));
    }

    if let Some(existing_id) = state.repository.find_direct_conversation(user.user_id(), req.peer_id).await? {
        let conversation = state
            .repository
            .get_conversation(existing_id)
            .await?
            .ok_or(AppError::Internal)?;
        return Ok((StatusCode::OK, Json(to_dto(&state, conversation).await?)));
    }

    let dto = CreateConversationDto {
        display_name: None,
        participant_ids: vec![user.user_id(), req.peer_id],
    };
    let conversation = state.repository.create_conversation("direct", dto).await?;
    Ok((StatusCode::CREATED, Json(to_dto(&state, conversation).await?)))
}

#[derive(Debug, Deserialize)]
pub struct UpdateConversationRequest {
    pub display_name: Option<String>,
    #[serde(default)]
    pub add_participant_ids: Vec<Uuid>,
    #[serde(default)]
    pub remove_participant_ids: Vec<Uuid>,
}

/// PUT /conversations/:id — rename and/or adjust membership. Direct
/// conversations cannot be renamed or have their membership changed; the
/// two-party invariant is fixed at creation (§9 Open Question 3).
pub async fn update_conversation(
    State(state): State<AppState>,
    user: AuthUser,
    Path(conversation_id): Path<Uuid>,
    Json(req): Json<UpdateConversationRequest>,
) -> AppResult<Json<ConversationDto>> {
    let conversation = state
        .repository
        .get_conversation(conversation_id)
        .await?
        .ok_or_else(|| AppError::NotFound("Conversation not found".into()))?;

    let participants = state.repository.list_participants(conversation_id).await?;
    if !participants.contains(&user.user_id()) {
        return Err(AppError::Forbidden("Not a participant in this conversation".into()));
    }
    if conversation.kind != "group" {
        return Err(AppError::BadRequest("Direct conversations cannot be edited".into()));
    }

    if let Some(display_name) = req.display_name.as_deref() {
        state.repository.rename_conversation(conversation_id, display_name).await?;
    }
    for add_id in req.add_participant_ids {
        state.router.add_participant(conversation_id, add_id).await?;
    }
    for remove_id in req.remove_participant_ids {
        state.router.remove_participant(conversation_id, remove_id).await?;
    }
    state.repository.touch_conversation(conversation_id, Utc::now()).await?;

    let conversation = state
        .repository
        .get_conversation(conversation_id)
        .await?
        .ok_or(AppError::Internal)?;
    Ok(Json(to_dto(&state, conversation).await?))
}

#[derive(Debug, Deserialize)]
pub struct ListMessagesParams {
    pub before: Option<Uuid>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct MessagePage {
    pub messages: Vec<Message>,
    pub has_more: bool,
}

const DEFAULT_PAGE_SIZE: i64 = 50;
const MAX_PAGE_SIZE: i64 = 200;

/// GET /conversations/:id/messages — cursor-paginated, newest first.
pub async fn list_messages(
    State(state): State<AppState>,
    user: AuthUser,
    Path(conversation_id): Path<Uuid>,
    Query(params): Query<ListMessagesParams>,
) -> AppResult<Json<MessagePage>> {
    let participants = state.repository.list_participants(conversation_id).await?;
    if !participants.contains(&user.user_id()) {
        return Err(AppError::Forbidden("Not a participant in this conversation".into()));
    }

    let limit = params.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
    let mut messages = state
        .repository
        .list_messages(conversation_id, params.before, limit + 1)
        .await?;

    let has_more = messages.len() as i64 > limit;
    if has_more {
        messages.truncate(limit as usize);
    }

    Ok(Json(MessagePage { messages, has_more }))
}

/// GET /conversations/:id/participants
pub async fn list_participants(
    State(state): State<AppState>,
    user: AuthUser,
    Path(conversation_id): Path<Uuid>,
) -> AppResult<Json<Vec<Uuid>>> {
    let participants = state.repository.list_participants(conversation_id).await?;
    if !participants.contains(&user.user_id()) {
        return Err(AppError::Forbidden("Not a participant in this conversation".into()));
    }
    Ok(Json(participants))
}

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::events::{GatewayMessage, GatewayOp};
use crate::models::{DeliveryState, PresenceKind};
use crate::state::AppState;

/// JWT is passed as a query parameter because WebSocket upgrade requests are
/// plain GET requests and cannot carry an Authorization header reliably
/// across every client environment.
///
/// Note: query-parameter tokens appear in server/proxy access logs; this is
/// why access tokens are kept short-lived.
#[derive(Debug, serde::Deserialize)]
pub struct WsParams {
    pub token: String,
}

/// GET /ws?token=<access_token> — upgrade to a Gateway session.
///
/// The access token is validated before the upgrade is accepted; an invalid
/// or expired token gets a plain 401 without an upgrade attempt.
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<AppState>,
) -> Response {
    let claims = match state.authenticator.validate_access_token(&params.token) {
        Ok(c) => c,
        Err(_) => return (StatusCode::UNAUTHORIZED, "Invalid or expired token").into_response(),
    };

    let user_id = match claims.user_id() {
        Ok(id) => id,
        Err(_) => return (StatusCode::UNAUTHORIZED, "Invalid token subject").into_response(),
    };

    ws.on_upgrade(move |socket| handle_socket(socket, user_id, state))
}

async fn handle_socket(socket: WebSocket, user_id: Uuid, state: AppState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let session_id = state.connections.add(user_id, tx);
    let went_online = state.presence.session_opened(user_id, session_id);

    if went_online {
        drain_offline_queue(&state, user_id).await;
    }

    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_sender.send(Message::Text(msg)).await.is_err() {
                break;
            }
        }
    });

    let state_clone = state.clone();
    let mut recv_task = tokio::spawn(async move {
        loop {
            match ws_receiver.next().await {
                Some(Ok(Message::Text(text))) => {
                    handle_client_message(user_id, session_id, &text, &state_clone).await;
                }
                Some(Ok(Message::Close(_))) => break,
                Some(Ok(_)) => {}
                Some(Err(error)) => {
                    tracing::debug!(%user_id, ?error, "gateway receive error; closing session");
                    break;
                }
                None => break,
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    for conversation_id in state.connections.clear_session_views(session_id, user_id) {
        broadcast_conversation_presence(&state, conversation_id, user_id, false).await;
    }
    state.connections.remove(user_id, session_id);
    state.presence.session_closed(user_id, session_id);
}

/// Delivers every event queued while `user_id` had no open session, in FIFO
/// order, and advances delivery state for any message now being delivered
/// for the first time (spec.md §4.6's drain-on-reconnect).
async fn drain_offline_queue(state: &AppState, user_id: Uuid) {
    let events = match state.offline_queue.drain(user_id).await {
        Ok(events) => events,
        Err(error) => {
            tracing::warn!(%user_id, ?error, "failed to drain offline queue");
            return;
        }
    };

    for event in events {
        let frame = GatewayMessage::dispatch(&event.event_type, event.payload);
        if let Ok(json) = serde_json::to_string(&frame) {
            state.connections.send_to_user_raw(user_id, &json);
        }
        if let Some(message_id) = event.message_id {
            let _ = state
                .delivery
                .advance(message_id, user_id, DeliveryState::Delivered)
                .await;
        }
    }
}

async fn handle_client_message(user_id: Uuid, session_id: Uuid, text: &str, state: &AppState) {
    let Ok(msg) = serde_json::from_str::<GatewayMessage>(text) else {
        return;
    };

    state.presence.touch(user_id);

    match msg.op {
        GatewayOp::Heartbeat => {
            let ack = GatewayMessage::heartbeat_ack();
            if let Ok(json) = serde_json::to_string(&ack) {
                state.connections.send_to_user_raw(user_id, &json);
            }
        }
        GatewayOp::JoinConversation => {
            // Message fan-out is driven by repository-backed membership, not
            // this subscription — a participant receives `message` events
            // whether or not they've joined the conversation's live view.
            // `JoinConversation` only tracks that live view, for
            // `conversation-presence` (spec.md §4.1).
            if let Some(data) = msg.d.as_ref() {
                if let Some(conversation_id) = extract_conversation_id(data) {
                    if state.connections.join_conversation_view(session_id, user_id, conversation_id) {
                        broadcast_conversation_presence(state, conversation_id, user_id, true).await;
                    }
                }
            }
        }
        GatewayOp::LeaveConversation => {
            if let Some(data) = msg.d.as_ref() {
                if let Some(conversation_id) = extract_conversation_id(data) {
                    if state.connections.leave_conversation_view(session_id, user_id, conversation_id) {
                        broadcast_conversation_presence(state, conversation_id, user_id, false).await;
                    }
                }
            }
        }
        GatewayOp::Message => {
            if let Some(data) = msg.d {
                handle_inbound_message(user_id, data, state).await;
            }
        }
        GatewayOp::Typing => {
            if let Some(data) = msg.d.as_ref() {
                if let Some(conversation_id) = extract_conversation_id(data) {
                    let on = data.get("on").and_then(|v| v.as_bool()).unwrap_or(true);
                    if on {
                        state.pipeline.signal_typing_on(conversation_id, user_id);
                    } else {
                        state.pipeline.signal_typing_off(conversation_id, user_id);
                    }
                }
            }
        }
        GatewayOp::ReadReceipt => {
            if let Some(data) = msg.d {
                if let Some(conversation_id) = extract_conversation_id(&data) {
                    let watermark = extract_watermark(&data).unwrap_or_else(Utc::now);
                    state.pipeline.signal_read_receipt(conversation_id, user_id, watermark);
                }
            }
        }
        GatewayOp::MarkConversationRead => {
            if let Some(data) = msg.d {
                if let Some(conversation_id) = extract_conversation_id(&data) {
                    let watermark = extract_watermark(&data).unwrap_or_else(Utc::now);
                    let _ = state
                        .delivery
                        .mark_conversation_read(conversation_id, user_id, watermark)
                        .await;
                }
            }
        }
        GatewayOp::Status => {
            if let Some(data) = msg.d {
                handle_status_update(user_id, data, state);
            }
        }
        GatewayOp::UserActivity => {
            state.presence.touch(user_id);
        }
        GatewayOp::ReactionAdd | GatewayOp::ReactionRemove => {
            if let Some(data) = msg.d {
                handle_reaction(user_id, msg.op, data, state).await;
            }
        }
        // Server-originated ops should never arrive from a client.
        GatewayOp::Dispatch | GatewayOp::HeartbeatAck => {}
    }
}

/// Tells every other participant of `conversation_id` that `user_id` just
/// joined or left that conversation's live view (spec.md §4.1's
/// `conversation-presence`). Online-only and unpersisted, like the rest of
/// the Ephemeral Signal Pipeline's concerns — no offline-queue or push
/// fallback, since a live-view join/leave has no meaning for a disconnected
/// participant.
async fn broadcast_conversation_presence(state: &AppState, conversation_id: Uuid, user_id: Uuid, joined: bool) {
    let Ok(participants) = state.repository.list_participants(conversation_id).await else {
        return;
    };
    let frame = GatewayMessage::dispatch(
        super::events::EVENT_CONVERSATION_PRESENCE,
        json!({ "conversation_id": conversation_id, "user_id": user_id, "joined": joined }),
    );
    let Ok(json) = serde_json::to_string(&frame) else {
        return;
    };
    for participant_id in participants {
        if participant_id != user_id {
            state.connections.send_to_user_raw(participant_id, &json);
        }
    }
}

fn extract_conversation_id(data: &serde_json::Value) -> Option<Uuid> {
    data.get("conversation_id")?.as_str()?.parse().ok()
}

fn extract_watermark(data: &serde_json::Value) -> Option<DateTime<Utc>> {
    data.get("watermark")?.as_str().and_then(|s| s.parse().ok())
}

async fn handle_inbound_message(user_id: Uuid, data: serde_json::Value, state: &AppState) {
    let Some(dto) = serde_json::from_value::<crate::models::CreateMessageDto>(data).ok() else {
        send_error(state, user_id, "BadRequest", "Malformed message payload");
        return;
    };
    let conversation_id = dto.conversation_id;

    // A message implies typing stopped (spec.md §4.5): if a typing-on is
    // still inside its debounce window, this suppresses it outright rather
    // than emitting a now-redundant `typing` right before the message.
    state.pipeline.cancel_typing(conversation_id, user_id);

    let message = match state.repository.create_message(user_id, dto).await {
        Ok(message) => message,
        Err(error) => {
            send_error(state, user_id, error.code(), &error.to_string());
            return;
        }
    };

    let ack = GatewayMessage::dispatch(
        super::events::EVENT_MESSAGE_SENT,
        json!({ "message_id": message.id, "created_at": message.created_at }),
    );
    if let Ok(json) = serde_json::to_string(&ack) {
        state.connections.send_to_user_raw(user_id, &json);
    }

    let payload = json!({
        "message_id": message.id,
        "conversation_id": conversation_id,
        "sender_id": message.sender_id,
        "payload": message.payload,
        "parent_message_id": message.parent_message_id,
        "media_ref": message.media_ref,
        "created_at": message.created_at,
    });
    // §7: persistence errors on the message path are fatal to that send —
    // no partial delivery. The message itself is already durably stored;
    // this only fails the fan-out, so the sender is told explicitly rather
    // than being left believing every recipient got it.
    if let Err(error) = state
        .router
        .dispatch(
            conversation_id,
            crate::router::RoutedEvent {
                event_type: super::events::EVENT_MESSAGE,
                payload,
                message_id: Some(message.id),
                exclude: Some(user_id),
            },
        )
        .await
    {
        let failed = GatewayMessage::dispatch(
            super::events::EVENT_MESSAGE_FAILED,
            json!({ "message_id": message.id, "reason": error.code() }),
        );
        if let Ok(json) = serde_json::to_string(&failed) {
            state.connections.send_to_user_raw(user_id, &json);
        }
    }
}

fn handle_status_update(user_id: Uuid, data: serde_json::Value, state: &AppState) {
    let Some(kind_str) = data.get("status").and_then(|v| v.as_str()) else {
        return;
    };
    let Ok(kind) = kind_str.parse::<PresenceKind>() else {
        return;
    };
    let custom_message = data.get("custom_message").and_then(|v| v.as_str()).map(String::from);
    let custom_emoji = data.get("custom_emoji").and_then(|v| v.as_str()).map(String::from);
    state.presence.set_status(user_id, kind, custom_message, custom_emoji);
}

async fn handle_reaction(user_id: Uuid, op: GatewayOp, data: serde_json::Value, state: &AppState) {
    let Some(message_id) = data.get("message_id").and_then(|v| v.as_str()).and_then(|s| s.parse::<Uuid>().ok())
    else {
        return;
    };
    let Some(emoji) = data.get("emoji").and_then(|v| v.as_str()) else {
        return;
    };
    let Some(message) = state.repository.get_message(message_id).await.ok().flatten() else {
        return;
    };

    let changed = match op {
        GatewayOp::ReactionAdd => state.repository.add_reaction(message_id, user_id, emoji).await,
        _ => state.repository.remove_reaction(message_id, user_id, emoji).await,
    };
    let Ok(true) = changed else {
        return;
    };

    let counts = state
        .repository
        .list_reactions(message_id, user_id)
        .await
        .unwrap_or_default();

    let kind = match op {
        GatewayOp::ReactionAdd => crate::pipeline::ReactionKind::Add,
        _ => crate::pipeline::ReactionKind::Remove,
    };
    state.pipeline.signal_reaction(
        message.conversation_id,
        message_id,
        kind,
        json!({ "message_id": message_id, "reactions": counts }),
    );
}

fn send_error(state: &AppState, user_id: Uuid, code: &str, message: &str) {
    let frame = GatewayMessage::error(json!({ "code": code, "message": message }));
    if let Ok(json) = serde_json::to_string(&frame) {
        state.connections.send_to_user_raw(user_id, &json);
    }
}

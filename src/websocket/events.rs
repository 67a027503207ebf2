use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Envelope for every gateway message, both directions.
#[derive(Debug, Serialize, Deserialize)]
pub struct GatewayMessage {
    pub op: GatewayOp,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub d: Option<Value>,
}

impl GatewayMessage {
    pub fn dispatch(event_type: &str, data: Value) -> Self {
        Self {
            op: GatewayOp::Dispatch,
            t: Some(event_type.to_owned()),
            d: Some(data),
        }
    }

    pub fn error(payload: Value) -> Self {
        Self {
            op: GatewayOp::Dispatch,
            t: Some(EVENT_ERROR.to_owned()),
            d: Some(payload),
        }
    }

    pub fn heartbeat_ack() -> Self {
        Self {
            op: GatewayOp::HeartbeatAck,
            t: None,
            d: None,
        }
    }
}

/// Opcode discriminator for the gateway protocol. Client-originated ops
/// cover every inbound action in spec.md §4.1's "what the session accepts";
/// server-originated ones are `Dispatch` (a named event, in `t`) and
/// `HeartbeatAck`.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "snake_case")]
pub enum GatewayOp {
    /// Server → client: a named event with a payload.
    Dispatch,
    /// Client → server: keepalive ping.
    Heartbeat,
    /// Server → client: reply to a `heartbeat`.
    HeartbeatAck,
    /// Client → server: subscribe this session to a conversation's events.
    JoinConversation,
    /// Client → server: unsubscribe this session from a conversation's events.
    LeaveConversation,
    /// Client → server: send a new message.
    Message,
    /// Client → server: signal that the user is actively typing.
    Typing,
    /// Client → server: acknowledge having seen up to a point in time.
    ReadReceipt,
    /// Client → server: mark an entire conversation read as of now.
    MarkConversationRead,
    /// Client → server: explicitly set presence status (online/busy/custom).
    Status,
    /// Client → server: any activity that should reset the away-idle timer
    /// without otherwise changing presence (spec.md §4.2).
    UserActivity,
    /// Client → server: add a reaction to a message.
    ReactionAdd,
    /// Client → server: remove a reaction from a message.
    ReactionRemove,
}

// ── Server-to-client event type strings (carried in `t` under `Dispatch`) ──

pub const EVENT_MESSAGE: &str = "message";
pub const EVENT_MESSAGE_SENT: &str = "message-sent";
pub const EVENT_MESSAGE_FAILED: &str = "message-failed";
pub const EVENT_MESSAGE_STATUS: &str = "message-status";
pub const EVENT_MESSAGE_DELIVERED: &str = "message-delivered";
pub const EVENT_MESSAGE_READ: &str = "message-read";
pub const EVENT_TYPING: &str = "typing";
pub const EVENT_TYPING_STOPPED: &str = "typing-stopped";
pub const EVENT_USER_STATUS: &str = "user-status";
pub const EVENT_CONVERSATION_PRESENCE: &str = "conversation-presence";
pub const EVENT_REACTION_ADD: &str = "reaction:add";
pub const EVENT_REACTION_REMOVE: &str = "reaction:remove";
pub const EVENT_NOTIFICATION_UPDATED: &str = "notification-updated";
pub const EVENT_ERROR: &str = "error";

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ============================================================================
// User
// ============================================================================

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip)]
    pub password_hash: String,
    pub display_name: String,
    /// Opaque end-to-end identity key material; the core never interprets it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_key: Option<Vec<u8>>,
    pub status: String,
    pub custom_status_message: Option<String>,
    pub custom_status_emoji: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct CreateUserDto {
    pub username: String,
    pub email: Option<String>,
    pub password: String,
    pub display_name: String,
}

#[derive(Debug, Serialize)]
pub struct UserDto {
    pub id: Uuid,
    pub username: String,
    pub display_name: String,
    pub status: String,
    pub custom_status_message: Option<String>,
    pub custom_status_emoji: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<User> for UserDto {
    fn from(user: User) -> Self {
        UserDto {
            id: user.id,
            username: user.username,
            display_name: user.display_name,
            status: user.status,
            custom_status_message: user.custom_status_message,
            custom_status_emoji: user.custom_status_emoji,
            created_at: user.created_at,
        }
    }
}

// ============================================================================
// Presence
// ============================================================================

/// The five presence values from spec.md §3. `Custom` carries a short message
/// and/or emoji; `Away` is never set directly by a client — it is inferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PresenceKind {
    Online,
    Away,
    Busy,
    Custom,
    Offline,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceStatus {
    pub kind: PresenceKind,
    pub custom_message: Option<String>,
    pub custom_emoji: Option<String>,
}

impl PresenceStatus {
    pub fn online() -> Self {
        PresenceStatus {
            kind: PresenceKind::Online,
            custom_message: None,
            custom_emoji: None,
        }
    }

    pub fn offline() -> Self {
        PresenceStatus {
            kind: PresenceKind::Offline,
            custom_message: None,
            custom_emoji: None,
        }
    }
}

// ============================================================================
// Connection session (the duplex Gateway connection; spec.md §3 "Session")
// ============================================================================

#[derive(Debug, Clone)]
pub struct ConnectionSession {
    pub session_id: Uuid,
    pub user_id: Uuid,
    pub connected_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

/// The REST companion surface's login/refresh-token record. Named
/// `RefreshSession` (rather than `Session`) to avoid colliding with the
/// spec's duplex-connection `Session` concept.
#[derive(Debug, Clone, FromRow)]
pub struct RefreshSession {
    pub id: Uuid,
    pub user_id: Uuid,
    pub refresh_token_hash: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub revoked: bool,
}

// ============================================================================
// Conversation
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConversationKind {
    Direct,
    Group,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Conversation {
    pub id: Uuid,
    pub kind: String,
    pub display_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversationDto {
    pub id: Uuid,
    pub kind: ConversationKind,
    pub display_name: Option<String>,
    pub participant_ids: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct CreateConversationDto {
    pub display_name: Option<String>,
    pub participant_ids: Vec<Uuid>,
}

// ============================================================================
// Message
// ============================================================================

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    /// Opaque payload — plaintext or end-to-end ciphertext; the core never
    /// inspects it (spec.md §1 Non-goals).
    pub payload: String,
    pub media_ref: Option<String>,
    pub parent_message_id: Option<Uuid>,
    pub read_receipts_enabled: bool,
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct CreateMessageDto {
    pub client_message_id: Uuid,
    pub conversation_id: Uuid,
    pub payload: String,
    pub parent_message_id: Option<Uuid>,
    pub media_ref: Option<String>,
}

// ============================================================================
// Delivery record (spec.md §3, §4.4)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, strum::Display, strum::EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DeliveryState {
    Queued,
    Sent,
    Delivered,
    Read,
}

impl DeliveryState {
    /// Whether `next` is a legal forward (or no-op) transition from `self`.
    /// Backward moves are rejected; staying put (duplicate transition) is a
    /// permitted no-op per spec.md §3's idempotence invariant.
    pub fn can_advance_to(self, next: DeliveryState) -> bool {
        next >= self
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct DeliveryRecord {
    pub message_id: Uuid,
    pub recipient_id: Uuid,
    pub state: String,
    pub queued_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Reaction
// ============================================================================

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Reaction {
    pub message_id: Uuid,
    pub user_id: Uuid,
    pub emoji: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct ReactionCount {
    pub emoji: String,
    pub count: i64,
    pub me: bool,
}

// ============================================================================
// Push subscription & notification preferences
// ============================================================================

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct PushSubscription {
    pub id: Uuid,
    pub user_id: Uuid,
    pub endpoint: String,
    pub key_material: String,
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct CreatePushSubscriptionDto {
    pub endpoint: String,
    pub key_material: String,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct NotificationSettings {
    pub user_id: Uuid,
    pub messages_enabled: bool,
    pub mentions_enabled: bool,
    pub reactions_enabled: bool,
    pub contact_requests_enabled: bool,
    /// Local-time quiet-hours window, minutes-since-midnight. `None` disables
    /// quiet hours. A window that wraps past midnight (start > end) is valid.
    pub quiet_hours_start_minute: Option<i32>,
    pub quiet_hours_end_minute: Option<i32>,
    pub muted_conversation_ids: Vec<Uuid>,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        NotificationSettings {
            user_id: Uuid::nil(),
            messages_enabled: true,
            mentions_enabled: true,
            reactions_enabled: true,
            contact_requests_enabled: true,
            quiet_hours_start_minute: None,
            quiet_hours_end_minute: None,
            muted_conversation_ids: Vec::new(),
        }
    }
}

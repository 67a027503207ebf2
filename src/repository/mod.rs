//! The persistence collaborator.
//!
//! Per spec.md §9's "Dynamic dispatch for transports" design note, every
//! component talks to storage through this trait, never through `sqlx`
//! directly. `PgRepository` is the production adapter; `MemoryRepository`
//! is the in-process fake used by unit tests and by `MOCK_DATABASE=1` dev
//! mode (spec.md §6's "Optional mock-database toggle for development").

pub mod memory;
pub mod pg;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::AppResult;
use crate::models::{
    Conversation, CreateConversationDto, DeliveryRecord, DeliveryState, Message,
    NotificationSettings, PushSubscription, Reaction, RefreshSession, User,
};

pub use memory::MemoryRepository;
pub use pg::PgRepository;

/// A single offline-queued event, opaque to the queue itself (spec.md §4.6).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct QueuedEvent {
    pub id: Uuid,
    pub recipient_id: Uuid,
    pub kind: QueuedEventKind,
    pub event_type: String,
    pub payload: serde_json::Value,
    /// Present when `kind == Message`, so delivery can be advanced on drain.
    pub message_id: Option<Uuid>,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum QueuedEventKind {
    Message,
    Ephemeral,
}

#[async_trait]
pub trait Repository: Send + Sync {
    // -- Users --
    async fn create_user(
        &self,
        username: &str,
        email: Option<&str>,
        password_hash: &str,
        display_name: &str,
    ) -> AppResult<User>;
    async fn get_user(&self, user_id: Uuid) -> AppResult<Option<User>>;
    async fn get_user_by_username(&self, username: &str) -> AppResult<Option<User>>;
    async fn set_user_presence_fields(
        &self,
        user_id: Uuid,
        status: &str,
        custom_message: Option<&str>,
        custom_emoji: Option<&str>,
    ) -> AppResult<()>;

    // -- Refresh sessions (REST companion surface) --
    async fn create_refresh_session(
        &self,
        user_id: Uuid,
        token_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> AppResult<RefreshSession>;
    async fn get_refresh_session_by_hash(&self, token_hash: &str) -> AppResult<Option<RefreshSession>>;
    async fn revoke_refresh_session(&self, id: Uuid) -> AppResult<()>;

    // -- Conversations --
    async fn create_conversation(
        &self,
        kind: &str,
        dto: CreateConversationDto,
    ) -> AppResult<Conversation>;
    async fn get_conversation(&self, conversation_id: Uuid) -> AppResult<Option<Conversation>>;
    async fn find_direct_conversation(&self, a: Uuid, b: Uuid) -> AppResult<Option<Uuid>>;
    async fn list_participants(&self, conversation_id: Uuid) -> AppResult<Vec<Uuid>>;
    async fn list_conversation_ids_for_user(&self, user_id: Uuid) -> AppResult<Vec<Uuid>>;
    /// Users sharing at least one conversation with `user_id` (the
    /// "observable-by set" of spec.md §4.2).
    async fn list_observers_of(&self, user_id: Uuid) -> AppResult<Vec<Uuid>>;
    async fn add_participant(&self, conversation_id: Uuid, user_id: Uuid) -> AppResult<()>;
    async fn remove_participant(&self, conversation_id: Uuid, user_id: Uuid) -> AppResult<()>;
    async fn rename_conversation(&self, conversation_id: Uuid, display_name: &str) -> AppResult<()>;
    async fn touch_conversation(&self, conversation_id: Uuid, at: DateTime<Utc>) -> AppResult<()>;

    // -- Messages --
    async fn create_message(&self, sender_id: Uuid, dto: crate::models::CreateMessageDto) -> AppResult<Message>;
    async fn get_message(&self, message_id: Uuid) -> AppResult<Option<Message>>;
    async fn list_messages(
        &self,
        conversation_id: Uuid,
        before: Option<Uuid>,
        limit: i64,
    ) -> AppResult<Vec<Message>>;
    async fn soft_delete_message(&self, message_id: Uuid) -> AppResult<bool>;

    // -- Delivery records --
    async fn ensure_delivery_record(&self, message_id: Uuid, recipient_id: Uuid) -> AppResult<DeliveryRecord>;
    async fn get_delivery_record(&self, message_id: Uuid, recipient_id: Uuid) -> AppResult<Option<DeliveryRecord>>;
    /// Advance to `next` iff `next > current` (monotonic); returns `true` if
    /// the row actually changed (the caller emits `message-status` only then).
    async fn advance_delivery_state(
        &self,
        message_id: Uuid,
        recipient_id: Uuid,
        next: DeliveryState,
        at: DateTime<Utc>,
    ) -> AppResult<bool>;
    /// Promote every record for `recipient_id` in `conversation_id` with
    /// state <= Delivered up to Read, at or before `watermark`. Returns the
    /// distinct set of (sender_id, message_id) pairs actually promoted, for
    /// the one-coalesced-event-per-sender emission rule of spec.md §4.4.
    async fn mark_conversation_read(
        &self,
        conversation_id: Uuid,
        recipient_id: Uuid,
        watermark: DateTime<Utc>,
    ) -> AppResult<Vec<(Uuid, Uuid)>>;

    // -- Reactions --
    async fn add_reaction(&self, message_id: Uuid, user_id: Uuid, emoji: &str) -> AppResult<bool>;
    async fn remove_reaction(&self, message_id: Uuid, user_id: Uuid, emoji: &str) -> AppResult<bool>;
    async fn list_reactions(&self, message_id: Uuid, caller_id: Uuid) -> AppResult<Vec<crate::models::ReactionCount>>;
    #[allow(dead_code)]
    async fn list_raw_reactions(&self, message_id: Uuid) -> AppResult<Vec<Reaction>>;

    // -- Push subscriptions & notification settings --
    async fn create_push_subscription(
        &self,
        user_id: Uuid,
        endpoint: &str,
        key_material: &str,
        user_agent: Option<&str>,
    ) -> AppResult<PushSubscription>;
    async fn list_push_subscriptions(&self, user_id: Uuid) -> AppResult<Vec<PushSubscription>>;
    async fn delete_push_subscription_by_endpoint(&self, user_id: Uuid, endpoint: &str) -> AppResult<()>;
    async fn evict_push_subscription(&self, subscription_id: Uuid) -> AppResult<()>;
    async fn get_notification_settings(&self, user_id: Uuid) -> AppResult<NotificationSettings>;
    async fn put_notification_settings(&self, settings: NotificationSettings) -> AppResult<()>;

    // -- Offline queue (component F) --
    async fn enqueue_offline_event(&self, event: QueuedEvent) -> AppResult<()>;
    async fn list_offline_events(&self, recipient_id: Uuid) -> AppResult<Vec<QueuedEvent>>;
    async fn remove_offline_event(&self, recipient_id: Uuid, event_id: Uuid) -> AppResult<()>;
    async fn count_offline_events(&self, recipient_id: Uuid) -> AppResult<(usize, usize)>; // (messages, ephemeral)
    async fn drop_oldest_ephemeral_event(&self, recipient_id: Uuid) -> AppResult<()>;
}

//! Postgres-backed `Repository`, grounded in the teacher's `sqlx::query_as`
//! idiom (bound parameters, `RETURNING` clauses, `ON CONFLICT` upserts).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::{QueuedEvent, QueuedEventKind, Repository};
use crate::error::{AppError, AppResult};
use crate::models::{
    Conversation, CreateConversationDto, CreateMessageDto, DeliveryRecord, DeliveryState, Message,
    NotificationSettings, PushSubscription, Reaction, ReactionCount, RefreshSession, User,
};

#[derive(Clone)]
pub struct PgRepository {
    pool: PgPool,
}

impl PgRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Repository for PgRepository {
    async fn create_user(
        &self,
        username: &str,
        email: Option<&str>,
        password_hash: &str,
        display_name: &str,
    ) -> AppResult<User> {
        let user = sqlx::query_as::<_, User>(
            "INSERT INTO users (username, email, password_hash, display_name, status)
             VALUES ($1, $2, $3, $4, 'offline')
             RETURNING id, username, email, password_hash, display_name, identity_key,
                       status, custom_status_message, custom_status_emoji, created_at, updated_at",
        )
        .bind(username)
        .bind(email)
        .bind(password_hash)
        .bind(display_name)
        .fetch_one(&self.pool)
        .await?;
        Ok(user)
    }

    async fn get_user(&self, user_id: Uuid) -> AppResult<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            "SELECT id, username, email, password_hash, display_name, identity_key,
                    status, custom_status_message, custom_status_emoji, created_at, updated_at
             FROM users WHERE id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    async fn get_user_by_username(&self, username: &str) -> AppResult<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            "SELECT id, username, email, password_hash, display_name, identity_key,
                    status, custom_status_message, custom_status_emoji, created_at, updated_at
             FROM users WHERE username = $1",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    async fn set_user_presence_fields(
        &self,
        user_id: Uuid,
        status: &str,
        custom_message: Option<&str>,
        custom_emoji: Option<&str>,
    ) -> AppResult<()> {
        sqlx::query(
            "UPDATE users SET status = $1, custom_status_message = $2, custom_status_emoji = $3,
                    updated_at = NOW()
             WHERE id = $4",
        )
        .bind(status)
        .bind(custom_message)
        .bind(custom_emoji)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn create_refresh_session(
        &self,
        user_id: Uuid,
        token_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> AppResult<RefreshSession> {
        let session = sqlx::query_as::<_, RefreshSession>(
            "INSERT INTO refresh_sessions (user_id, refresh_token_hash, expires_at)
             VALUES ($1, $2, $3)
             RETURNING id, user_id, refresh_token_hash, expires_at, created_at, revoked",
        )
        .bind(user_id)
        .bind(token_hash)
        .bind(expires_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(session)
    }

    async fn get_refresh_session_by_hash(&self, token_hash: &str) -> AppResult<Option<RefreshSession>> {
        let session = sqlx::query_as::<_, RefreshSession>(
            "SELECT id, user_id, refresh_token_hash, expires_at, created_at, revoked
             FROM refresh_sessions WHERE refresh_token_hash = $1",
        )
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(session)
    }

    async fn revoke_refresh_session(&self, id: Uuid) -> AppResult<()> {
        sqlx::query("UPDATE refresh_sessions SET revoked = TRUE WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn create_conversation(
        &self,
        kind: &str,
        dto: CreateConversationDto,
    ) -> AppResult<Conversation> {
        let mut tx = self.pool.begin().await?;

        let conversation = sqlx::query_as::<_, Conversation>(
            "INSERT INTO conversations (kind, display_name) VALUES ($1, $2)
             RETURNING id, kind, display_name, created_at, last_active_at",
        )
        .bind(kind)
        .bind(&dto.display_name)
        .fetch_one(&mut *tx)
        .await?;

        for participant_id in &dto.participant_ids {
            sqlx::query(
                "INSERT INTO conversation_participants (conversation_id, user_id, joined_at)
                 VALUES ($1, $2, NOW())",
            )
            .bind(conversation.id)
            .bind(participant_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(conversation)
    }

    async fn get_conversation(&self, conversation_id: Uuid) -> AppResult<Option<Conversation>> {
        let conversation = sqlx::query_as::<_, Conversation>(
            "SELECT id, kind, display_name, created_at, last_active_at
             FROM conversations WHERE id = $1",
        )
        .bind(conversation_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(conversation)
    }

    async fn find_direct_conversation(&self, a: Uuid, b: Uuid) -> AppResult<Option<Uuid>> {
        let id = sqlx::query_scalar::<_, Uuid>(
            "SELECT cp1.conversation_id
             FROM conversation_participants cp1
             JOIN conversation_participants cp2
               ON cp1.conversation_id = cp2.conversation_id AND cp2.user_id = $2
             JOIN conversations c ON c.id = cp1.conversation_id
             WHERE cp1.user_id = $1 AND c.kind = 'direct'
             LIMIT 1",
        )
        .bind(a)
        .bind(b)
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }

    async fn list_participants(&self, conversation_id: Uuid) -> AppResult<Vec<Uuid>> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            "SELECT user_id FROM conversation_participants WHERE conversation_id = $1",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn list_conversation_ids_for_user(&self, user_id: Uuid) -> AppResult<Vec<Uuid>> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            "SELECT conversation_id FROM conversation_participants WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn list_observers_of(&self, user_id: Uuid) -> AppResult<Vec<Uuid>> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            "SELECT DISTINCT cp2.user_id
             FROM conversation_participants cp1
             JOIN conversation_participants cp2 ON cp1.conversation_id = cp2.conversation_id
             WHERE cp1.user_id = $1 AND cp2.user_id != $1",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn add_participant(&self, conversation_id: Uuid, user_id: Uuid) -> AppResult<()> {
        sqlx::query(
            "INSERT INTO conversation_participants (conversation_id, user_id, joined_at)
             VALUES ($1, $2, NOW())
             ON CONFLICT (conversation_id, user_id) DO NOTHING",
        )
        .bind(conversation_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove_participant(&self, conversation_id: Uuid, user_id: Uuid) -> AppResult<()> {
        sqlx::query("DELETE FROM conversation_participants WHERE conversation_id = $1 AND user_id = $2")
            .bind(conversation_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn rename_conversation(&self, conversation_id: Uuid, display_name: &str) -> AppResult<()> {
        sqlx::query("UPDATE conversations SET display_name = $1 WHERE id = $2")
            .bind(display_name)
            .bind(conversation_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn touch_conversation(&self, conversation_id: Uuid, at: DateTime<Utc>) -> AppResult<()> {
        sqlx::query("UPDATE conversations SET last_active_at = $1 WHERE id = $2")
            .bind(at)
            .bind(conversation_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn create_message(&self, sender_id: Uuid, dto: CreateMessageDto) -> AppResult<Message> {
        let message = sqlx::query_as::<_, Message>(
            "INSERT INTO messages (id, conversation_id, sender_id, payload, parent_message_id, media_ref)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING id, conversation_id, sender_id, payload, media_ref, parent_message_id,
                       read_receipts_enabled, deleted, created_at",
        )
        .bind(dto.client_message_id)
        .bind(dto.conversation_id)
        .bind(sender_id)
        .bind(&dto.payload)
        .bind(dto.parent_message_id)
        .bind(&dto.media_ref)
        .fetch_one(&self.pool)
        .await?;

        sqlx::query("UPDATE conversations SET last_active_at = NOW() WHERE id = $1")
            .bind(dto.conversation_id)
            .execute(&self.pool)
            .await?;

        Ok(message)
    }

    async fn get_message(&self, message_id: Uuid) -> AppResult<Option<Message>> {
        let message = sqlx::query_as::<_, Message>(
            "SELECT id, conversation_id, sender_id, payload, media_ref, parent_message_id,
                    read_receipts_enabled, deleted, created_at
             FROM messages WHERE id = $1 AND deleted = FALSE",
        )
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(message)
    }

    async fn list_messages(
        &self,
        conversation_id: Uuid,
        before: Option<Uuid>,
        limit: i64,
    ) -> AppResult<Vec<Message>> {
        let messages = if let Some(before_id) = before {
            sqlx::query_as::<_, Message>(
                "SELECT id, conversation_id, sender_id, payload, media_ref, parent_message_id,
                        read_receipts_enabled, deleted, created_at
                 FROM messages
                 WHERE conversation_id = $1 AND deleted = FALSE
                   AND (created_at, id) < (SELECT created_at, id FROM messages WHERE id = $2)
                 ORDER BY created_at DESC, id DESC
                 LIMIT $3",
            )
            .bind(conversation_id)
            .bind(before_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query_as::<_, Message>(
                "SELECT id, conversation_id, sender_id, payload, media_ref, parent_message_id,
                        read_receipts_enabled, deleted, created_at
                 FROM messages
                 WHERE conversation_id = $1 AND deleted = FALSE
                 ORDER BY created_at DESC, id DESC
                 LIMIT $2",
            )
            .bind(conversation_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        };
        Ok(messages)
    }

    async fn soft_delete_message(&self, message_id: Uuid) -> AppResult<bool> {
        let result = sqlx::query("UPDATE messages SET deleted = TRUE WHERE id = $1 AND deleted = FALSE")
            .bind(message_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn ensure_delivery_record(&self, message_id: Uuid, recipient_id: Uuid) -> AppResult<DeliveryRecord> {
        let record = sqlx::query_as::<_, DeliveryRecord>(
            "INSERT INTO delivery_records (message_id, recipient_id, state, queued_at)
             VALUES ($1, $2, 'queued', NOW())
             ON CONFLICT (message_id, recipient_id) DO UPDATE SET message_id = EXCLUDED.message_id
             RETURNING message_id, recipient_id, state, queued_at, sent_at, delivered_at, read_at",
        )
        .bind(message_id)
        .bind(recipient_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(record)
    }

    async fn get_delivery_record(&self, message_id: Uuid, recipient_id: Uuid) -> AppResult<Option<DeliveryRecord>> {
        let record = sqlx::query_as::<_, DeliveryRecord>(
            "SELECT message_id, recipient_id, state, queued_at, sent_at, delivered_at, read_at
             FROM delivery_records WHERE message_id = $1 AND recipient_id = $2",
        )
        .bind(message_id)
        .bind(recipient_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn advance_delivery_state(
        &self,
        message_id: Uuid,
        recipient_id: Uuid,
        next: DeliveryState,
        at: DateTime<Utc>,
    ) -> AppResult<bool> {
        let current = self
            .get_delivery_record(message_id, recipient_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Delivery record not found".into()))?;

        let current_state: DeliveryState = current
            .state
            .parse()
            .map_err(|_| AppError::Internal)?;
        if !current_state.can_advance_to(next) || current_state == next {
            return Ok(false);
        }

        let column = match next {
            DeliveryState::Sent => "sent_at",
            DeliveryState::Delivered => "delivered_at",
            DeliveryState::Read => "read_at",
            DeliveryState::Queued => return Ok(false),
        };

        let query = format!(
            "UPDATE delivery_records SET state = $1, {column} = $2
             WHERE message_id = $3 AND recipient_id = $4"
        );
        sqlx::query(&query)
            .bind(next.to_string())
            .bind(at)
            .bind(message_id)
            .bind(recipient_id)
            .execute(&self.pool)
            .await?;
        Ok(true)
    }

    async fn mark_conversation_read(
        &self,
        conversation_id: Uuid,
        recipient_id: Uuid,
        watermark: DateTime<Utc>,
    ) -> AppResult<Vec<(Uuid, Uuid)>> {
        #[derive(sqlx::FromRow)]
        struct Row {
            sender_id: Uuid,
            message_id: Uuid,
        }

        let rows = sqlx::query_as::<_, Row>(
            "UPDATE delivery_records dr
             SET state = 'read', read_at = $4,
                 delivered_at = COALESCE(dr.delivered_at, $4)
             FROM messages m
             WHERE dr.message_id = m.id
               AND m.conversation_id = $1
               AND dr.recipient_id = $2
               AND dr.state IN ('queued', 'sent', 'delivered')
               AND m.created_at <= $3
             RETURNING m.sender_id AS sender_id, m.id AS message_id",
        )
        .bind(conversation_id)
        .bind(recipient_id)
        .bind(watermark)
        .bind(Utc::now())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| (r.sender_id, r.message_id)).collect())
    }

    async fn add_reaction(&self, message_id: Uuid, user_id: Uuid, emoji: &str) -> AppResult<bool> {
        let result = sqlx::query(
            "INSERT INTO message_reactions (message_id, user_id, emoji, created_at)
             VALUES ($1, $2, $3, NOW())
             ON CONFLICT (message_id, user_id, emoji) DO NOTHING",
        )
        .bind(message_id)
        .bind(user_id)
        .bind(emoji)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn remove_reaction(&self, message_id: Uuid, user_id: Uuid, emoji: &str) -> AppResult<bool> {
        let result = sqlx::query(
            "DELETE FROM message_reactions WHERE message_id = $1 AND user_id = $2 AND emoji = $3",
        )
        .bind(message_id)
        .bind(user_id)
        .bind(emoji)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_reactions(&self, message_id: Uuid, caller_id: Uuid) -> AppResult<Vec<ReactionCount>> {
        #[derive(sqlx::FromRow)]
        struct Row {
            emoji: String,
            count: i64,
            me: bool,
        }
        let rows = sqlx::query_as::<_, Row>(
            "SELECT emoji, COUNT(*) AS count, BOOL_OR(user_id = $2) AS me
             FROM message_reactions WHERE message_id = $1
             GROUP BY emoji ORDER BY MIN(created_at) ASC",
        )
        .bind(message_id)
        .bind(caller_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| ReactionCount {
                emoji: r.emoji,
                count: r.count,
                me: r.me,
            })
            .collect())
    }

    async fn list_raw_reactions(&self, message_id: Uuid) -> AppResult<Vec<Reaction>> {
        let rows = sqlx::query_as::<_, Reaction>(
            "SELECT message_id, user_id, emoji, created_at FROM message_reactions WHERE message_id = $1",
        )
        .bind(message_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn create_push_subscription(
        &self,
        user_id: Uuid,
        endpoint: &str,
        key_material: &str,
        user_agent: Option<&str>,
    ) -> AppResult<PushSubscription> {
        let sub = sqlx::query_as::<_, PushSubscription>(
            "INSERT INTO push_subscriptions (user_id, endpoint, key_material, user_agent)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (user_id, endpoint) DO UPDATE SET key_material = EXCLUDED.key_material
             RETURNING id, user_id, endpoint, key_material, user_agent, created_at",
        )
        .bind(user_id)
        .bind(endpoint)
        .bind(key_material)
        .bind(user_agent)
        .fetch_one(&self.pool)
        .await?;
        Ok(sub)
    }

    async fn list_push_subscriptions(&self, user_id: Uuid) -> AppResult<Vec<PushSubscription>> {
        let subs = sqlx::query_as::<_, PushSubscription>(
            "SELECT id, user_id, endpoint, key_material, user_agent, created_at
             FROM push_subscriptions WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(subs)
    }

    async fn delete_push_subscription_by_endpoint(&self, user_id: Uuid, endpoint: &str) -> AppResult<()> {
        sqlx::query("DELETE FROM push_subscriptions WHERE user_id = $1 AND endpoint = $2")
            .bind(user_id)
            .bind(endpoint)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn evict_push_subscription(&self, subscription_id: Uuid) -> AppResult<()> {
        sqlx::query("DELETE FROM push_subscriptions WHERE id = $1")
            .bind(subscription_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_notification_settings(&self, user_id: Uuid) -> AppResult<NotificationSettings> {
        let settings = sqlx::query_as::<_, NotificationSettings>(
            "SELECT user_id, messages_enabled, mentions_enabled, reactions_enabled,
                    contact_requests_enabled, quiet_hours_start_minute, quiet_hours_end_minute,
                    muted_conversation_ids
             FROM notification_settings WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(settings.unwrap_or(NotificationSettings {
            user_id,
            ..Default::default()
        }))
    }

    async fn put_notification_settings(&self, settings: NotificationSettings) -> AppResult<()> {
        sqlx::query(
            "INSERT INTO notification_settings
                 (user_id, messages_enabled, mentions_enabled, reactions_enabled,
                  contact_requests_enabled, quiet_hours_start_minute, quiet_hours_end_minute,
                  muted_conversation_ids)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (user_id) DO UPDATE SET
                 messages_enabled = EXCLUDED.messages_enabled,
                 mentions_enabled = EXCLUDED.mentions_enabled,
                 reactions_enabled = EXCLUDED.reactions_enabled,
                 contact_requests_enabled = EXCLUDED.contact_requests_enabled,
                 quiet_hours_start_minute = EXCLUDED.quiet_hours_start_minute,
                 quiet_hours_end_minute = EXCLUDED.quiet_hours_end_minute,
                 muted_conversation_ids = EXCLUDED.muted_conversation_ids",
        )
        .bind(settings.user_id)
        .bind(settings.messages_enabled)
        .bind(settings.mentions_enabled)
        .bind(settings.reactions_enabled)
        .bind(settings.contact_requests_enabled)
        .bind(settings.quiet_hours_start_minute)
        .bind(settings.quiet_hours_end_minute)
        .bind(&settings.muted_conversation_ids as &[Uuid])
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn enqueue_offline_event(&self, event: QueuedEvent) -> AppResult<()> {
        let kind = match event.kind {
            QueuedEventKind::Message => "message",
            QueuedEventKind::Ephemeral => "ephemeral",
        };
        sqlx::query(
            "INSERT INTO offline_message_queue
                 (id, recipient_id, kind, event_type, payload, message_id, enqueued_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(event.id)
        .bind(event.recipient_id)
        .bind(kind)
        .bind(&event.event_type)
        .bind(&event.payload)
        .bind(event.message_id)
        .bind(event.enqueued_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_offline_events(&self, recipient_id: Uuid) -> AppResult<Vec<QueuedEvent>> {
        #[derive(sqlx::FromRow)]
        struct Row {
            id: Uuid,
            recipient_id: Uuid,
            kind: String,
            event_type: String,
            payload: serde_json::Value,
            message_id: Option<Uuid>,
            enqueued_at: DateTime<Utc>,
        }
        let rows = sqlx::query_as::<_, Row>(
            "SELECT id, recipient_id, kind, event_type, payload, message_id, enqueued_at
             FROM offline_message_queue WHERE recipient_id = $1 ORDER BY enqueued_at ASC",
        )
        .bind(recipient_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| QueuedEvent {
                id: r.id,
                recipient_id: r.recipient_id,
                kind: if r.kind == "message" {
                    QueuedEventKind::Message
                } else {
                    QueuedEventKind::Ephemeral
                },
                event_type: r.event_type,
                payload: r.payload,
                message_id: r.message_id,
                enqueued_at: r.enqueued_at,
            })
            .collect())
    }

    async fn remove_offline_event(&self, recipient_id: Uuid, event_id: Uuid) -> AppResult<()> {
        sqlx::query("DELETE FROM offline_message_queue WHERE recipient_id = $1 AND id = $2")
            .bind(recipient_id)
            .bind(event_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn count_offline_events(&self, recipient_id: Uuid) -> AppResult<(usize, usize)> {
        #[derive(sqlx::FromRow)]
        struct Row {
            messages: i64,
            ephemeral: i64,
        }
        let row = sqlx::query_as::<_, Row>(
            "SELECT
                 COUNT(*) FILTER (WHERE kind = 'message') AS messages,
                 COUNT(*) FILTER (WHERE kind = 'ephemeral') AS ephemeral
             FROM offline_message_queue WHERE recipient_id = $1",
        )
        .bind(recipient_id)
        .fetch_one(&self.pool)
        .await?;
        Ok((row.messages as usize, row.ephemeral as usize))
    }

    async fn drop_oldest_ephemeral_event(&self, recipient_id: Uuid) -> AppResult<()> {
        sqlx::query(
            "DELETE FROM offline_message_queue
             WHERE id = (
                 SELECT id FROM offline_message_queue
                 WHERE recipient_id = $1 AND kind = 'ephemeral'
                 ORDER BY enqueued_at ASC LIMIT 1
             )",
        )
        .bind(recipient_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

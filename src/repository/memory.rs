//! In-process fake `Repository`, backed by `dashmap` rather than a database.
//!
//! Used by unit/scenario tests (spec.md §8) and by `MOCK_DATABASE=1` dev mode
//! (spec.md §6). Mirrors the Postgres adapter's semantics exactly — same
//! delivery-state monotonicity, same soft-delete, same FIFO offline queue
//! order — so a scenario that passes here is not just a different repository
//! under test, it is the same contract.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

use super::{QueuedEvent, QueuedEventKind, Repository};
use crate::error::{AppError, AppResult};
use crate::models::{
    Conversation, CreateConversationDto, CreateMessageDto, DeliveryRecord, DeliveryState, Message,
    NotificationSettings, PushSubscription, Reaction, ReactionCount, RefreshSession, User,
};

#[derive(Default)]
pub struct MemoryRepository {
    users: DashMap<Uuid, User>,
    usernames: DashMap<String, Uuid>,
    refresh_sessions: DashMap<Uuid, RefreshSession>,
    refresh_by_hash: DashMap<String, Uuid>,
    conversations: DashMap<Uuid, Conversation>,
    participants: DashMap<Uuid, Vec<Uuid>>,
    messages: DashMap<Uuid, Message>,
    // conversation_id -> ordered message ids, oldest first
    conversation_messages: DashMap<Uuid, Mutex<Vec<Uuid>>>,
    delivery: DashMap<(Uuid, Uuid), DeliveryRecord>,
    reactions: DashMap<(Uuid, Uuid, String), DateTime<Utc>>,
    push_subscriptions: DashMap<Uuid, PushSubscription>,
    notification_settings: DashMap<Uuid, NotificationSettings>,
    offline_queue: DashMap<Uuid, Mutex<Vec<QueuedEvent>>>,
    message_seq: AtomicI64,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn create_user(
        &self,
        username: &str,
        email: Option<&str>,
        password_hash: &str,
        display_name: &str,
    ) -> AppResult<User> {
        if self.usernames.contains_key(username) {
            return Err(AppError::Conflict("Username already taken".into()));
        }
        let now = Utc::now();
        let user = User {
            id: Uuid::new_v4(),
            username: username.to_owned(),
            email: email.map(|e| e.to_owned()),
            password_hash: password_hash.to_owned(),
            display_name: display_name.to_owned(),
            identity_key: None,
            status: "offline".into(),
            custom_status_message: None,
            custom_status_emoji: None,
            created_at: now,
            updated_at: now,
        };
        self.usernames.insert(username.to_owned(), user.id);
        self.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn get_user(&self, user_id: Uuid) -> AppResult<Option<User>> {
        Ok(self.users.get(&user_id).map(|u| u.clone()))
    }

    async fn get_user_by_username(&self, username: &str) -> AppResult<Option<User>> {
        Ok(self
            .usernames
            .get(username)
            .and_then(|id| self.users.get(&*id).map(|u| u.clone())))
    }

    async fn set_user_presence_fields(
        &self,
        user_id: Uuid,
        status: &str,
        custom_message: Option<&str>,
        custom_emoji: Option<&str>,
    ) -> AppResult<()> {
        if let Some(mut user) = self.users.get_mut(&user_id) {
            user.status = status.to_owned();
            user.custom_status_message = custom_message.map(|s| s.to_owned());
            user.custom_status_emoji = custom_emoji.map(|s| s.to_owned());
            user.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn create_refresh_session(
        &self,
        user_id: Uuid,
        token_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> AppResult<RefreshSession> {
        let session = RefreshSession {
            id: Uuid::new_v4(),
            user_id,
            refresh_token_hash: token_hash.to_owned(),
            expires_at,
            created_at: Utc::now(),
            revoked: false,
        };
        self.refresh_by_hash.insert(token_hash.to_owned(), session.id);
        self.refresh_sessions.insert(session.id, session.clone());
        Ok(session)
    }

    async fn get_refresh_session_by_hash(&self, token_hash: &str) -> AppResult<Option<RefreshSession>> {
        Ok(self
            .refresh_by_hash
            .get(token_hash)
            .and_then(|id| self.refresh_sessions.get(&*id).map(|s| s.clone())))
    }

    async fn revoke_refresh_session(&self, id: Uuid) -> AppResult<()> {
        if let Some(mut session) = self.refresh_sessions.get_mut(&id) {
            session.revoked = true;
        }
        Ok(())
    }

    async fn create_conversation(
        &self,
        kind: &str,
        dto: CreateConversationDto,
    ) -> AppResult<Conversation> {
        let now = Utc::now();
        let conversation = Conversation {
            id: Uuid::new_v4(),
            kind: kind.to_owned(),
            display_name: dto.display_name,
            created_at: now,
            last_active_at: now,
        };
        self.participants.insert(conversation.id, dto.participant_ids);
        self.conversation_messages.insert(conversation.id, Mutex::new(Vec::new()));
        self.conversations.insert(conversation.id, conversation.clone());
        Ok(conversation)
    }

    async fn get_conversation(&self, conversation_id: Uuid) -> AppResult<Option<Conversation>> {
        Ok(self.conversations.get(&conversation_id).map(|c| c.clone()))
    }

    async fn find_direct_conversation(&self, a: Uuid, b: Uuid) -> AppResult<Option<Uuid>> {
        for entry in self.conversations.iter() {
            if entry.kind != "direct" {
                continue;
            }
            if let Some(members) = self.participants.get(entry.key()) {
                if members.contains(&a) && members.contains(&b) {
                    return Ok(Some(*entry.key()));
                }
            }
        }
        Ok(None)
    }

    async fn list_participants(&self, conversation_id: Uuid) -> AppResult<Vec<Uuid>> {
        Ok(self
            .participants
            .get(&conversation_id)
            .map(|v| v.clone())
            .unwrap_or_default())
    }

    async fn list_conversation_ids_for_user(&self, user_id: Uuid) -> AppResult<Vec<Uuid>> {
        Ok(self
            .participants
            .iter()
            .filter(|entry| entry.value().contains(&user_id))
            .map(|entry| *entry.key())
            .collect())
    }

    async fn list_observers_of(&self, user_id: Uuid) -> AppResult<Vec<Uuid>> {
        let mut observers: Vec<Uuid> = self
            .participants
            .iter()
            .filter(|entry| entry.value().contains(&user_id))
            .flat_map(|entry| entry.value().clone())
            .filter(|id| *id != user_id)
            .collect();
        observers.sort();
        observers.dedup();
        Ok(observers)
    }

    async fn add_participant(&self, conversation_id: Uuid, user_id: Uuid) -> AppResult<()> {
        let mut members = self.participants.entry(conversation_id).or_default();
        if !members.contains(&user_id) {
            members.push(user_id);
        }
        Ok(())
    }

    async fn remove_participant(&self, conversation_id: Uuid, user_id: Uuid) -> AppResult<()> {
        if let Some(mut members) = self.participants.get_mut(&conversation_id) {
            members.retain(|id| *id != user_id);
        }
        Ok(())
    }

    async fn rename_conversation(&self, conversation_id: Uuid, display_name: &str) -> AppResult<()> {
        if let Some(mut conversation) = self.conversations.get_mut(&conversation_id) {
            conversation.display_name = Some(display_name.to_owned());
        }
        Ok(())
    }

    async fn touch_conversation(&self, conversation_id: Uuid, at: DateTime<Utc>) -> AppResult<()> {
        if let Some(mut conversation) = self.conversations.get_mut(&conversation_id) {
            conversation.last_active_at = at;
        }
        Ok(())
    }

    async fn create_message(&self, sender_id: Uuid, dto: CreateMessageDto) -> AppResult<Message> {
        let message = Message {
            id: dto.client_message_id,
            conversation_id: dto.conversation_id,
            sender_id,
            payload: dto.payload,
            media_ref: dto.media_ref,
            parent_message_id: dto.parent_message_id,
            read_receipts_enabled: true,
            deleted: false,
            created_at: Utc::now(),
        };
        self.conversation_messages
            .entry(dto.conversation_id)
            .or_insert_with(|| Mutex::new(Vec::new()))
            .lock()
            .unwrap()
            .push(message.id);
        self.messages.insert(message.id, message.clone());
        self.message_seq.fetch_add(1, Ordering::Relaxed);
        if let Some(mut conversation) = self.conversations.get_mut(&dto.conversation_id) {
            conversation.last_active_at = message.created_at;
        }
        Ok(message)
    }

    async fn get_message(&self, message_id: Uuid) -> AppResult<Option<Message>> {
        Ok(self
            .messages
            .get(&message_id)
            .map(|m| m.clone())
            .filter(|m| !m.deleted))
    }

    async fn list_messages(
        &self,
        conversation_id: Uuid,
        before: Option<Uuid>,
        limit: i64,
    ) -> AppResult<Vec<Message>> {
        let ids = self
            .conversation_messages
            .get(&conversation_id)
            .map(|v| v.lock().unwrap().clone())
            .unwrap_or_default();

        let mut messages: Vec<Message> = ids
            .iter()
            .rev()
            .filter_map(|id| self.messages.get(id).map(|m| m.clone()))
            .filter(|m| !m.deleted)
            .collect();

        if let Some(before_id) = before {
            if let Some(pos) = messages.iter().position(|m| m.id == before_id) {
                messages = messages.split_off(pos + 1);
            }
        }

        messages.truncate(limit.max(0) as usize);
        Ok(messages)
    }

    async fn soft_delete_message(&self, message_id: Uuid) -> AppResult<bool> {
        if let Some(mut message) = self.messages.get_mut(&message_id) {
            if message.deleted {
                return Ok(false);
            }
            message.deleted = true;
            return Ok(true);
        }
        Ok(false)
    }

    async fn ensure_delivery_record(&self, message_id: Uuid, recipient_id: Uuid) -> AppResult<DeliveryRecord> {
        let record = self
            .delivery
            .entry((message_id, recipient_id))
            .or_insert_with(|| DeliveryRecord {
                message_id,
                recipient_id,
                state: DeliveryState::Queued.to_string(),
                queued_at: Utc::now(),
                sent_at: None,
                delivered_at: None,
                read_at: None,
            })
            .clone();
        Ok(record)
    }

    async fn get_delivery_record(&self, message_id: Uuid, recipient_id: Uuid) -> AppResult<Option<DeliveryRecord>> {
        Ok(self.delivery.get(&(message_id, recipient_id)).map(|r| r.clone()))
    }

    async fn advance_delivery_state(
        &self,
        message_id: Uuid,
        recipient_id: Uuid,
        next: DeliveryState,
        at: DateTime<Utc>,
    ) -> AppResult<bool> {
        let mut record = self
            .delivery
            .get_mut(&(message_id, recipient_id))
            .ok_or_else(|| AppError::NotFound("Delivery record not found".into()))?;

        let current: DeliveryState = record.state.parse().map_err(|_| AppError::Internal)?;
        if !current.can_advance_to(next) || current == next {
            return Ok(false);
        }

        record.state = next.to_string();
        match next {
            DeliveryState::Sent => record.sent_at = Some(at),
            DeliveryState::Delivered => record.delivered_at = Some(at),
            DeliveryState::Read => record.read_at = Some(at),
            DeliveryState::Queued => {}
        }
        Ok(true)
    }

    async fn mark_conversation_read(
        &self,
        conversation_id: Uuid,
        recipient_id: Uuid,
        watermark: DateTime<Utc>,
    ) -> AppResult<Vec<(Uuid, Uuid)>> {
        let now = Utc::now();
        let ids = self
            .conversation_messages
            .get(&conversation_id)
            .map(|v| v.lock().unwrap().clone())
            .unwrap_or_default();

        let mut promoted = Vec::new();
        for message_id in ids {
            let Some(message) = self.messages.get(&message_id).map(|m| m.clone()) else {
                continue;
            };
            if message.created_at > watermark {
                continue;
            }
            if let Some(mut record) = self.delivery.get_mut(&(message_id, recipient_id)) {
                let current: DeliveryState = record.state.parse().unwrap_or(DeliveryState::Queued);
                if current < DeliveryState::Read {
                    record.state = DeliveryState::Read.to_string();
                    if record.delivered_at.is_none() {
                        record.delivered_at = Some(now);
                    }
                    record.read_at = Some(now);
                    promoted.push((message.sender_id, message_id));
                }
            }
        }
        Ok(promoted)
    }

    async fn add_reaction(&self, message_id: Uuid, user_id: Uuid, emoji: &str) -> AppResult<bool> {
        let key = (message_id, user_id, emoji.to_owned());
        if self.reactions.contains_key(&key) {
            return Ok(false);
        }
        self.reactions.insert(key, Utc::now());
        Ok(true)
    }

    async fn remove_reaction(&self, message_id: Uuid, user_id: Uuid, emoji: &str) -> AppResult<bool> {
        let key = (message_id, user_id, emoji.to_owned());
        Ok(self.reactions.remove(&key).is_some())
    }

    async fn list_reactions(&self, message_id: Uuid, caller_id: Uuid) -> AppResult<Vec<ReactionCount>> {
        use std::collections::BTreeMap;
        let mut counts: BTreeMap<String, (i64, bool, DateTime<Utc>)> = BTreeMap::new();
        for entry in self.reactions.iter() {
            let (m, user, emoji) = entry.key();
            if *m != message_id {
                continue;
            }
            let slot = counts
                .entry(emoji.clone())
                .or_insert((0, false, *entry.value()));
            slot.0 += 1;
            if *user == caller_id {
                slot.1 = true;
            }
            if *entry.value() < slot.2 {
                slot.2 = *entry.value();
            }
        }
        let mut ordered: Vec<(String, (i64, bool, DateTime<Utc>))> = counts.into_iter().collect();
        ordered.sort_by_key(|(_, (_, _, first_at))| *first_at);
        Ok(ordered
            .into_iter()
            .map(|(emoji, (count, me, _))| ReactionCount { emoji, count, me })
            .collect())
    }

    async fn list_raw_reactions(&self, message_id: Uuid) -> AppResult<Vec<Reaction>> {
        Ok(self
            .reactions
            .iter()
            .filter(|entry| entry.key().0 == message_id)
            .map(|entry| Reaction {
                message_id: entry.key().0,
                user_id: entry.key().1,
                emoji: entry.key().2.clone(),
                created_at: *entry.value(),
            })
            .collect())
    }

    async fn create_push_subscription(
        &self,
        user_id: Uuid,
        endpoint: &str,
        key_material: &str,
        user_agent: Option<&str>,
    ) -> AppResult<PushSubscription> {
        if let Some(mut existing) = self
            .push_subscriptions
            .iter_mut()
            .find(|s| s.user_id == user_id && s.endpoint == endpoint)
        {
            existing.key_material = key_material.to_owned();
            return Ok(existing.clone());
        }
        let sub = PushSubscription {
            id: Uuid::new_v4(),
            user_id,
            endpoint: endpoint.to_owned(),
            key_material: key_material.to_owned(),
            user_agent: user_agent.map(|s| s.to_owned()),
            created_at: Utc::now(),
        };
        self.push_subscriptions.insert(sub.id, sub.clone());
        Ok(sub)
    }

    async fn list_push_subscriptions(&self, user_id: Uuid) -> AppResult<Vec<PushSubscription>> {
        Ok(self
            .push_subscriptions
            .iter()
            .filter(|s| s.user_id == user_id)
            .map(|s| s.clone())
            .collect())
    }

    async fn delete_push_subscription_by_endpoint(&self, user_id: Uuid, endpoint: &str) -> AppResult<()> {
        let ids: Vec<Uuid> = self
            .push_subscriptions
            .iter()
            .filter(|s| s.user_id == user_id && s.endpoint == endpoint)
            .map(|s| s.id)
            .collect();
        for id in ids {
            self.push_subscriptions.remove(&id);
        }
        Ok(())
    }

    async fn evict_push_subscription(&self, subscription_id: Uuid) -> AppResult<()> {
        self.push_subscriptions.remove(&subscription_id);
        Ok(())
    }

    async fn get_notification_settings(&self, user_id: Uuid) -> AppResult<NotificationSettings> {
        Ok(self
            .notification_settings
            .get(&user_id)
            .map(|s| s.clone())
            .unwrap_or(NotificationSettings {
                user_id,
                ..Default::default()
            }))
    }

    async fn put_notification_settings(&self, settings: NotificationSettings) -> AppResult<()> {
        self.notification_settings.insert(settings.user_id, settings);
        Ok(())
    }

    async fn enqueue_offline_event(&self, event: QueuedEvent) -> AppResult<()> {
        self.offline_queue
            .entry(event.recipient_id)
            .or_insert_with(|| Mutex::new(Vec::new()))
            .lock()
            .unwrap()
            .push(event);
        Ok(())
    }

    async fn list_offline_events(&self, recipient_id: Uuid) -> AppResult<Vec<QueuedEvent>> {
        Ok(self
            .offline_queue
            .get(&recipient_id)
            .map(|v| v.lock().unwrap().clone())
            .unwrap_or_default())
    }

    async fn remove_offline_event(&self, recipient_id: Uuid, event_id: Uuid) -> AppResult<()> {
        if let Some(queue) = self.offline_queue.get(&recipient_id) {
            queue.lock().unwrap().retain(|e| e.id != event_id);
        }
        Ok(())
    }

    async fn count_offline_events(&self, recipient_id: Uuid) -> AppResult<(usize, usize)> {
        let Some(queue) = self.offline_queue.get(&recipient_id) else {
            return Ok((0, 0));
        };
        let queue = queue.lock().unwrap();
        let messages = queue.iter().filter(|e| e.kind == QueuedEventKind::Message).count();
        let ephemeral = queue.iter().filter(|e| e.kind == QueuedEventKind::Ephemeral).count();
        Ok((messages, ephemeral))
    }

    async fn drop_oldest_ephemeral_event(&self, recipient_id: Uuid) -> AppResult<()> {
        if let Some(queue) = self.offline_queue.get(&recipient_id) {
            let mut queue = queue.lock().unwrap();
            if let Some(pos) = queue.iter().position(|e| e.kind == QueuedEventKind::Ephemeral) {
                queue.remove(pos);
            }
        }
        Ok(())
    }
}

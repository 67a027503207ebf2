//! Delivery Tracker (component D): advances and announces the four-state
//! delivery machine (`Queued -> Sent -> Delivered -> Read`) defined on
//! `DeliveryState` in `crate::models`.
//!
//! State mutation itself lives on the `Repository` trait, since it must be
//! transactional with the row it mutates; this module owns the
//! announcement side — emitting `message-status`/`message-delivered`/
//! `message-read` to the original sender, one coalesced event per sender
//! per batch rather than one per message (spec.md §4.4).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::error::AppResult;
use crate::models::DeliveryState;
use crate::repository::Repository;
use crate::router::SessionSender;

pub struct DeliveryTracker {
    repository: Arc<dyn Repository>,
    sessions: Arc<dyn SessionSender>,
}

impl DeliveryTracker {
    pub fn new(repository: Arc<dyn Repository>, sessions: Arc<dyn SessionSender>) -> Arc<Self> {
        Arc::new(Self { repository, sessions })
    }

    /// Advances a single recipient's record and, if the transition actually
    /// happened (monotonic, non-duplicate), tells the sender.
    pub async fn advance(
        &self,
        message_id: Uuid,
        recipient_id: Uuid,
        next: DeliveryState,
    ) -> AppResult<bool> {
        let changed = self
            .repository
            .advance_delivery_state(message_id, recipient_id, next, Utc::now())
            .await?;

        if !changed {
            return Ok(false);
        }

        let Some(message) = self.repository.get_message(message_id).await? else {
            return Ok(true);
        };
        if !message.read_receipts_enabled && next == DeliveryState::Read {
            return Ok(true);
        }

        let event_type = match next {
            DeliveryState::Sent => "message-status",
            DeliveryState::Delivered => "message-delivered",
            DeliveryState::Read => "message-read",
            DeliveryState::Queued => return Ok(true),
        };

        let payload = serde_json::json!({
            "op": "dispatch",
            "t": event_type,
            "d": { "message_id": message_id, "recipient_id": recipient_id, "state": next },
        });
        self.sessions.send_to_user(message.sender_id, payload).await;
        Ok(true)
    }

    /// Marks every deliverable message in `conversation_id` up to `watermark`
    /// as read for `recipient_id`, then emits exactly one `message-read`
    /// event per affected sender, naming the newest message id that sender
    /// needs to advance to (spec.md §4.4's coalescing rule).
    pub async fn mark_conversation_read(
        &self,
        conversation_id: Uuid,
        recipient_id: Uuid,
        watermark: chrono::DateTime<Utc>,
    ) -> AppResult<()> {
        let promoted = self
            .repository
            .mark_conversation_read(conversation_id, recipient_id, watermark)
            .await?;

        let mut newest_per_sender: HashMap<Uuid, Uuid> = HashMap::new();
        for (sender_id, message_id) in promoted {
            newest_per_sender.insert(sender_id, message_id);
        }

        for (sender_id, message_id) in newest_per_sender {
            if let Some(message) = self.repository.get_message(message_id).await? {
                if !message.read_receipts_enabled {
                    continue;
                }
            }
            let payload = serde_json::json!({
                "op": "dispatch",
                "t": "message-read",
                "d": {
                    "conversation_id": conversation_id,
                    "reader_id": recipient_id,
                    "through_message_id": message_id,
                },
            });
            self.sessions.send_to_user(sender_id, payload).await;
        }

        // Tells the reader's own other devices to reconcile their badge
        // state for this conversation (spec.md §4.1's `notification-updated`
        // bookkeeping event), independent of whatever senders were notified
        // above.
        let badge_payload = serde_json::json!({
            "op": "dispatch",
            "t": "notification-updated",
            "d": { "conversation_id": conversation_id, "read_through": watermark },
        });
        self.sessions.send_to_user(recipient_id, badge_payload).await;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CreateConversationDto, CreateMessageDto};
    use crate::repository::MemoryRepository;
    use async_trait::async_trait;
    use dashmap::DashMap;

    struct RecordingSessions {
        events_by_user: DashMap<Uuid, usize>,
    }

    #[async_trait]
    impl SessionSender for RecordingSessions {
        async fn send_to_user(&self, user_id: Uuid, _frame: serde_json::Value) -> usize {
            *self.events_by_user.entry(user_id).or_insert(0) += 1;
            1
        }
    }

    #[tokio::test]
    async fn advance_emits_status_event_only_on_real_transition() {
        let repo = Arc::new(MemoryRepository::new());
        let sessions = Arc::new(RecordingSessions { events_by_user: DashMap::new() });
        let sender = Uuid::new_v4();
        let recipient = Uuid::new_v4();

        let conversation = repo
            .create_conversation(
                "direct",
                CreateConversationDto { display_name: None, participant_ids: vec![sender, recipient] },
            )
            .await
            .unwrap();
        let message = repo
            .create_message(
                sender,
                CreateMessageDto {
                    client_message_id: Uuid::new_v4(),
                    conversation_id: conversation.id,
                    payload: "hi".into(),
                    parent_message_id: None,
                    media_ref: None,
                },
            )
            .await
            .unwrap();
        repo.ensure_delivery_record(message.id, recipient).await.unwrap();

        let tracker = DeliveryTracker::new(repo.clone(), sessions.clone());
        assert!(tracker.advance(message.id, recipient, DeliveryState::Delivered).await.unwrap());
        assert_eq!(sessions.events_by_user.get(&sender).map(|v| *v), Some(1));

        // Duplicate transition is a no-op: repeated read, no second event.
        assert!(!tracker.advance(message.id, recipient, DeliveryState::Delivered).await.unwrap());
        assert_eq!(sessions.events_by_user.get(&sender).map(|v| *v), Some(1));
    }

    #[tokio::test]
    async fn mark_conversation_read_coalesces_to_one_event_per_sender() {
        let repo = Arc::new(MemoryRepository::new());
        let sessions = Arc::new(RecordingSessions { events_by_user: DashMap::new() });
        let sender = Uuid::new_v4();
        let recipient = Uuid::new_v4();
        let conversation = repo
            .create_conversation(
                "direct",
                CreateConversationDto { display_name: None, participant_ids: vec![sender, recipient] },
            )
            .await
            .unwrap();

        for _ in 0..3 {
            let message = repo
                .create_message(
                    sender,
                    CreateMessageDto {
                        client_message_id: Uuid::new_v4(),
                        conversation_id: conversation.id,
                        payload: "hi".into(),
                        parent_message_id: None,
                        media_ref: None,
                    },
                )
                .await
                .unwrap();
            repo.ensure_delivery_record(message.id, recipient).await.unwrap();
        }

        let tracker = DeliveryTracker::new(repo.clone(), sessions.clone());
        tracker
            .mark_conversation_read(conversation.id, recipient, Utc::now())
            .await
            .unwrap();

        assert_eq!(sessions.events_by_user.get(&sender).map(|v| *v), Some(1));
        // The reader's own devices get exactly one badge-sync event too.
        assert_eq!(sessions.events_by_user.get(&recipient).map(|v| *v), Some(1));
    }
}

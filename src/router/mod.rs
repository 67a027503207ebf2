//! Conversation Router (component C): resolves a conversation to its
//! participant set and fans an event out to every participant's open
//! sessions, falling back to the Offline Queue and Push Dispatcher for
//! participants with none.
//!
//! Membership is read-through cached (spec.md §4.3: "a TTL cache over the
//! repository's participant list, invalidated on membership change") and
//! mutated under a per-conversation lock so concurrent joins/leaves cannot
//! race each other. The fixed lock order is conversation -> user -> session,
//! matching spec.md §5's concurrency model.

use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::PresenceStatus;
use crate::offline_queue::OfflineQueue;
use crate::presence::PresenceObserver;
use crate::repository::Repository;

/// Abstraction over the Session Gateway's connection table, so the router
/// never depends on the websocket transport directly. Returns the number of
/// open sessions the frame was actually written to.
#[async_trait]
pub trait SessionSender: Send + Sync {
    async fn send_to_user(&self, user_id: Uuid, frame: serde_json::Value) -> usize;
}

/// Abstraction over the Push Dispatcher, so the router can request a push
/// without depending on the transport-specific delivery logic.
#[async_trait]
pub trait PushNotifier: Send + Sync {
    async fn notify_offline(&self, user_id: Uuid, event_type: &str, payload: &serde_json::Value);
}

struct CachedMembership {
    participants: Vec<Uuid>,
    cached_at: Instant,
}

pub struct ConversationRouter {
    repository: Arc<dyn Repository>,
    sessions: Arc<dyn SessionSender>,
    push: Arc<dyn PushNotifier>,
    offline_queue: Arc<OfflineQueue>,
    membership: DashMap<Uuid, CachedMembership>,
    locks: DashMap<Uuid, Arc<AsyncMutex<()>>>,
    membership_ttl: StdDuration,
}

/// A fully-resolved event ready to fan out: an outbound payload plus
/// whether it should advance delivery state (only real messages do).
pub struct RoutedEvent {
    pub event_type: &'static str,
    pub payload: serde_json::Value,
    pub message_id: Option<Uuid>,
    pub exclude: Option<Uuid>,
}

impl ConversationRouter {
    pub fn new(
        repository: Arc<dyn Repository>,
        sessions: Arc<dyn SessionSender>,
        push: Arc<dyn PushNotifier>,
        offline_queue: Arc<OfflineQueue>,
        membership_ttl: StdDuration,
    ) -> Arc<Self> {
        Arc::new(Self {
            repository,
            sessions,
            push,
            offline_queue,
            membership: DashMap::new(),
            locks: DashMap::new(),
            membership_ttl,
        })
    }

    fn lock_for(&self, conversation_id: Uuid) -> Arc<AsyncMutex<()>> {
        self.locks
            .entry(conversation_id)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    pub async fn participants(&self, conversation_id: Uuid) -> AppResult<Vec<Uuid>> {
        if let Some(entry) = self.membership.get(&conversation_id) {
            if entry.cached_at.elapsed() < self.membership_ttl {
                return Ok(entry.participants.clone());
            }
        }
        let participants = self.repository.list_participants(conversation_id).await?;
        self.membership.insert(
            conversation_id,
            CachedMembership {
                participants: participants.clone(),
                cached_at: Instant::now(),
            },
        );
        Ok(participants)
    }

    fn invalidate(&self, conversation_id: Uuid) {
        self.membership.remove(&conversation_id);
    }

    pub async fn add_participant(&self, conversation_id: Uuid, user_id: Uuid) -> AppResult<()> {
        let lock = self.lock_for(conversation_id);
        let _guard = lock.lock().await;
        self.repository.add_participant(conversation_id, user_id).await?;
        self.invalidate(conversation_id);
        Ok(())
    }

    pub async fn remove_participant(&self, conversation_id: Uuid, user_id: Uuid) -> AppResult<()> {
        let lock = self.lock_for(conversation_id);
        let _guard = lock.lock().await;
        self.repository.remove_participant(conversation_id, user_id).await?;
        self.invalidate(conversation_id);
        Ok(())
    }

    /// Fans `event` out to every participant of `conversation_id` except
    /// `event.exclude`. For each recipient:
    /// 1. write to every open session;
    /// 2. if none were open, enqueue to the Offline Queue and request a push.
    /// When `event.message_id` is set, a delivered session write advances the
    /// recipient's delivery record to `Sent` (spec.md §4.4's gateway-write
    /// semantics, resolving the open question in favor of the simpler,
    /// server-authoritative rule).
    pub async fn dispatch(&self, conversation_id: Uuid, event: RoutedEvent) -> AppResult<()> {
        let participants = self.participants(conversation_id).await?;

        for recipient_id in participants {
            if Some(recipient_id) == event.exclude {
                continue;
            }

            let reached = self.sessions.send_to_user(recipient_id, event.payload.clone()).await;

            if reached > 0 {
                if let Some(message_id) = event.message_id {
                    let _ = self
                        .repository
                        .ensure_delivery_record(message_id, recipient_id)
                        .await;
                    let _ = self
                        .repository
                        .advance_delivery_state(
                            message_id,
                            recipient_id,
                            crate::models::DeliveryState::Sent,
                            chrono::Utc::now(),
                        )
                        .await;
                }
                continue;
            }

            let kind = if event.message_id.is_some() {
                crate::repository::QueuedEventKind::Message
            } else {
                crate::repository::QueuedEventKind::Ephemeral
            };

            if let Some(message_id) = event.message_id {
                self.repository.ensure_delivery_record(message_id, recipient_id).await?;
            }

            let accepted = self
                .offline_queue
                .enqueue(crate::repository::QueuedEvent {
                    id: Uuid::new_v4(),
                    recipient_id,
                    kind,
                    event_type: event.event_type.to_string(),
                    payload: event.payload.clone(),
                    message_id: event.message_id,
                    enqueued_at: chrono::Utc::now(),
                })
                .await?;

            if event.message_id.is_some() && !accepted {
                // spec.md §4.6: the offline queue is never allowed to drop a
                // message; once it is saturated with messages alone the
                // producer is backpressured instead (§7: fatal to this send,
                // surfaced to the sender as `message-failed`).
                return Err(AppError::Unavailable(format!(
                    "offline queue saturated for recipient {recipient_id}"
                )));
            }

            self.push.notify_offline(recipient_id, event.event_type, &event.payload).await;
        }

        Ok(())
    }

    /// Observer-of set for presence fan-out: every user sharing a
    /// conversation with `user_id` (spec.md §4.2's "observable-by set").
    pub async fn observers_of(&self, user_id: Uuid) -> AppResult<Vec<Uuid>> {
        self.repository.list_observers_of(user_id).await
    }
}

/// Bridges the Presence Registry to the router: a presence change is fanned
/// out as a `user-status` event to everyone who shares a conversation with
/// the affected user.
#[async_trait]
impl PresenceObserver for ConversationRouter {
    async fn on_presence_changed(&self, user_id: Uuid, status: PresenceStatus) {
        let Ok(observers) = self.observers_of(user_id).await else {
            return;
        };
        let payload = serde_json::json!({
            "op": "dispatch",
            "t": "user-status",
            "d": { "user_id": user_id, "status": status },
        });
        for observer_id in observers {
            self.sessions.send_to_user(observer_id, payload.clone()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CreateConversationDto, CreateMessageDto};
    use crate::repository::MemoryRepository;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RecordingSessions {
        reachable: DashMap<Uuid, usize>,
        sent: AtomicUsize,
    }

    #[async_trait]
    impl SessionSender for RecordingSessions {
        async fn send_to_user(&self, user_id: Uuid, _frame: serde_json::Value) -> usize {
            self.sent.fetch_add(1, Ordering::SeqCst);
            self.reachable.get(&user_id).map(|v| *v).unwrap_or(0)
        }
    }

    struct RecordingPush {
        count: AtomicUsize,
    }

    #[async_trait]
    impl PushNotifier for RecordingPush {
        async fn notify_offline(&self, _user_id: Uuid, _event_type: &str, _payload: &serde_json::Value) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn dispatch_advances_delivery_for_online_recipient() {
        let repo = Arc::new(MemoryRepository::new());
        let sender = Uuid::new_v4();
        let recipient = Uuid::new_v4();
        let conversation = repo
            .create_conversation(
                "direct",
                CreateConversationDto {
                    display_name: None,
                    participant_ids: vec![sender, recipient],
                },
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

        let reachable = DashMap::new();
        reachable.insert(recipient, 1);
        let sessions = Arc::new(RecordingSessions { reachable, sent: AtomicUsize::new(0) });
        let push = Arc::new(RecordingPush { count: AtomicUsize::new(0) });
        let offline_queue = OfflineQueue::new(repo.clone(), 100);

        let router = ConversationRouter::new(repo.clone(), sessions, push.clone(), offline_queue, StdDuration::from_secs(5));
        router
            .dispatch(
                conversation.id,
                RoutedEvent {
                    event_type: "message",
                    payload: serde_json::json!({}),
                    message_id: Some(message.id),
                    exclude: Some(sender),
                },
            )
            .await
            .unwrap();

        let record = repo.get_delivery_record(message.id, recipient).await.unwrap().unwrap();
        assert_eq!(record.state, "sent");
        assert_eq!(push.count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn dispatch_falls_back_to_offline_queue_and_push() {
        let repo = Arc::new(MemoryRepository::new());
        let sender = Uuid::new_v4();
        let recipient = Uuid::new_v4();
        let conversation = repo
            .create_conversation(
                "direct",
                CreateConversationDto {
                    display_name: None,
                    participant_ids: vec![sender, recipient],
                },
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

        let sessions = Arc::new(RecordingSessions { reachable: DashMap::new(), sent: AtomicUsize::new(0) });
        let push = Arc::new(RecordingPush { count: AtomicUsize::new(0) });
        let offline_queue = OfflineQueue::new(repo.clone(), 100);
        let router = ConversationRouter::new(repo.clone(), sessions, push.clone(), offline_queue, StdDuration::from_secs(5));

        router
            .dispatch(
                conversation.id,
                RoutedEvent {
                    event_type: "message",
                    payload: serde_json::json!({}),
                    message_id: Some(message.id),
                    exclude: Some(sender),
                },
            )
            .await
            .unwrap();

        let (messages, _) = repo.count_offline_events(recipient).await.unwrap();
        assert_eq!(messages, 1);
        assert_eq!(push.count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dispatch_surfaces_unavailable_when_offline_queue_is_saturated_with_messages() {
        let repo = Arc::new(MemoryRepository::new());
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

        let sessions = Arc::new(RecordingSessions { reachable: DashMap::new(), sent: AtomicUsize::new(0) });
        let push = Arc::new(RecordingPush { count: AtomicUsize::new(0) });
        // Capacity zero: the first offline message already saturates the queue.
        let offline_queue = OfflineQueue::new(repo.clone(), 0);
        let router = ConversationRouter::new(repo.clone(), sessions, push, offline_queue, StdDuration::from_secs(5));

        let result = router
            .dispatch(
                conversation.id,
                RoutedEvent {
                    event_type: "message",
                    payload: serde_json::json!({}),
                    message_id: Some(message.id),
                    exclude: Some(sender),
                },
            )
            .await;

        assert!(matches!(result, Err(AppError::Unavailable(_))));
    }
}

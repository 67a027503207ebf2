//! Push Dispatcher (component G): turns an event a recipient could not be
//! handed over an open session into a best-effort push notification,
//! honoring per-user notification preferences, quiet hours, and mute state,
//! with bounded exponential backoff and automatic eviction of dead
//! subscriptions.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{Timelike, Utc};
use uuid::Uuid;

use crate::models::{NotificationSettings, PushSubscription};
use crate::repository::Repository;
use crate::router::PushNotifier;

/// The event kinds the dispatcher will ever push for. Ephemeral signals
/// (typing, read receipts, presence) are filtered out before reaching this
/// enum — a push for "so-and-so is typing" would be actively annoying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NotificationKind {
    Message,
    Reaction,
    ContactRequest,
}

fn classify(event_type: &str) -> Option<NotificationKind> {
    match event_type {
        "message" => Some(NotificationKind::Message),
        "reaction:add" => Some(NotificationKind::Reaction),
        "contact-request" => Some(NotificationKind::ContactRequest),
        _ => None,
    }
}

fn enabled_for(settings: &NotificationSettings, kind: NotificationKind) -> bool {
    match kind {
        NotificationKind::Message => settings.messages_enabled,
        NotificationKind::Reaction => settings.reactions_enabled,
        NotificationKind::ContactRequest => settings.contact_requests_enabled,
    }
}

/// Whether `now` (as minutes-since-midnight, local time) falls inside the
/// user's configured quiet-hours window. A window where `start > end` wraps
/// past midnight.
fn within_quiet_hours(settings: &NotificationSettings, minute_of_day: i32) -> bool {
    let (Some(start), Some(end)) = (settings.quiet_hours_start_minute, settings.quiet_hours_end_minute) else {
        return false;
    };
    if start <= end {
        minute_of_day >= start && minute_of_day < end
    } else {
        minute_of_day >= start || minute_of_day < end
    }
}

#[derive(Debug)]
pub enum PushError {
    /// The endpoint itself is permanently gone (404/410): evict it.
    Gone,
    /// Transient failure; retry with backoff.
    Retryable(String),
}

#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn send(&self, subscription: &PushSubscription, payload: &serde_json::Value) -> Result<(), PushError>;
}

/// Production transport: POSTs the payload to the subscription's endpoint,
/// as a Web Push style delivery. The corpus carries `reqwest` for exactly
/// this kind of outbound HTTP call.
pub struct HttpPushTransport {
    client: reqwest::Client,
}

impl HttpPushTransport {
    pub fn new(timeout: StdDuration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client builds with a valid timeout");
        Self { client }
    }
}

#[async_trait]
impl PushTransport for HttpPushTransport {
    async fn send(&self, subscription: &PushSubscription, payload: &serde_json::Value) -> Result<(), PushError> {
        let response = self
            .client
            .post(&subscription.endpoint)
            .header("Authorization", format!("key={}", subscription.key_material))
            .json(payload)
            .send()
            .await
            .map_err(|e| PushError::Retryable(e.to_string()))?;

        match response.status().as_u16() {
            200..=299 => Ok(()),
            404 | 410 => Err(PushError::Gone),
            status => Err(PushError::Retryable(format!("push endpoint returned {status}"))),
        }
    }
}

/// Dev/test transport that never actually calls out, for `MOCK_PUSH=1`
/// environments and unit tests (spec.md §6's mock toggles).
pub struct NoopPushTransport;

#[async_trait]
impl PushTransport for NoopPushTransport {
    async fn send(&self, subscription: &PushSubscription, _payload: &serde_json::Value) -> Result<(), PushError> {
        tracing::debug!(subscription_id = %subscription.id, "noop push transport: skipping send");
        Ok(())
    }
}

pub struct PushDispatcher {
    repository: Arc<dyn Repository>,
    transport: Arc<dyn PushTransport>,
    max_retries: u32,
}

impl PushDispatcher {
    pub fn new(repository: Arc<dyn Repository>, transport: Arc<dyn PushTransport>, max_retries: u32) -> Arc<Self> {
        Arc::new(Self { repository, transport, max_retries })
    }

    async fn send_with_backoff(&self, subscription: &PushSubscription, payload: &serde_json::Value) {
        let mut delay = StdDuration::from_millis(200);
        for attempt in 0..=self.max_retries {
            match self.transport.send(subscription, payload).await {
                Ok(()) => {
                    tracing::info!(
                        subscription_id = %subscription.id,
                        attempt,
                        "push delivery succeeded"
                    );
                    return;
                }
                Err(PushError::Gone) => {
                    tracing::info!(subscription_id = %subscription.id, "push subscription gone, evicting");
                    let _ = self.repository.evict_push_subscription(subscription.id).await;
                    return;
                }
                Err(PushError::Retryable(reason)) => {
                    tracing::warn!(
                        subscription_id = %subscription.id,
                        attempt,
                        reason = %reason,
                        "push delivery attempt failed"
                    );
                    if attempt == self.max_retries {
                        tracing::error!(
                            subscription_id = %subscription.id,
                            "push delivery exhausted retries, giving up"
                        );
                        return;
                    }
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
    }
}

#[async_trait]
impl PushNotifier for PushDispatcher {
    async fn notify_offline(&self, user_id: Uuid, event_type: &str, payload: &serde_json::Value) {
        let Some(kind) = classify(event_type) else {
            return;
        };

        let settings = match self.repository.get_notification_settings(user_id).await {
            Ok(s) => s,
            Err(error) => {
                tracing::warn!(?error, %user_id, "failed to load notification settings, skipping push");
                return;
            }
        };

        if !enabled_for(&settings, kind) {
            return;
        }

        if let Some(conversation_id) = payload.get("conversation_id").and_then(|v| v.as_str()) {
            if let Ok(conversation_id) = conversation_id.parse::<Uuid>() {
                if settings.muted_conversation_ids.contains(&conversation_id) {
                    return;
                }
            }
        }

        let now = Utc::now();
        let minute_of_day = now.hour() as i32 * 60 + now.minute() as i32;
        if within_quiet_hours(&settings, minute_of_day) {
            tracing::debug!(%user_id, "suppressing push during quiet hours");
            return;
        }

        let subscriptions = match self.repository.list_push_subscriptions(user_id).await {
            Ok(subs) => subs,
            Err(error) => {
                tracing::warn!(?error, %user_id, "failed to load push subscriptions");
                return;
            }
        };

        for subscription in subscriptions {
            self.send_with_backoff(&subscription, payload).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::MemoryRepository;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct FlakyTransport {
        fail_times: AtomicUsize,
        calls: Mutex<Vec<Uuid>>,
    }

    #[async_trait]
    impl PushTransport for FlakyTransport {
        async fn send(&self, subscription: &PushSubscription, _payload: &serde_json::Value) -> Result<(), PushError> {
            self.calls.lock().unwrap().push(subscription.id);
            if self.fail_times.load(Ordering::SeqCst) > 0 {
                self.fail_times.fetch_sub(1, Ordering::SeqCst);
                return Err(PushError::Retryable("temporary".into()));
            }
            Ok(())
        }
    }

    struct GoneTransport;

    #[async_trait]
    impl PushTransport for GoneTransport {
        async fn send(&self, _subscription: &PushSubscription, _payload: &serde_json::Value) -> Result<(), PushError> {
            Err(PushError::Gone)
        }
    }

    #[tokio::test]
    async fn retries_then_succeeds_within_backoff_budget() {
        let repo = Arc::new(MemoryRepository::new());
        let user_id = Uuid::new_v4();
        repo.create_push_subscription(user_id, "https://push.example/x", "key", None).await.unwrap();

        let transport = Arc::new(FlakyTransport { fail_times: AtomicUsize::new(2), calls: Mutex::new(Vec::new()) });
        let dispatcher = PushDispatcher::new(repo.clone(), transport.clone(), 5);
        dispatcher
            .notify_offline(user_id, "message", &serde_json::json!({}))
            .await;

        assert_eq!(transport.calls.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn gone_response_evicts_subscription() {
        let repo = Arc::new(MemoryRepository::new());
        let user_id = Uuid::new_v4();
        repo.create_push_subscription(user_id, "https://push.example/x", "key", None).await.unwrap();

        let dispatcher = PushDispatcher::new(repo.clone(), Arc::new(GoneTransport), 3);
        dispatcher
            .notify_offline(user_id, "message", &serde_json::json!({}))
            .await;

        assert!(repo.list_push_subscriptions(user_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn ephemeral_event_types_are_never_pushed() {
        let repo = Arc::new(MemoryRepository::new());
        let user_id = Uuid::new_v4();
        repo.create_push_subscription(user_id, "https://push.example/x", "key", None).await.unwrap();
        let transport = Arc::new(FlakyTransport { fail_times: AtomicUsize::new(0), calls: Mutex::new(Vec::new()) });
        let dispatcher = PushDispatcher::new(repo.clone(), transport.clone(), 3);

        dispatcher.notify_offline(user_id, "typing", &serde_json::json!({})).await;
        assert!(transport.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn muted_conversation_suppresses_push() {
        let repo = Arc::new(MemoryRepository::new());
        let user_id = Uuid::new_v4();
        let conversation_id = Uuid::new_v4();
        repo.create_push_subscription(user_id, "https://push.example/x", "key", None).await.unwrap();
        repo.put_notification_settings(NotificationSettings {
            user_id,
            muted_conversation_ids: vec![conversation_id],
            ..Default::default()
        })
        .await
        .unwrap();

        let transport = Arc::new(FlakyTransport { fail_times: AtomicUsize::new(0), calls: Mutex::new(Vec::new()) });
        let dispatcher = PushDispatcher::new(repo.clone(), transport.clone(), 3);
        dispatcher
            .notify_offline(user_id, "message", &serde_json::json!({ "conversation_id": conversation_id }))
            .await;

        assert!(transport.calls.lock().unwrap().is_empty());
    }
}

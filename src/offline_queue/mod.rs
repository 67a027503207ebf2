//! Offline Queue (component F): a bounded, durable, per-recipient FIFO for
//! events that could not be delivered to any open session.
//!
//! Capacity is enforced per spec.md §4.6's overflow policy: ephemeral events
//! (typing, read receipts, presence pings) are dropped oldest-first to make
//! room, since missing one is harmless; real messages are never dropped —
//! once a recipient's queue is saturated with messages alone, `enqueue`
//! reports backpressure and the caller (the Conversation Router) logs it
//! rather than losing data silently.

use std::sync::Arc;

use uuid::Uuid;

use crate::error::AppResult;
use crate::repository::{QueuedEvent, QueuedEventKind, Repository};

pub struct OfflineQueue {
    repository: Arc<dyn Repository>,
    capacity: usize,
}

impl OfflineQueue {
    pub fn new(repository: Arc<dyn Repository>, capacity: usize) -> Arc<Self> {
        Arc::new(Self { repository, capacity })
    }

    /// Enqueues `event`, applying the overflow policy. Returns `false` (and
    /// enqueues nothing) only when the queue is saturated with durable
    /// messages and cannot make room — true backpressure.
    pub async fn enqueue(&self, event: QueuedEvent) -> AppResult<bool> {
        let (messages, ephemeral) = self.repository.count_offline_events(event.recipient_id).await?;
        let total = messages + ephemeral;

        if total >= self.capacity {
            if ephemeral > 0 {
                self.repository.drop_oldest_ephemeral_event(event.recipient_id).await?;
            } else if event.kind == QueuedEventKind::Ephemeral {
                // No ephemeral entries to evict and the queue is full of
                // messages: dropping this ephemeral event is strictly
                // cheaper than rejecting a real message later.
                tracing::debug!(recipient_id = %event.recipient_id, "offline queue full, dropping ephemeral event");
                return Ok(true);
            } else {
                tracing::warn!(
                    recipient_id = %event.recipient_id,
                    capacity = self.capacity,
                    "offline queue saturated with messages, applying backpressure"
                );
                return Ok(false);
            }
        }

        self.repository.enqueue_offline_event(event).await?;
        Ok(true)
    }

    /// Drains every queued event for `recipient_id`, oldest first, removing
    /// it from durable storage. Called once a session for that user opens.
    pub async fn drain(&self, recipient_id: Uuid) -> AppResult<Vec<QueuedEvent>> {
        let events = self.repository.list_offline_events(recipient_id).await?;
        for event in &events {
            self.repository.remove_offline_event(recipient_id, event.id).await?;
        }
        Ok(events)
    }
}

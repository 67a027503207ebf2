use std::sync::Arc;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::router::SessionSender;

/// Tracks active WebSocket sessions keyed by user ID, a user to possibly
/// many session IDs (spec.md §3: a user may hold several simultaneous
/// Gateway connections — one per device/tab).
///
/// Also tracks each conversation's "live view" — the set of users with at
/// least one session that has explicitly joined that conversation via
/// `join-conversation` (spec.md §4.1) — so `conversation-presence` can be
/// emitted when a participant's live-view membership actually changes.
///
/// Cheaply cloneable — all clones share the same underlying map via `Arc`.
#[derive(Clone, Default)]
pub struct ConnectionManager {
    by_user: Arc<DashMap<Uuid, DashMap<Uuid, mpsc::UnboundedSender<String>>>>,
    /// conversation id -> (user id -> number of this user's sessions that
    /// have joined that conversation's live view).
    conversation_viewers: Arc<DashMap<Uuid, DashMap<Uuid, u32>>>,
    /// session id -> set of conversation ids that session has joined, so a
    /// session teardown can release every view it was holding.
    session_views: Arc<DashMap<Uuid, DashSet<Uuid>>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new session for `user_id`, returning the session id the
    /// caller should use for subsequent `remove` calls.
    pub fn add(&self, user_id: Uuid, tx: mpsc::UnboundedSender<String>) -> Uuid {
        let session_id = Uuid::new_v4();
        self.by_user
            .entry(user_id)
            .or_default()
            .insert(session_id, tx);
        session_id
    }

    /// Removes one session. If it was the user's last session, the empty
    /// per-user map is dropped too.
    pub fn remove(&self, user_id: Uuid, session_id: Uuid) {
        if let Some(sessions) = self.by_user.get(&user_id) {
            sessions.remove(&session_id);
            if sessions.is_empty() {
                drop(sessions);
                self.by_user.remove(&user_id);
            }
        }
    }

    /// Sends a pre-serialized frame to every open session of `user_id`.
    /// Silently ignores a user with no open sessions — the caller decides
    /// whether that means offline-queue or push fallback.
    pub fn send_to_user_raw(&self, user_id: Uuid, message: &str) -> usize {
        let Some(sessions) = self.by_user.get(&user_id) else {
            return 0;
        };
        let mut delivered = 0;
        for session in sessions.iter() {
            if session.value().send(message.to_owned()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    pub fn broadcast_to_users(&self, user_ids: &[Uuid], message: &str) {
        for user_id in user_ids {
            self.send_to_user_raw(*user_id, message);
        }
    }

    pub fn is_connected(&self, user_id: Uuid) -> bool {
        self.by_user.get(&user_id).map(|s| !s.is_empty()).unwrap_or(false)
    }

    pub fn connection_count(&self) -> usize {
        self.by_user.iter().map(|e| e.value().len()).sum()
    }

    /// Records that `session_id` (owned by `user_id`) has joined
    /// `conversation_id`'s live view. Returns `true` iff this is the user's
    /// first session to join it, i.e. the caller should broadcast
    /// `conversation-presence(joined: true)`.
    pub fn join_conversation_view(&self, session_id: Uuid, user_id: Uuid, conversation_id: Uuid) -> bool {
        let joined_new = self
            .session_views
            .entry(session_id)
            .or_insert_with(DashSet::new)
            .insert(conversation_id);
        if !joined_new {
            return false;
        }
        let viewers = self.conversation_viewers.entry(conversation_id).or_default();
        let mut count = viewers.entry(user_id).or_insert(0);
        *count += 1;
        *count == 1
    }

    /// Records that `session_id` has left `conversation_id`'s live view.
    /// Returns `true` iff that was the user's last session viewing it, i.e.
    /// the caller should broadcast `conversation-presence(joined: false)`.
    pub fn leave_conversation_view(&self, session_id: Uuid, user_id: Uuid, conversation_id: Uuid) -> bool {
        let Some(views) = self.session_views.get(&session_id) else {
            return false;
        };
        if !views.remove(&conversation_id).is_some() {
            return false;
        }
        drop(views);
        self.decrement_viewer(conversation_id, user_id)
    }

    /// Releases every conversation view `session_id` was holding (session
    /// teardown). Returns the conversation ids for which `user_id` just lost
    /// its last viewing session, for the caller to broadcast a `left` event.
    pub fn clear_session_views(&self, session_id: Uuid, user_id: Uuid) -> Vec<Uuid> {
        let Some((_, views)) = self.session_views.remove(&session_id) else {
            return Vec::new();
        };
        views
            .into_iter()
            .filter(|conversation_id| self.decrement_viewer(*conversation_id, user_id))
            .collect()
    }

    fn decrement_viewer(&self, conversation_id: Uuid, user_id: Uuid) -> bool {
        let Some(viewers) = self.conversation_viewers.get(&conversation_id) else {
            return false;
        };
        let became_zero = {
            let Some(mut count) = viewers.get_mut(&user_id) else {
                return false;
            };
            if *count == 0 {
                return false;
            }
            *count -= 1;
            *count == 0
        };
        if became_zero {
            viewers.remove(&user_id);
        }
        became_zero
    }
}

/// Bridges the connection table to the Conversation Router's `SessionSender`
/// abstraction, so the router never needs to know about `mpsc` channels or
/// JSON serialization details.
#[async_trait]
impl SessionSender for ConnectionManager {
    async fn send_to_user(&self, user_id: Uuid, frame: serde_json::Value) -> usize {
        let Ok(message) = serde_json::to_string(&frame) else {
            tracing::error!("failed to serialize outbound gateway frame");
            return 0;
        };
        self.send_to_user_raw(user_id, &message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_channel() -> (mpsc::UnboundedSender<String>, mpsc::UnboundedReceiver<String>) {
        mpsc::unbounded_channel()
    }

    #[test]
    fn add_and_is_connected() {
        let mgr = ConnectionManager::new();
        let user = Uuid::new_v4();
        let (tx, _rx) = make_channel();

        assert!(!mgr.is_connected(user));
        mgr.add(user, tx);
        assert!(mgr.is_connected(user));
    }

    #[test]
    fn remove_clears_connection_only_when_last_session_closes() {
        let mgr = ConnectionManager::new();
        let user = Uuid::new_v4();
        let (tx1, _rx1) = make_channel();
        let (tx2, _rx2) = make_channel();

        let session1 = mgr.add(user, tx1);
        let _session2 = mgr.add(user, tx2);
        mgr.remove(user, session1);
        assert!(mgr.is_connected(user));
        assert_eq!(mgr.connection_count(), 1);
    }

    #[tokio::test]
    async fn send_to_user_raw_delivers_to_every_session() {
        let mgr = ConnectionManager::new();
        let user = Uuid::new_v4();
        let (tx1, mut rx1) = make_channel();
        let (tx2, mut rx2) = make_channel();
        mgr.add(user, tx1);
        mgr.add(user, tx2);

        let delivered = mgr.send_to_user_raw(user, "hello");
        assert_eq!(delivered, 2);
        assert_eq!(rx1.recv().await.unwrap(), "hello");
        assert_eq!(rx2.recv().await.unwrap(), "hello");
    }

    #[test]
    fn send_to_disconnected_user_is_noop() {
        let mgr = ConnectionManager::new();
        assert_eq!(mgr.send_to_user_raw(Uuid::new_v4(), "dropped"), 0);
    }

    #[test]
    fn join_conversation_view_reports_only_the_first_viewer() {
        let mgr = ConnectionManager::new();
        let user = Uuid::new_v4();
        let conversation = Uuid::new_v4();
        let session_a = Uuid::new_v4();
        let session_b = Uuid::new_v4();

        assert!(mgr.join_conversation_view(session_a, user, conversation));
        // A second session of the *same* user joining the same conversation
        // is not a fresh live-view arrival.
        assert!(!mgr.join_conversation_view(session_b, user, conversation));
        // Re-joining from a session that already joined is a no-op.
        assert!(!mgr.join_conversation_view(session_a, user, conversation));
    }

    #[test]
    fn leave_conversation_view_reports_only_the_last_leaver() {
        let mgr = ConnectionManager::new();
        let user = Uuid::new_v4();
        let conversation = Uuid::new_v4();
        let session_a = Uuid::new_v4();
        let session_b = Uuid::new_v4();

        mgr.join_conversation_view(session_a, user, conversation);
        mgr.join_conversation_view(session_b, user, conversation);

        assert!(!mgr.leave_conversation_view(session_a, user, conversation));
        assert!(mgr.leave_conversation_view(session_b, user, conversation));
        // Already left; leaving again is a no-op.
        assert!(!mgr.leave_conversation_view(session_b, user, conversation));
    }

    #[test]
    fn clear_session_views_releases_every_joined_conversation() {
        let mgr = ConnectionManager::new();
        let user = Uuid::new_v4();
        let conversation_a = Uuid::new_v4();
        let conversation_b = Uuid::new_v4();
        let session = Uuid::new_v4();

        mgr.join_conversation_view(session, user, conversation_a);
        mgr.join_conversation_view(session, user, conversation_b);

        let mut left = mgr.clear_session_views(session, user);
        left.sort();
        let mut expected = vec![conversation_a, conversation_b];
        expected.sort();
        assert_eq!(left, expected);

        // Already cleared; a second teardown call releases nothing.
        assert!(mgr.clear_session_views(session, user).is_empty());
    }

    #[test]
    fn clone_shares_state() {
        let mgr = ConnectionManager::new();
        let clone = mgr.clone();
        let user = Uuid::new_v4();
        let (tx, _rx) = make_channel();

        mgr.add(user, tx);
        assert!(clone.is_connected(user));
    }
}

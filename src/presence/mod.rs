//! Presence Registry (component B): the single source of truth for which
//! users are connected, across how many sessions, and what status they are
//! broadcasting.
//!
//! A user is "online" while at least one session is open. Closing the last
//! session does not immediately flip a user offline — spec.md §4.2's grace
//! period tolerates the reconnect-on-flaky-network case. An idle user with
//! open sessions but no recent activity is demoted from `Online` to `Away`
//! by a periodic sweep, never by the client asserting it directly.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use uuid::Uuid;

use crate::models::{PresenceKind, PresenceStatus};

/// Notified whenever a user's effective presence changes. Implemented by the
/// Conversation Router, which is responsible for fanning the change out to
/// every observer of that user. Kept as a trait (rather than a direct
/// `Arc<ConversationRouter>` field) so the registry and the router can be
/// constructed independently and wired together once in `AppState::new`.
#[async_trait]
pub trait PresenceObserver: Send + Sync {
    async fn on_presence_changed(&self, user_id: Uuid, status: PresenceStatus);
}

struct UserEntry {
    status: PresenceStatus,
    sessions: Vec<Uuid>,
    last_activity_at: DateTime<Utc>,
    /// Bumped on every session close so a delayed grace-period check can
    /// detect a reconnect that happened in the meantime and no-op.
    generation: u64,
}

pub struct PresenceRegistry {
    users: DashMap<Uuid, UserEntry>,
    away_threshold: StdDuration,
    grace_period: StdDuration,
    observer: OnceCell<Arc<dyn PresenceObserver>>,
}

impl PresenceRegistry {
    pub fn new(away_threshold: StdDuration, grace_period: StdDuration) -> Arc<Self> {
        Arc::new(Self {
            users: DashMap::new(),
            away_threshold,
            grace_period,
            observer: OnceCell::new(),
        })
    }

    /// Wires the fan-out observer. Must be called exactly once during
    /// startup; presence changes before this call are silently un-observed.
    pub fn set_observer(&self, observer: Arc<dyn PresenceObserver>) {
        let _ = self.observer.set(observer);
    }

    fn notify(self: &Arc<Self>, user_id: Uuid, status: PresenceStatus) {
        if let Some(observer) = self.observer.get() {
            let observer = observer.clone();
            tokio::spawn(async move {
                observer.on_presence_changed(user_id, status).await;
            });
        }
    }

    /// Registers a new open session. Returns `true` iff this is the user's
    /// first session (the user just transitioned offline -> online).
    pub fn session_opened(self: &Arc<Self>, user_id: Uuid, session_id: Uuid) -> bool {
        let now = Utc::now();
        let mut went_online = false;

        {
            let mut entry = self.users.entry(user_id).or_insert_with(|| {
                went_online = true;
                UserEntry {
                    status: PresenceStatus::online(),
                    sessions: Vec::new(),
                    last_activity_at: now,
                    generation: 0,
                }
            });
            if !entry.sessions.contains(&session_id) {
                entry.sessions.push(session_id);
            }
            entry.last_activity_at = now;
            if entry.status.kind == PresenceKind::Offline {
                entry.status = PresenceStatus::online();
                went_online = true;
            }
        }

        if went_online {
            self.notify(user_id, PresenceStatus::online());
        }
        went_online
    }

    /// Deregisters a closed session. If it was the last session, schedules a
    /// grace-period timer rather than flipping offline immediately.
    pub fn session_closed(self: &Arc<Self>, user_id: Uuid, session_id: Uuid) {
        let (should_schedule_grace, generation) = {
            let Some(mut entry) = self.users.get_mut(&user_id) else {
                return;
            };
            entry.sessions.retain(|id| *id != session_id);
            if entry.sessions.is_empty() {
                entry.generation += 1;
                (true, entry.generation)
            } else {
                (false, entry.generation)
            }
        };

        if !should_schedule_grace {
            return;
        }

        let registry = self.clone();
        let grace_period = self.grace_period;
        tokio::spawn(async move {
            tokio::time::sleep(grace_period).await;
            registry.expire_if_still_empty(user_id, generation);
        });
    }

    fn expire_if_still_empty(self: &Arc<Self>, user_id: Uuid, generation: u64) {
        let became_offline = {
            let Some(mut entry) = self.users.get_mut(&user_id) else {
                return;
            };
            if entry.generation != generation || !entry.sessions.is_empty() {
                return;
            }
            entry.status = PresenceStatus::offline();
            true
        };
        if became_offline {
            self.notify(user_id, PresenceStatus::offline());
        }
    }

    /// Sets an explicit status (`online`, `busy`, or `custom`). Rejected
    /// silently for a user with no open sessions — a disconnected client has
    /// no standing to broadcast presence. `away` is never set through this
    /// path; it is inferred only by the idle sweep.
    pub fn set_status(
        self: &Arc<Self>,
        user_id: Uuid,
        kind: PresenceKind,
        custom_message: Option<String>,
        custom_emoji: Option<String>,
    ) {
        if kind == PresenceKind::Away {
            return;
        }
        let changed = {
            let Some(mut entry) = self.users.get_mut(&user_id) else {
                return;
            };
            if entry.sessions.is_empty() {
                return;
            }
            entry.status = PresenceStatus {
                kind,
                custom_message,
                custom_emoji,
            };
            entry.last_activity_at = Utc::now();
            entry.status.clone()
        };
        self.notify(user_id, changed);
    }

    /// Records client activity, resetting the idle clock that would
    /// otherwise demote the user to `Away`. If the user had been demoted to
    /// `Away` by the idle sweep, this activity restores `Online` and emits
    /// one presence-change (spec.md §4.2: "the next activity restores
    /// online").
    pub fn touch(self: &Arc<Self>, user_id: Uuid) {
        let restored = {
            let Some(mut entry) = self.users.get_mut(&user_id) else {
                return;
            };
            entry.last_activity_at = Utc::now();
            if entry.status.kind == PresenceKind::Away && !entry.sessions.is_empty() {
                entry.status = PresenceStatus::online();
                Some(entry.status.clone())
            } else {
                None
            }
        };
        if let Some(status) = restored {
            self.notify(user_id, status);
        }
    }

    pub fn snapshot(&self, user_id: Uuid) -> PresenceStatus {
        self.users
            .get(&user_id)
            .map(|e| e.status.clone())
            .unwrap_or_else(PresenceStatus::offline)
    }

    pub fn is_online(&self, user_id: Uuid) -> bool {
        self.users
            .get(&user_id)
            .map(|e| !e.sessions.is_empty())
            .unwrap_or(false)
    }

    /// Spawns the periodic idle sweep that demotes `Online` users who have
    /// been inactive past `away_threshold` to `Away`. Runs for the lifetime
    /// of the process; there is deliberately no handle to stop it, since the
    /// registry itself is process-lifetime state.
    pub fn spawn_away_sweeper(self: &Arc<Self>) {
        let registry = self.clone();
        let interval = (self.away_threshold / 2).max(StdDuration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                registry.sweep_away();
            }
        });
    }

    fn sweep_away(self: &Arc<Self>) {
        let now = Utc::now();
        let threshold = chrono::Duration::from_std(self.away_threshold).unwrap_or_default();
        let mut newly_away = Vec::new();

        for mut entry in self.users.iter_mut() {
            if entry.status.kind != PresenceKind::Online {
                continue;
            }
            if entry.sessions.is_empty() {
                continue;
            }
            if now - entry.last_activity_at >= threshold {
                entry.status = PresenceStatus {
                    kind: PresenceKind::Away,
                    custom_message: None,
                    custom_emoji: None,
                };
                newly_away.push(*entry.key());
            }
        }

        for user_id in newly_away {
            self.notify(user_id, PresenceStatus {
                kind: PresenceKind::Away,
                custom_message: None,
                custom_emoji: None,
            });
        }
    }
}

//! Ephemeral Signal Pipeline (component E): typing indicators, read
//! receipts, presence pings, and reaction bursts are frequent, lossy-
//! tolerant signals that would otherwise flood the Conversation Router.
//! Each kind is reduced through its own timer-driven policy — debounce,
//! throttle, or batch — rather than a sleep loop, matching spec.md §4.5's
//! literal per-kind windows and its warning against busy-polling.
//!
//! None of this persists: a dropped or coalesced ephemeral signal is by
//! definition acceptable, unlike a message (component F/D territory).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};

use dashmap::DashMap;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use crate::router::{ConversationRouter, RoutedEvent};

#[derive(Default, PartialEq, Eq, Clone, Copy)]
enum TypingPhase {
    #[default]
    Idle,
    /// A typing-on signal arrived but the debounce window hasn't elapsed
    /// yet, so nothing has been sent to observers.
    Pending,
    /// The debounce window elapsed with no cancellation; observers have
    /// been told the user is typing.
    Started,
}

#[derive(Default)]
struct TypingState {
    generation: u64,
    phase: TypingPhase,
}

struct ThrottleState {
    last_fired_at: Instant,
    pending: Option<serde_json::Value>,
    flush_scheduled: bool,
}

/// Which reaction op a batched entry represents. Tracked per message id so a
/// batch window spanning both adds and removes for different messages still
/// emits the right event for each, rather than collapsing everything to one
/// hard-coded kind (spec.md §4.1's `reaction:add` / `reaction:remove`).
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum ReactionKind {
    Add,
    Remove,
}

impl ReactionKind {
    fn event_type(self) -> &'static str {
        match self {
            ReactionKind::Add => "reaction:add",
            ReactionKind::Remove => "reaction:remove",
        }
    }
}

struct ReactionBatch {
    entries: HashMap<Uuid, (ReactionKind, serde_json::Value)>,
    flush_scheduled: bool,
}

pub struct EphemeralPipeline {
    router: Arc<ConversationRouter>,
    typing_debounce: StdDuration,
    read_receipt_throttle: StdDuration,
    reaction_batch_window: StdDuration,

    typing_states: DashMap<(Uuid, Uuid), TypingState>,
    read_receipt_states: DashMap<(Uuid, Uuid), Arc<AsyncMutex<ThrottleState>>>,
    reaction_batches: DashMap<Uuid, Arc<AsyncMutex<ReactionBatch>>>,
}

impl EphemeralPipeline {
    pub fn new(
        router: Arc<ConversationRouter>,
        typing_debounce: StdDuration,
        read_receipt_throttle: StdDuration,
        reaction_batch_window: StdDuration,
    ) -> Arc<Self> {
        Arc::new(Self {
            router,
            typing_debounce,
            read_receipt_throttle,
            reaction_batch_window,
            typing_states: DashMap::new(),
            read_receipt_states: DashMap::new(),
            reaction_batches: DashMap::new(),
        })
    }

    /// Trailing debounce (spec.md §4.5: "typing on | debounce trailing |
    /// 300 ms"): a typing-on signal is never sent immediately. It arms a
    /// `typing_debounce`-long timer; only if nothing cancels the timer — no
    /// `typing-off`, no message, no further `typing-on` restarting it — does
    /// `typing` actually reach observers, once, at the end of the window.
    /// This is what makes S3 hold structurally rather than by timing luck:
    /// a message sent 100 ms after a 300 ms-debounced `typing-on` arrives
    /// before the timer ever fires, so nothing was ever sent to suppress.
    pub fn signal_typing_on(self: &Arc<Self>, conversation_id: Uuid, user_id: Uuid) {
        let key = (conversation_id, user_id);
        let generation = {
            let mut entry = self.typing_states.entry(key).or_default();
            entry.generation += 1;
            if entry.phase == TypingPhase::Idle {
                entry.phase = TypingPhase::Pending;
            }
            entry.generation
        };

        let pipeline = self.clone();
        let window = self.typing_debounce;
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let should_start = {
                let Some(mut entry) = pipeline.typing_states.get_mut(&key) else {
                    return;
                };
                if entry.generation != generation || entry.phase != TypingPhase::Pending {
                    // Superseded by a newer signal, a cancellation, or
                    // already started by a previous firing of this timer.
                    false
                } else {
                    entry.phase = TypingPhase::Started;
                    true
                }
            };
            if should_start {
                let payload = serde_json::json!({
                    "op": "dispatch", "t": "typing",
                    "d": { "conversation_id": conversation_id, "user_id": user_id },
                });
                pipeline.dispatch_ephemeral(conversation_id, "typing", payload, Some(user_id));
                pipeline.arm_idle_stop(conversation_id, user_id, key, generation);
            }
        });
    }

    /// Typing-off policy (§4.5: "immediate but coalesced with any pending
    /// on"): if the debounce timer hasn't fired yet, it is cancelled and
    /// neither `typing` nor `typing-stopped` is ever sent. If `typing` was
    /// already sent, `typing-stopped` fires right away.
    pub fn signal_typing_off(self: &Arc<Self>, conversation_id: Uuid, user_id: Uuid) {
        self.cancel_typing(conversation_id, user_id);
    }

    /// Suppresses a pending or active typing indicator because the same
    /// session produced a real event that makes it redundant (§4.5: "if
    /// typing-on is followed by a user message within the debounce window,
    /// the typing signal is suppressed"). Called both for an explicit
    /// `typing(off)` and from message handling.
    pub fn cancel_typing(self: &Arc<Self>, conversation_id: Uuid, user_id: Uuid) {
        let key = (conversation_id, user_id);
        let was_started = {
            let Some(mut entry) = self.typing_states.get_mut(&key) else {
                return;
            };
            entry.generation += 1;
            let was_started = entry.phase == TypingPhase::Started;
            entry.phase = TypingPhase::Idle;
            was_started
        };

        if was_started {
            let payload = serde_json::json!({
                "op": "dispatch", "t": "typing-stopped",
                "d": { "conversation_id": conversation_id, "user_id": user_id },
            });
            self.dispatch_ephemeral(conversation_id, "typing-stopped", payload, Some(user_id));
        }
    }

    /// Once `typing` has actually fired, auto-stops the indicator after a
    /// further debounce-length quiet period with no renewed typing-on — a
    /// session that stops sending signals entirely (rather than an explicit
    /// `typing(off)`) must not leave recipients staring at a stuck
    /// indicator forever.
    fn arm_idle_stop(self: &Arc<Self>, conversation_id: Uuid, user_id: Uuid, key: (Uuid, Uuid), generation: u64) {
        let pipeline = self.clone();
        let window = self.typing_debounce;
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let should_stop = {
                let Some(mut entry) = pipeline.typing_states.get_mut(&key) else {
                    return;
                };
                if entry.generation != generation || entry.phase != TypingPhase::Started {
                    false
                } else {
                    entry.phase = TypingPhase::Idle;
                    true
                }
            };
            if should_stop {
                let payload = serde_json::json!({
                    "op": "dispatch", "t": "typing-stopped",
                    "d": { "conversation_id": conversation_id, "user_id": user_id },
                });
                pipeline.dispatch_ephemeral(conversation_id, "typing-stopped", payload, Some(user_id));
            }
        });
    }

    /// Leading-edge throttle: the first read-receipt signal in a window
    /// fires immediately; any signal arriving before `read_receipt_throttle`
    /// elapses is coalesced into a single trailing flush carrying the
    /// latest watermark, so a rapid scroll emits at most two events.
    pub fn signal_read_receipt(
        self: &Arc<Self>,
        conversation_id: Uuid,
        user_id: Uuid,
        watermark: chrono::DateTime<chrono::Utc>,
    ) {
        let key = (conversation_id, user_id);
        let payload = serde_json::json!({
            "op": "dispatch", "t": "message-read",
            "d": { "conversation_id": conversation_id, "reader_id": user_id, "watermark": watermark },
        });

        let window = self.read_receipt_throttle;
        let state_lock = self
            .read_receipt_states
            .entry(key)
            .or_insert_with(|| {
                Arc::new(AsyncMutex::new(ThrottleState {
                    last_fired_at: Instant::now() - window,
                    pending: None,
                    flush_scheduled: false,
                }))
            })
            .clone();

        let pipeline = self.clone();
        tokio::spawn(async move {
            let mut state = state_lock.lock().await;
            let elapsed = state.last_fired_at.elapsed();

            if elapsed >= window {
                state.last_fired_at = Instant::now();
                drop(state);
                pipeline.dispatch_ephemeral(conversation_id, "message-read", payload, Some(user_id));
                return;
            }

            state.pending = Some(payload);
            if state.flush_scheduled {
                return;
            }
            state.flush_scheduled = true;
            let remaining = window - elapsed;
            drop(state);

            let pipeline = pipeline.clone();
            let state_lock = pipeline
                .read_receipt_states
                .get(&key)
                .map(|e| e.clone())
                .expect("entry inserted above");
            tokio::spawn(async move {
                tokio::time::sleep(remaining).await;
                let mut state = state_lock.lock().await;
                state.flush_scheduled = false;
                state.last_fired_at = Instant::now();
                if let Some(pending) = state.pending.take() {
                    drop(state);
                    pipeline.dispatch_ephemeral(conversation_id, "message-read", pending, Some(user_id));
                }
            });
        });
    }

    /// Batches rapid reaction add/remove bursts for the same conversation
    /// into at most two outbound frames per `reaction_batch_window` (one per
    /// kind actually seen), carrying only the latest payload for each
    /// message touched in the window. A message's last-seen kind wins if
    /// both an add and a remove for it land in the same window, matching
    /// toggle idempotency (spec.md §3's Reaction lifecycle).
    pub fn signal_reaction(
        self: &Arc<Self>,
        conversation_id: Uuid,
        message_id: Uuid,
        kind: ReactionKind,
        payload: serde_json::Value,
    ) {
        let window = self.reaction_batch_window;
        let batch_lock = self
            .reaction_batches
            .entry(conversation_id)
            .or_insert_with(|| Arc::new(AsyncMutex::new(ReactionBatch { entries: HashMap::new(), flush_scheduled: false })))
            .clone();

        let pipeline = self.clone();
        tokio::spawn(async move {
            let mut batch = batch_lock.lock().await;
            batch.entries.insert(message_id, (kind, payload));
            if batch.flush_scheduled {
                return;
            }
            batch.flush_scheduled = true;
            drop(batch);

            tokio::time::sleep(window).await;

            let mut batch = batch_lock.lock().await;
            batch.flush_scheduled = false;
            let entries = std::mem::take(&mut batch.entries);
            drop(batch);

            if entries.is_empty() {
                return;
            }

            let mut by_kind: HashMap<&'static str, HashMap<Uuid, serde_json::Value>> = HashMap::new();
            for (message_id, (kind, payload)) in entries {
                by_kind.entry(kind.event_type()).or_default().insert(message_id, payload);
            }

            for (event_type, updates) in by_kind {
                let payload = serde_json::json!({
                    "op": "dispatch", "t": event_type,
                    "d": { "conversation_id": conversation_id, "updates": updates },
                });
                pipeline.dispatch_ephemeral(conversation_id, event_type, payload, None);
            }
        });
    }

    fn dispatch_ephemeral(
        self: &Arc<Self>,
        conversation_id: Uuid,
        event_type: &'static str,
        payload: serde_json::Value,
        exclude: Option<Uuid>,
    ) {
        let router = self.router.clone();
        tokio::spawn(async move {
            let _ = router
                .dispatch(
                    conversation_id,
                    RoutedEvent { event_type, payload, message_id: None, exclude },
                )
                .await;
        });
    }
}

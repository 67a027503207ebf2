//! The shared-cache / pub-sub collaborator (spec.md §9's cache abstraction).
//!
//! Presence snapshots and conversation-membership lookups go through this
//! trait so a single process can run against an in-memory fake, and a fleet
//! of processes can share state across instances. The corpus carries no
//! dedicated cache crate, so `PgSharedCache` reuses the same Postgres
//! connection already required for the repository: a TTL'd key/value table
//! for `get`/`set`/`delete`, and `LISTEN`/`NOTIFY` for `publish`/`subscribe`.

pub mod memory_cache;
pub mod pg_cache;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::AppResult;

pub use memory_cache::MemorySharedCache;
pub use pg_cache::PgSharedCache;

#[async_trait]
pub trait SharedCache: Send + Sync {
    async fn get(&self, key: &str) -> AppResult<Option<String>>;
    async fn set(&self, key: &str, value: &str, ttl: std::time::Duration) -> AppResult<()>;
    async fn delete(&self, key: &str) -> AppResult<()>;

    /// Publish `payload` on `channel`. Best-effort: a channel with no
    /// current subscribers simply drops the message (spec.md §9).
    async fn publish(&self, channel: &str, payload: &str) -> AppResult<()>;

    /// Subscribe to `channel`. The returned receiver observes only messages
    /// published after the call returns.
    async fn subscribe(&self, channel: &str) -> AppResult<broadcast::Receiver<String>>;
}

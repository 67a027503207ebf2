//! Postgres-backed `SharedCache`: a TTL'd row store for `get`/`set`/`delete`
//! and `LISTEN`/`NOTIFY` for `publish`/`subscribe`, so every process in a
//! fleet shares the same presence/membership view without a dedicated
//! cache dependency the corpus does not otherwise use.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::sync::broadcast;

use super::SharedCache;
use crate::error::AppResult;

const CHANNEL_CAPACITY: usize = 256;
/// Postgres NOTIFY payloads are capped at 8000 bytes; callers publishing
/// larger payloads should store them via `set` and publish only a reference.
const NOTIFY_CHANNEL_PREFIX: &str = "chat_core_";

pub struct PgSharedCache {
    pool: PgPool,
    channels: Arc<DashMap<String, broadcast::Sender<String>>>,
}

impl PgSharedCache {
    /// Opens a dedicated `LISTEN` connection and fans every notification out
    /// to the per-channel broadcast senders. Must be called once at startup;
    /// the returned cache can then be cloned freely.
    pub async fn connect(pool: PgPool) -> AppResult<Self> {
        let channels: Arc<DashMap<String, broadcast::Sender<String>>> = Arc::new(DashMap::new());
        let mut listener = PgListener::connect_with(&pool).await?;
        listener.listen(&format!("{NOTIFY_CHANNEL_PREFIX}bus")).await?;

        let fanout = channels.clone();
        tokio::spawn(async move {
            loop {
                match listener.recv().await {
                    Ok(notification) => {
                        let payload = notification.payload();
                        if let Some((channel, body)) = payload.split_once('\u{1}') {
                            if let Some(sender) = fanout.get(channel) {
                                let _ = sender.send(body.to_owned());
                            }
                        }
                    }
                    Err(error) => {
                        tracing::warn!(?error, "shared cache listener disconnected, retrying");
                        if listener.connect().await.is_ok() {
                            let _ = listener.listen(&format!("{NOTIFY_CHANNEL_PREFIX}bus")).await;
                        } else {
                            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                        }
                    }
                }
            }
        });

        Ok(Self { pool, channels })
    }

    fn channel(&self, name: &str) -> broadcast::Sender<String> {
        self.channels
            .entry(name.to_owned())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl SharedCache for PgSharedCache {
    async fn get(&self, key: &str) -> AppResult<Option<String>> {
        let value = sqlx::query_scalar::<_, String>(
            "SELECT value FROM shared_cache_entries WHERE key = $1 AND expires_at > NOW()",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: std::time::Duration) -> AppResult<()> {
        let expires_at = Utc::now()
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(0));
        sqlx::query(
            "INSERT INTO shared_cache_entries (key, value, expires_at)
             VALUES ($1, $2, $3)
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at",
        )
        .bind(key)
        .bind(value)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> AppResult<()> {
        sqlx::query("DELETE FROM shared_cache_entries WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> AppResult<()> {
        let framed = format!("{channel}\u{1}{payload}");
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(format!("{NOTIFY_CHANNEL_PREFIX}bus"))
            .bind(framed)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> AppResult<broadcast::Receiver<String>> {
        Ok(self.channel(channel).subscribe())
    }
}

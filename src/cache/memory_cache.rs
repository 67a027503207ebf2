//! In-process shared-cache fake: a `dashmap` keyed store plus a
//! `tokio::sync::broadcast` channel per topic. Selected when `CACHE_URL` is
//! unset (spec.md §6's mock-cache dev toggle) and by every unit/scenario test
//! that does not need cross-process fan-out.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::broadcast;

use super::SharedCache;
use crate::error::AppResult;

const CHANNEL_CAPACITY: usize = 256;

struct Entry {
    value: String,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct MemorySharedCache {
    store: DashMap<String, Entry>,
    channels: DashMap<String, broadcast::Sender<String>>,
}

impl MemorySharedCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn channel(&self, name: &str) -> broadcast::Sender<String> {
        self.channels
            .entry(name.to_owned())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl SharedCache for MemorySharedCache {
    async fn get(&self, key: &str) -> AppResult<Option<String>> {
        let Some(entry) = self.store.get(key) else {
            return Ok(None);
        };
        if entry.expires_at <= Utc::now() {
            drop(entry);
            self.store.remove(key);
            return Ok(None);
        }
        Ok(Some(entry.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: std::time::Duration) -> AppResult<()> {
        let expires_at = Utc::now()
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(0));
        self.store.insert(
            key.to_owned(),
            Entry {
                value: value.to_owned(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> AppResult<()> {
        self.store.remove(key);
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> AppResult<()> {
        // No subscribers is not an error; `send` failing just means nobody is listening.
        let _ = self.channel(channel).send(payload.to_owned());
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> AppResult<broadcast::Receiver<String>> {
        Ok(self.channel(channel).subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let cache = MemorySharedCache::new();
        cache.set("k", "v", Duration::from_secs(60)).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some("v".to_string()));
    }

    #[tokio::test]
    async fn expired_entry_reads_as_absent() {
        let cache = MemorySharedCache::new();
        cache.set("k", "v", Duration::from_millis(0)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(cache.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let cache = MemorySharedCache::new();
        let mut rx = cache.subscribe("topic").await.unwrap();
        cache.publish("topic", "hello").await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), "hello");
    }
}

// =============================================================================
// Durable key/value persistence with in-memory fallback
// =============================================================================

mod memory;
mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

use crate::errors::StoreError;
use async_trait::async_trait;
use std::time::Duration;

pub const TTL_AUCTION: Duration = Duration::from_secs(60 * 60);
pub const TTL_COOKIES: Duration = Duration::from_secs(24 * 60 * 60);
pub const TTL_BID_HISTORY: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreHealth {
    Healthy,
    Degraded,
    Down,
}

pub fn auction_key(id: &str) -> String {
    format!("auction:{id}")
}

pub fn bid_history_key(id: &str) -> String {
    format!("bid_history:{id}")
}

pub const COOKIES_KEY: &str = "auth:cookies";
pub const SETTINGS_KEY: &str = "settings";
pub const SYSTEM_STATE_KEY: &str = "system:state";

#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), StoreError>;
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
    /// Appends `value` to a sorted collection keyed by `key`, ordered by
    /// `score` (typically a millisecond timestamp), trimming to the most
    /// recent `cap` entries.
    async fn append_sorted(
        &self,
        key: &str,
        score: i64,
        value: Vec<u8>,
        cap: usize,
    ) -> Result<(), StoreError>;
    async fn list_sorted(&self, key: &str) -> Result<Vec<Vec<u8>>, StoreError>;
    fn health(&self) -> StoreHealth;
}

/// Tries the backing store first; on any transport error falls through to
/// the in-memory store and reports `Degraded`. Mirrors the teacher's
/// `warn!`-then-continue style rather than propagating the error upward.
pub struct LayeredStore {
    backing: Option<RedisStore>,
    fallback: MemoryStore,
    degraded: std::sync::atomic::AtomicBool,
}

impl LayeredStore {
    pub async fn connect(store_url: Option<&str>) -> Self {
        let backing = match store_url {
            Some(url) => match RedisStore::connect(url).await {
                Ok(store) => Some(store),
                Err(e) => {
                    tracing::warn!(error = %e, "backing store unavailable at startup, using memory fallback");
                    None
                }
            },
            None => {
                tracing::info!("no STORE_URL configured, using memory-only store");
                None
            }
        };
        Self {
            degraded: std::sync::atomic::AtomicBool::new(backing.is_none()),
            backing,
            fallback: MemoryStore::new(),
        }
    }
}

#[async_trait]
impl Store for LayeredStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        if let Some(backing) = &self.backing {
            match backing.get(key).await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    tracing::warn!(error = %e, key, "store get failed, falling back to memory");
                    self.degraded.store(true, std::sync::atomic::Ordering::Relaxed);
                }
            }
        }
        self.fallback.get(key).await
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), StoreError> {
        let mut ok = false;
        if let Some(backing) = &self.backing {
            match backing.set(key, value.clone(), ttl).await {
                Ok(()) => ok = true,
                Err(e) => {
                    tracing::warn!(error = %e, key, "store set failed, falling back to memory");
                    self.degraded.store(true, std::sync::atomic::Ordering::Relaxed);
                }
            }
        }
        self.fallback.set(key, value, ttl).await?;
        if ok {
            self.degraded.store(false, std::sync::atomic::Ordering::Relaxed);
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        if let Some(backing) = &self.backing {
            let _ = backing.delete(key).await;
        }
        self.fallback.delete(key).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        if let Some(backing) = &self.backing {
            if let Ok(keys) = backing.list(prefix).await {
                return Ok(keys);
            }
        }
        self.fallback.list(prefix).await
    }

    async fn append_sorted(
        &self,
        key: &str,
        score: i64,
        value: Vec<u8>,
        cap: usize,
    ) -> Result<(), StoreError> {
        if let Some(backing) = &self.backing {
            if backing
                .append_sorted(key, score, value.clone(), cap)
                .await
                .is_ok()
            {
                return self.fallback.append_sorted(key, score, value, cap).await.or(Ok(()));
            }
        }
        self.fallback.append_sorted(key, score, value, cap).await
    }

    async fn list_sorted(&self, key: &str) -> Result<Vec<Vec<u8>>, StoreError> {
        if let Some(backing) = &self.backing {
            if let Ok(values) = backing.list_sorted(key).await {
                return Ok(values);
            }
        }
        self.fallback.list_sorted(key).await
    }

    fn health(&self) -> StoreHealth {
        if self.backing.is_none() || self.degraded.load(std::sync::atomic::Ordering::Relaxed) {
            StoreHealth::Degraded
        } else {
            StoreHealth::Healthy
        }
    }
}

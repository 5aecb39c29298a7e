use super::{Store, StoreHealth};
use crate::errors::StoreError;
use async_trait::async_trait;
use dashmap::DashMap;
use std::time::{Duration, Instant};

struct Entry {
    value: Vec<u8>,
    expires_at: Instant,
}

/// In-memory fallback store. TTLs are checked lazily on read, and a
/// background sweep (started by `spawn_sweeper`) evicts expired entries
/// periodically — the same periodic-ticker-over-a-shared-map shape the
/// teacher uses for its exit monitors.
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
    sorted: DashMap<String, Vec<(i64, Vec<u8>)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            sorted: DashMap::new(),
        }
    }

    /// Spawns a background task that periodically evicts expired entries.
    /// Returns a `JoinHandle` the caller should track for shutdown.
    pub fn spawn_sweeper(self: std::sync::Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            loop {
                interval.tick().await;
                let now = Instant::now();
                self.entries.retain(|_, e| e.expires_at > now);
            }
        })
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        match self.entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Ok(Some(entry.value.clone())),
            Some(_) => {
                self.entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), StoreError> {
        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let now = Instant::now();
        Ok(self
            .entries
            .iter()
            .filter(|e| e.expires_at > now && e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect())
    }

    async fn append_sorted(
        &self,
        key: &str,
        score: i64,
        value: Vec<u8>,
        cap: usize,
    ) -> Result<(), StoreError> {
        let mut list = self.sorted.entry(key.to_string()).or_default();
        list.push((score, value));
        list.sort_by_key(|(s, _)| *s);
        if list.len() > cap {
            let drop_count = list.len() - cap;
            list.drain(0..drop_count);
        }
        Ok(())
    }

    async fn list_sorted(&self, key: &str) -> Result<Vec<Vec<u8>>, StoreError> {
        Ok(self
            .sorted
            .get(key)
            .map(|l| l.iter().map(|(_, v)| v.clone()).collect())
            .unwrap_or_default())
    }

    fn health(&self) -> StoreHealth {
        StoreHealth::Degraded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let store = MemoryStore::new();
        store
            .set("auction:1", b"hello".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(store.get("auction:1").await.unwrap(), Some(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn expired_entry_returns_none() {
        let store = MemoryStore::new();
        store
            .set("auction:1", b"hello".to_vec(), Duration::from_millis(0))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(store.get("auction:1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn append_sorted_caps_and_orders() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store
                .append_sorted("bid_history:1", i, format!("v{i}").into_bytes(), 3)
                .await
                .unwrap();
        }
        let values = store.list_sorted("bid_history:1").await.unwrap();
        assert_eq!(values.len(), 3);
        assert_eq!(values[0], b"v2".to_vec());
        assert_eq!(values[2], b"v4".to_vec());
    }

    #[tokio::test]
    async fn list_filters_by_prefix() {
        let store = MemoryStore::new();
        store.set("auction:1", b"a".to_vec(), Duration::from_secs(60)).await.unwrap();
        store.set("settings", b"b".to_vec(), Duration::from_secs(60)).await.unwrap();
        let keys = store.list("auction:").await.unwrap();
        assert_eq!(keys, vec!["auction:1".to_string()]);
    }
}

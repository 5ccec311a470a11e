use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::error::AppResult;

/// Namespaced key/value store with TTL.
///
/// Consistency is best-effort: concurrent writers may race, and callers must
/// tolerate stale reads within a TTL.
#[async_trait::async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, namespace: &str, key: &str) -> AppResult<Option<String>>;

    async fn set(&self, namespace: &str, key: &str, value: String, ttl_secs: u64) -> AppResult<()>;

    async fn delete(&self, namespace: &str, key: &str) -> AppResult<()>;

    /// Removes every key in `namespace`, returning how many were removed
    async fn clear_namespace(&self, namespace: &str) -> AppResult<u64>;

    /// Increments a counter, creating it with `ttl_secs` when absent
    async fn increment(&self, namespace: &str, key: &str, ttl_secs: u64) -> AppResult<u64>;

    /// Backend name for logging
    fn name(&self) -> &'static str;
}

/// Fully qualified storage key
pub fn storage_key(namespace: &str, key: &str) -> String {
    format!("{}:{}", namespace, key)
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: String,
    expires_at: Instant,
}

impl MemoryEntry {
    fn is_live(&self) -> bool {
        self.expires_at > Instant::now()
    }
}

/// Process-local store used when no redis URL is configured, and in tests
#[derive(Clone, Default)]
pub struct MemoryStore {
    entries: Arc<RwLock<HashMap<String, MemoryEntry>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries
    pub async fn len(&self) -> usize {
        self.entries.read().await.values().filter(|e| e.is_live()).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn expiry(ttl_secs: u64) -> Instant {
        Instant::now() + Duration::from_secs(ttl_secs)
    }
}

#[async_trait::async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, namespace: &str, key: &str) -> AppResult<Option<String>> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(&storage_key(namespace, key))
            .filter(|entry| entry.is_live())
            .map(|entry| entry.value.clone()))
    }

    async fn set(&self, namespace: &str, key: &str, value: String, ttl_secs: u64) -> AppResult<()> {
        let mut entries = self.entries.write().await;
        entries.insert(
            storage_key(namespace, key),
            MemoryEntry {
                value,
                expires_at: Self::expiry(ttl_secs),
            },
        );
        Ok(())
    }

    async fn delete(&self, namespace: &str, key: &str) -> AppResult<()> {
        self.entries.write().await.remove(&storage_key(namespace, key));
        Ok(())
    }

    async fn clear_namespace(&self, namespace: &str) -> AppResult<u64> {
        let prefix = storage_key(namespace, "");
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(&prefix));
        Ok((before - entries.len()) as u64)
    }

    async fn increment(&self, namespace: &str, key: &str, ttl_secs: u64) -> AppResult<u64> {
        let mut entries = self.entries.write().await;
        let full_key = storage_key(namespace, key);

        let current = entries
            .get(&full_key)
            .filter(|entry| entry.is_live())
            .map(|entry| (entry.value.parse::<u64>().unwrap_or(0), entry.expires_at));

        let (count, expires_at) = match current {
            Some((count, expires_at)) => (count + 1, expires_at),
            None => (1, Self::expiry(ttl_secs)),
        };

        entries.insert(
            full_key,
            MemoryEntry {
                value: count.to_string(),
                expires_at,
            },
        );
        Ok(count)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

use redis::AsyncCommands;
use redis::Client;
use tokio::sync::mpsc;

use crate::db::store::{storage_key, CacheStore};
use crate::error::{AppError, AppResult};

/// Creates a Redis client for caching
pub fn create_redis_client(redis_url: &str) -> anyhow::Result<Client> {
    let client = Client::open(redis_url)?;
    Ok(client)
}

/// Message for asynchronous cache writes
struct CacheWriteMessage {
    key: String,
    value: String,
    ttl: u64,
}

/// Redis-backed `CacheStore`.
///
/// Reads go straight to Redis. Writes are handed to a background task over a
/// channel so a slow or unavailable Redis never adds latency to a response.
#[derive(Clone)]
pub struct RedisStore {
    redis_client: Client,
    write_tx: mpsc::UnboundedSender<CacheWriteMessage>,
}

/// Handle for gracefully shutting down the cache writer
pub struct CacheWriterHandle {
    shutdown_tx: mpsc::Sender<()>,
}

impl CacheWriterHandle {
    /// Signals the writer task to flush pending writes and stop
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
        tracing::info!("Cache writer shutdown signal sent");
    }
}

impl RedisStore {
    /// Creates the store and spawns its background writer task
    pub fn new(redis_client: Client) -> (Self, CacheWriterHandle) {
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let client = redis_client.clone();
        tokio::spawn(async move {
            Self::cache_writer_task(client, write_rx, shutdown_rx).await;
        });

        (
            Self {
                redis_client,
                write_tx,
            },
            CacheWriterHandle { shutdown_tx },
        )
    }

    async fn cache_writer_task(
        client: Client,
        mut write_rx: mpsc::UnboundedReceiver<CacheWriteMessage>,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) {
        tracing::info!("Cache writer task started");

        loop {
            tokio::select! {
                Some(msg) = write_rx.recv() => {
                    if let Err(e) = Self::write_to_redis(&client, msg).await {
                        tracing::warn!(error = %e, "Failed to write to Redis cache");
                    }
                }
                _ = shutdown_rx.recv() => {
                    // Drain without waiting on senders that are still alive
                    write_rx.close();
                    let mut flushed = 0usize;
                    while let Some(msg) = write_rx.recv().await {
                        if let Err(e) = Self::write_to_redis(&client, msg).await {
                            tracing::warn!(error = %e, "Failed to flush cache write during shutdown");
                        } else {
                            flushed += 1;
                        }
                    }
                    tracing::info!(flushed, "Cache writer task stopped");
                    break;
                }
            }
        }
    }

    async fn write_to_redis(client: &Client, msg: CacheWriteMessage) -> AppResult<()> {
        let mut conn = client.get_multiplexed_async_connection().await?;
        let _: () = conn.set_ex(msg.key, msg.value, msg.ttl.max(1)).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl CacheStore for RedisStore {
    async fn get(&self, namespace: &str, key: &str) -> AppResult<Option<String>> {
        let mut conn = self.redis_client.get_multiplexed_async_connection().await?;
        let cached: Option<String> = conn.get(storage_key(namespace, key)).await?;
        Ok(cached)
    }

    async fn set(&self, namespace: &str, key: &str, value: String, ttl_secs: u64) -> AppResult<()> {
        let msg = CacheWriteMessage {
            key: storage_key(namespace, key),
            value,
            ttl: ttl_secs,
        };

        self.write_tx
            .send(msg)
            .map_err(|e| AppError::Cache(format!("Cache writer unavailable: {}", e)))
    }

    async fn delete(&self, namespace: &str, key: &str) -> AppResult<()> {
        let mut conn = self.redis_client.get_multiplexed_async_connection().await?;
        let _: () = conn.del(storage_key(namespace, key)).await?;
        Ok(())
    }

    async fn clear_namespace(&self, namespace: &str) -> AppResult<u64> {
        let mut conn = self.redis_client.get_multiplexed_async_connection().await?;
        let pattern = format!("{}*", storage_key(namespace, ""));

        let keys: Vec<String> = {
            let mut iter = conn.scan_match::<_, String>(&pattern).await?;
            let mut keys = Vec::new();
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
            keys
        };

        if keys.is_empty() {
            return Ok(0);
        }

        let removed: u64 = conn.del(&keys).await?;
        tracing::info!(namespace, removed, "Cleared cache namespace");
        Ok(removed)
    }

    async fn increment(&self, namespace: &str, key: &str, ttl_secs: u64) -> AppResult<u64> {
        let full_key = storage_key(namespace, key);
        let mut conn = self.redis_client.get_multiplexed_async_connection().await?;

        let count: u64 = conn.incr(&full_key, 1u64).await?;
        if count == 1 {
            let _: () = conn.expire(&full_key, ttl_secs.max(1) as i64).await?;
        }
        Ok(count)
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn redis_url() -> String {
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string())
    }

    // The tests below need a running Redis; run with `cargo test -- --ignored`.

    #[tokio::test]
    #[ignore]
    async fn test_redis_store_background_write_then_read() {
        let client = create_redis_client(&redis_url()).unwrap();
        let (store, _handle) = RedisStore::new(client);

        store
            .set("test", "background_write", "hello".into(), 60)
            .await
            .unwrap();
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;

        assert_eq!(
            store.get("test", "background_write").await.unwrap(),
            Some("hello".to_string())
        );
        store.delete("test", "background_write").await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_store_graceful_shutdown_flushes() {
        let client = create_redis_client(&redis_url()).unwrap();
        let (store, handle) = RedisStore::new(client);

        store.set("test", "shutdown", "flushed".into(), 60).await.unwrap();
        handle.shutdown().await;
        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;

        assert_eq!(
            store.get("test", "shutdown").await.unwrap(),
            Some("flushed".to_string())
        );
        store.delete("test", "shutdown").await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_store_increment_and_clear_namespace() {
        let client = create_redis_client(&redis_url()).unwrap();
        let (store, _handle) = RedisStore::new(client);

        assert_eq!(store.increment("test_rate", "k", 60).await.unwrap(), 1);
        assert_eq!(store.increment("test_rate", "k", 60).await.unwrap(), 2);
        assert_eq!(store.clear_namespace("test_rate").await.unwrap(), 1);
        assert_eq!(store.get("test_rate", "k").await.unwrap(), None);
    }
}

pub mod redis;
pub mod store;

pub use redis::{create_redis_client, CacheWriterHandle, RedisStore};
pub use store::{CacheStore, MemoryStore};

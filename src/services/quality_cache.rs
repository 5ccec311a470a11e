//! Quality-aware caching in front of the resilient client
//!
//! Records remember whether their payload is real upstream data or locally
//! manufactured fallback. Real data lives long; fallback data expires quickly
//! and is only ever served as a safety net after a fresh upstream attempt.
//! Cache failures are logged and bypassed, never surfaced.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::future::Future;
use std::sync::Arc;

use crate::{
    db::CacheStore,
    error::{AppError, AppResult},
    models::{Candidate, CulturalTag, DomainType, Entity},
};

/// Cache namespaces used by the service
pub mod namespaces {
    pub const ENTITY_SEARCH: &str = "entity_search";
    pub const INSIGHTS: &str = "insights";
    pub const RECOMMENDATIONS: &str = "recommendations";
    pub const HISTORY: &str = "history";
    pub const RATE_LIMIT: &str = "rate_limit";
    pub const BURST: &str = "burst";

    /// Namespaces an operator may clear through the admin route
    pub const CLEARABLE: [&str; 6] = [
        ENTITY_SEARCH,
        INSIGHTS,
        RECOMMENDATIONS,
        HISTORY,
        RATE_LIMIT,
        BURST,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataQuality {
    Real,
    Fallback,
}

/// Payloads that can tell whether they hold placeholder data
pub trait QualityTagged {
    fn quality(&self) -> DataQuality;
}

impl QualityTagged for Vec<Candidate> {
    /// Any manufactured candidate marks the whole list as fallback
    fn quality(&self) -> DataQuality {
        if self.iter().any(|c| c.is_fallback()) {
            DataQuality::Fallback
        } else {
            DataQuality::Real
        }
    }
}

/// An empty answer may be transient, so it is kept only as briefly as fallback data
impl QualityTagged for Vec<Entity> {
    fn quality(&self) -> DataQuality {
        if self.is_empty() {
            DataQuality::Fallback
        } else {
            DataQuality::Real
        }
    }
}

impl QualityTagged for Vec<CulturalTag> {
    fn quality(&self) -> DataQuality {
        if self.is_empty() {
            DataQuality::Fallback
        } else {
            DataQuality::Real
        }
    }
}

/// Stored form of a cached payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheRecord<T> {
    pub namespace: String,
    pub key: String,
    pub payload: T,
    pub quality: DataQuality,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheTtls {
    pub real_secs: u64,
    pub fallback_secs: u64,
}

impl Default for CacheTtls {
    fn default() -> Self {
        Self {
            real_secs: 86_400,
            fallback_secs: 300,
        }
    }
}

impl CacheTtls {
    pub fn for_quality(&self, quality: DataQuality) -> u64 {
        match quality {
            DataQuality::Real => self.real_secs,
            // placeholder records must never outlive ten minutes
            DataQuality::Fallback => self.fallback_secs.min(600),
        }
    }
}

/// Where a `get_or_fetch` result came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
    /// Real record served from cache
    Hit,
    /// Fetched from upstream
    Fresh,
    /// Stale fallback record served after the fresh attempt did no better
    StaleFallback,
}

/// Outcome of `QualityAwareCache::lookup`
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup<T> {
    Hit(T),
    /// Fallback record; a fresh attempt is still due
    Stale(T),
    Miss,
}

#[derive(Debug, Clone)]
pub struct Cached<T> {
    pub value: T,
    pub quality: DataQuality,
    pub source: CacheSource,
}

fn sha256_hex(input: &str) -> String {
    format!("{:x}", Sha256::digest(input.as_bytes()))
}

/// Key for entity search: case- and whitespace-insensitive in the name
pub fn entity_search_key(name: &str, domain: DomainType) -> String {
    let normalized = name.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
    sha256_hex(&format!("{}|{}", normalized, domain))
}

pub fn insights_key(entity_id: &str, domain: DomainType) -> String {
    format!("{}:{}", entity_id, domain)
}

/// Key for cross-domain recommendations: independent of tag and domain order
pub fn recommendations_key(tag_ids: &[String], domains: &[DomainType]) -> String {
    let mut tags: Vec<&str> = tag_ids.iter().map(String::as_str).collect();
    tags.sort_unstable();
    tags.dedup();

    let mut domain_names: Vec<&str> = domains.iter().map(DomainType::as_str).collect();
    domain_names.sort_unstable();
    domain_names.dedup();

    sha256_hex(&format!("{}|{}", tags.join(","), domain_names.join(",")))
}

#[derive(Clone)]
pub struct QualityAwareCache {
    store: Arc<dyn CacheStore>,
    ttls: CacheTtls,
}

impl QualityAwareCache {
    pub fn new(store: Arc<dyn CacheStore>, ttls: CacheTtls) -> Self {
        Self { store, ttls }
    }

    /// Underlying store, shared with the rate limiter and history
    pub fn store(&self) -> Arc<dyn CacheStore> {
        self.store.clone()
    }

    pub fn ttls(&self) -> CacheTtls {
        self.ttls
    }

    /// Reads a record; errors and undecodable payloads count as a miss
    pub async fn get<T: DeserializeOwned>(&self, namespace: &str, key: &str) -> Option<CacheRecord<T>> {
        let raw = match self.store.get(namespace, key).await {
            Ok(raw) => raw?,
            Err(e) => {
                tracing::warn!(namespace, error = %e, backend = self.store.name(), "Cache read failed");
                return None;
            }
        };

        match serde_json::from_str::<CacheRecord<T>>(&raw) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!(namespace, error = %e, "Discarding undecodable cache record");
                None
            }
        }
    }

    /// Writes a record with the TTL its quality calls for
    pub async fn set<T: Serialize>(&self, namespace: &str, key: &str, value: &T, quality: DataQuality) {
        let ttl = self.ttls.for_quality(quality);
        self.set_with_ttl(namespace, key, value, quality, ttl).await;
    }

    pub async fn set_with_ttl<T: Serialize>(
        &self,
        namespace: &str,
        key: &str,
        value: &T,
        quality: DataQuality,
        ttl_secs: u64,
    ) {
        let record = CacheRecord {
            namespace: namespace.to_string(),
            key: key.to_string(),
            payload: value,
            quality,
            expires_at: Utc::now() + ChronoDuration::seconds(ttl_secs as i64),
        };

        let result = match serde_json::to_string(&record) {
            Ok(json) => self.store.set(namespace, key, json, ttl_secs).await,
            Err(e) => Err(AppError::from(e)),
        };

        if let Err(e) = result {
            tracing::warn!(namespace, error = %e, "Cache write failed");
        }
    }

    pub async fn delete(&self, namespace: &str, key: &str) {
        if let Err(e) = self.store.delete(namespace, key).await {
            tracing::warn!(namespace, error = %e, "Cache delete failed");
        }
    }

    /// Administrative namespace clear; unlike the request path this reports errors
    pub async fn clear_namespace(&self, namespace: &str) -> AppResult<u64> {
        let removed = self.store.clear_namespace(namespace).await?;
        tracing::info!(namespace, removed, "Cache namespace cleared");
        Ok(removed)
    }

    /// First half of a cache-aside read: a real record is a hit, a fallback
    /// record is a soft miss carrying the stale payload.
    pub async fn lookup<T: DeserializeOwned>(&self, namespace: &str, key: &str) -> Lookup<T> {
        match self.get::<T>(namespace, key).await {
            Some(record) if record.quality == DataQuality::Real => {
                tracing::debug!(namespace, "Cache hit");
                Lookup::Hit(record.payload)
            }
            Some(record) => {
                tracing::debug!(namespace, "Fallback cache hit, retrying upstream");
                Lookup::Stale(record.payload)
            }
            None => {
                tracing::debug!(namespace, "Cache miss");
                Lookup::Miss
            }
        }
    }

    /// Second half: stores a fresh result by quality, or keeps the stale
    /// fallback when the fresh attempt failed or did no better.
    pub async fn settle<T>(
        &self,
        namespace: &str,
        key: &str,
        fresh: AppResult<T>,
        stale: Option<T>,
    ) -> AppResult<Cached<T>>
    where
        T: Serialize + QualityTagged,
    {
        match fresh {
            Ok(value) => {
                let quality = value.quality();
                match (quality, stale) {
                    (DataQuality::Fallback, Some(stale)) => Ok(Cached {
                        value: stale,
                        quality: DataQuality::Fallback,
                        source: CacheSource::StaleFallback,
                    }),
                    _ => {
                        self.set(namespace, key, &value, quality).await;
                        Ok(Cached {
                            value,
                            quality,
                            source: CacheSource::Fresh,
                        })
                    }
                }
            }
            Err(e) => match stale {
                Some(stale) => {
                    tracing::warn!(namespace, error = %e, "Fresh fetch failed, serving stale fallback");
                    Ok(Cached {
                        value: stale,
                        quality: DataQuality::Fallback,
                        source: CacheSource::StaleFallback,
                    })
                }
                None => Err(e),
            },
        }
    }

    /// Serves from cache or fetches fresh data.
    ///
    /// - real hit: returned as is, `fetch` not called
    /// - fallback hit: soft miss, `fetch` is called; the stale record is served
    ///   only if the fresh call fails or is itself fallback
    /// - miss: `fetch` is called and the result stored by quality
    pub async fn get_or_fetch<T, F, Fut>(&self, namespace: &str, key: &str, fetch: F) -> AppResult<Cached<T>>
    where
        T: Serialize + DeserializeOwned + QualityTagged,
        F: FnOnce() -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        let stale = match self.lookup::<T>(namespace, key).await {
            Lookup::Hit(value) => {
                return Ok(Cached {
                    value,
                    quality: DataQuality::Real,
                    source: CacheSource::Hit,
                })
            }
            Lookup::Stale(value) => Some(value),
            Lookup::Miss => None,
        };

        self.settle(namespace, key, fetch().await, stale).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::services::fallback::{fallback_candidates, ConfidenceBand};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Store whose every operation fails
    struct BrokenStore;

    #[async_trait::async_trait]
    impl CacheStore for BrokenStore {
        async fn get(&self, _: &str, _: &str) -> AppResult<Option<String>> {
            Err(AppError::Cache("down".into()))
        }
        async fn set(&self, _: &str, _: &str, _: String, _: u64) -> AppResult<()> {
            Err(AppError::Cache("down".into()))
        }
        async fn delete(&self, _: &str, _: &str) -> AppResult<()> {
            Err(AppError::Cache("down".into()))
        }
        async fn clear_namespace(&self, _: &str) -> AppResult<u64> {
            Err(AppError::Cache("down".into()))
        }
        async fn increment(&self, _: &str, _: &str, _: u64) -> AppResult<u64> {
            Err(AppError::Cache("down".into()))
        }
        fn name(&self) -> &'static str {
            "broken"
        }
    }

    fn cache() -> QualityAwareCache {
        QualityAwareCache::new(Arc::new(MemoryStore::new()), CacheTtls::default())
    }

    fn real_movies() -> Vec<Candidate> {
        vec![Candidate::real("m1", "Arrival", DomainType::Movie, 0.9, vec![])]
    }

    fn fallback_movies() -> Vec<Candidate> {
        fallback_candidates(DomainType::Movie, 2, ConfidenceBand::default())
    }

    #[test]
    fn test_entity_search_key_is_case_insensitive() {
        assert_eq!(
            entity_search_key("Radiohead", DomainType::Artist),
            entity_search_key("  RADIOHEAD ", DomainType::Artist)
        );
        assert_ne!(
            entity_search_key("Radiohead", DomainType::Artist),
            entity_search_key("Radiohead", DomainType::Movie)
        );
    }

    #[test]
    fn test_recommendations_key_is_order_independent() {
        let tags = vec!["b".to_string(), "a".to_string()];
        let reversed = vec!["a".to_string(), "b".to_string()];
        assert_eq!(
            recommendations_key(&tags, &[DomainType::Movie, DomainType::Book]),
            recommendations_key(&reversed, &[DomainType::Book, DomainType::Movie])
        );
        assert_ne!(
            recommendations_key(&tags, &[DomainType::Movie]),
            recommendations_key(&tags, &[DomainType::Book])
        );
    }

    #[test]
    fn test_insights_key() {
        assert_eq!(insights_key("E1", DomainType::Artist), "E1:artist");
    }

    #[test]
    fn test_fallback_ttl_is_short_and_capped() {
        let ttls = CacheTtls {
            real_secs: 86_400,
            fallback_secs: 7_200,
        };
        assert_eq!(ttls.for_quality(DataQuality::Real), 86_400);
        assert_eq!(ttls.for_quality(DataQuality::Fallback), 600);
        assert_eq!(CacheTtls::default().for_quality(DataQuality::Fallback), 300);
    }

    #[test]
    fn test_candidate_list_quality() {
        assert_eq!(real_movies().quality(), DataQuality::Real);
        assert_eq!(fallback_movies().quality(), DataQuality::Fallback);
        let mut mixed = real_movies();
        mixed.extend(fallback_movies());
        assert_eq!(mixed.quality(), DataQuality::Fallback);
    }

    #[tokio::test]
    async fn test_real_hit_skips_fetch() {
        let cache = cache();
        cache.set("recommendations", "k", &real_movies(), DataQuality::Real).await;
        let fetches = AtomicUsize::new(0);

        let cached = cache
            .get_or_fetch("recommendations", "k", || async {
                fetches.fetch_add(1, Ordering::SeqCst);
                Ok(Vec::<Candidate>::new())
            })
            .await
            .unwrap();

        assert_eq!(fetches.load(Ordering::SeqCst), 0);
        assert_eq!(cached.source, CacheSource::Hit);
        assert_eq!(cached.value, real_movies());
    }

    #[tokio::test]
    async fn test_fallback_hit_is_soft_miss_and_upgrades_to_real() {
        let cache = cache();
        cache
            .set("recommendations", "k", &fallback_movies(), DataQuality::Fallback)
            .await;
        let fetches = AtomicUsize::new(0);

        let cached = cache
            .get_or_fetch("recommendations", "k", || async {
                fetches.fetch_add(1, Ordering::SeqCst);
                Ok(real_movies())
            })
            .await
            .unwrap();

        assert_eq!(fetches.load(Ordering::SeqCst), 1);
        assert_eq!(cached.source, CacheSource::Fresh);
        assert_eq!(cached.quality, DataQuality::Real);

        let record = cache
            .get::<Vec<Candidate>>("recommendations", "k")
            .await
            .unwrap();
        assert_eq!(record.quality, DataQuality::Real);
    }

    #[tokio::test]
    async fn test_fallback_hit_kept_when_fresh_call_fails() {
        let cache = cache();
        cache
            .set("recommendations", "k", &fallback_movies(), DataQuality::Fallback)
            .await;

        let cached = cache
            .get_or_fetch::<Vec<Candidate>, _, _>("recommendations", "k", || async {
                Err(AppError::Internal("upstream down".into()))
            })
            .await
            .unwrap();

        assert_eq!(cached.source, CacheSource::StaleFallback);
        assert_eq!(cached.value, fallback_movies());
    }

    #[tokio::test]
    async fn test_miss_propagates_fetch_error() {
        let result = cache()
            .get_or_fetch::<Vec<Candidate>, _, _>("recommendations", "k", || async {
                Err(AppError::Internal("upstream down".into()))
            })
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_fresh_fallback_written_with_short_ttl() {
        let cache = cache();
        let cached = cache
            .get_or_fetch("recommendations", "k", || async { Ok(fallback_movies()) })
            .await
            .unwrap();
        assert_eq!(cached.quality, DataQuality::Fallback);

        let record = cache
            .get::<Vec<Candidate>>("recommendations", "k")
            .await
            .unwrap();
        assert_eq!(record.quality, DataQuality::Fallback);
        assert!(record.expires_at <= Utc::now() + ChronoDuration::seconds(300));
    }

    #[tokio::test]
    async fn test_empty_search_result_is_short_lived_and_refetched() {
        let cache = cache();
        let fetches = AtomicUsize::new(0);
        let search = || async {
            fetches.fetch_add(1, Ordering::SeqCst);
            Ok(Vec::<Entity>::new())
        };

        let first = cache.get_or_fetch("entity_search", "k", search).await.unwrap();
        assert_eq!(first.quality, DataQuality::Fallback);
        let record = cache.get::<Vec<Entity>>("entity_search", "k").await.unwrap();
        assert_eq!(record.quality, DataQuality::Fallback);
        assert!(record.expires_at <= Utc::now() + ChronoDuration::seconds(300));

        cache.get_or_fetch("entity_search", "k", search).await.unwrap();
        assert_eq!(fetches.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_empty_tag_list_is_fallback_quality() {
        assert_eq!(Vec::<CulturalTag>::new().quality(), DataQuality::Fallback);
        assert_eq!(Vec::<Entity>::new().quality(), DataQuality::Fallback);
        assert_eq!(
            vec![Entity::new("Radiohead", DomainType::Artist)].quality(),
            DataQuality::Real
        );
    }

    #[tokio::test]
    async fn test_lookup_then_settle_keeps_stale_when_fresh_is_fallback() {
        let cache = cache();
        let stale = vec![Candidate::fallback("fallback-x", "Stale Pick", DomainType::Movie, 0.4, "popular choice")];
        cache.set("recommendations", "k", &stale, DataQuality::Fallback).await;

        let Lookup::Stale(previous) = cache.lookup::<Vec<Candidate>>("recommendations", "k").await else {
            panic!("fallback record should be a soft miss");
        };
        let settled = cache
            .settle("recommendations", "k", Ok(fallback_movies()), Some(previous))
            .await
            .unwrap();

        assert_eq!(settled.source, CacheSource::StaleFallback);
        assert_eq!(settled.value, stale);
    }

    #[tokio::test]
    async fn test_broken_store_falls_through_to_fetch() {
        let cache = QualityAwareCache::new(Arc::new(BrokenStore), CacheTtls::default());

        let cached = cache
            .get_or_fetch("recommendations", "k", || async { Ok(real_movies()) })
            .await
            .unwrap();

        assert_eq!(cached.source, CacheSource::Fresh);
        assert_eq!(cached.value, real_movies());
        assert!(cache.clear_namespace("recommendations").await.is_err());
    }
}

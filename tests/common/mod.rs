use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum_test::TestServer;
use tastebridge_api::{
    db::{CacheStore, MemoryStore},
    error::AppResult,
    models::{Candidate, CulturalTag, DomainType, Entity},
    routes::{create_router, AppState, ServiceSettings},
    services::{
        providers::{GraphProvider, UpstreamError, UpstreamResult},
        ClientSettings, RetryPolicy, TemplateExplainer,
    },
};

/// In-process cultural graph with scripted answers
#[derive(Default)]
pub struct FakeGraphProvider {
    pub tags: Vec<CulturalTag>,
    pub candidates: HashMap<DomainType, Vec<(&'static str, f64)>>,
    pub fail_recommendations: bool,
    pub calls: AtomicUsize,
}

impl FakeGraphProvider {
    pub fn with_tags(tags: &[(&str, &str, f64)]) -> Self {
        Self {
            tags: tags
                .iter()
                .map(|(id, name, affinity)| CulturalTag {
                    tag_id: id.to_string(),
                    name: name.to_string(),
                    applicable_types: BTreeSet::from([DomainType::Movie, DomainType::Book]),
                    subtype: None,
                    affinity: *affinity,
                })
                .collect(),
            ..Self::default()
        }
    }

    pub fn with_candidates(mut self, domain: DomainType, items: &[(&'static str, f64)]) -> Self {
        self.candidates.insert(domain, items.to_vec());
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail_recommendations = true;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl GraphProvider for FakeGraphProvider {
    async fn search(&self, name: &str, domain: DomainType) -> UpstreamResult<Vec<Entity>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let id = format!("ent-{}", name.to_lowercase().replace(' ', "-"));
        Ok(vec![Entity::new(name, domain).with_id(id)])
    }

    async fn insights(&self, _entity_id: &str, _domain: DomainType) -> UpstreamResult<Vec<CulturalTag>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.tags.clone())
    }

    async fn recommendations(
        &self,
        tag_ids: &[String],
        domain: DomainType,
        _limit: usize,
    ) -> UpstreamResult<Vec<Candidate>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_recommendations {
            return Err(UpstreamError::Status {
                status: 503,
                body: "upstream unavailable".into(),
            });
        }
        Ok(self
            .candidates
            .get(&domain)
            .map(|items| {
                items
                    .iter()
                    .map(|(name, confidence)| {
                        Candidate::real(format!("rec-{}", name.to_lowercase()), *name, domain, *confidence, tag_ids.to_vec())
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    fn name(&self) -> &'static str {
        "fake"
    }
}

/// Memory store that counts every call made against it
#[derive(Default)]
pub struct CountingStore {
    inner: MemoryStore,
    pub calls: AtomicUsize,
}

impl CountingStore {
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn tick(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl CacheStore for CountingStore {
    async fn get(&self, namespace: &str, key: &str) -> AppResult<Option<String>> {
        self.tick();
        self.inner.get(namespace, key).await
    }

    async fn set(&self, namespace: &str, key: &str, value: String, ttl_secs: u64) -> AppResult<()> {
        self.tick();
        self.inner.set(namespace, key, value, ttl_secs).await
    }

    async fn delete(&self, namespace: &str, key: &str) -> AppResult<()> {
        self.tick();
        self.inner.delete(namespace, key).await
    }

    async fn clear_namespace(&self, namespace: &str) -> AppResult<u64> {
        self.tick();
        self.inner.clear_namespace(namespace).await
    }

    async fn increment(&self, namespace: &str, key: &str, ttl_secs: u64) -> AppResult<u64> {
        self.tick();
        self.inner.increment(namespace, key, ttl_secs).await
    }

    fn name(&self) -> &'static str {
        "counting"
    }
}

/// Settings with retries and staggering disabled so tests run fast
pub fn fast_settings() -> ServiceSettings {
    ServiceSettings {
        retry: RetryPolicy::no_retries(),
        client: ClientSettings {
            inter_request_delay: std::time::Duration::ZERO,
            ..ClientSettings::default()
        },
        ..ServiceSettings::default()
    }
}

pub fn create_test_server(
    provider: Arc<FakeGraphProvider>,
    store: Arc<dyn CacheStore>,
    settings: ServiceSettings,
) -> TestServer {
    let state = AppState::new(provider, store, Arc::new(TemplateExplainer), settings);
    TestServer::new(create_router(Arc::new(state))).unwrap()
}

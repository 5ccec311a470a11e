use axum::{
    http::StatusCode,
    middleware,
    routing::{delete, get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{
    db::CacheStore,
    middleware::{make_span_with_request_context, request_context_middleware},
    services::{
        providers::GraphProvider, CacheTtls, ClientSettings, DegradationChain, DegradationSettings, Explainer,
        OrchestratorSettings, QualityAwareCache, RateLimiter, RateLimiterSettings, RecommendationOrchestrator,
        ResilientUpstreamClient, RetryPolicy, StaticTierDirectory, TierDirectory,
    },
};

pub mod cache;
pub mod rate_limit;
pub mod recommendations;

/// Per-component settings used to assemble the service graph
#[derive(Clone)]
pub struct ServiceSettings {
    pub retry: RetryPolicy,
    pub client: ClientSettings,
    pub cache_ttls: CacheTtls,
    pub rate_limiter: RateLimiterSettings,
    pub degradation: DegradationSettings,
    pub orchestrator: OrchestratorSettings,
    pub tier_directory: Arc<dyn TierDirectory>,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            client: ClientSettings::default(),
            cache_ttls: CacheTtls::default(),
            rate_limiter: RateLimiterSettings::default(),
            degradation: DegradationSettings::default(),
            orchestrator: OrchestratorSettings::default(),
            tier_directory: Arc::new(StaticTierDirectory::default()),
        }
    }
}

/// Shared application state, constructed once at startup
pub struct AppState {
    pub orchestrator: RecommendationOrchestrator,
    pub rate_limiter: Arc<RateLimiter>,
    pub cache: QualityAwareCache,
}

impl AppState {
    /// Wires every service around the given collaborators
    pub fn new(
        provider: Arc<dyn GraphProvider>,
        store: Arc<dyn CacheStore>,
        explainer: Arc<dyn Explainer>,
        settings: ServiceSettings,
    ) -> Self {
        let client = Arc::new(ResilientUpstreamClient::new(provider, settings.retry, settings.client));
        let cache = QualityAwareCache::new(store.clone(), settings.cache_ttls);
        let rate_limiter = Arc::new(RateLimiter::new(
            store.clone(),
            settings.tier_directory,
            settings.rate_limiter,
        ));
        let degradation = Arc::new(DegradationChain::new(store, settings.degradation));

        let orchestrator = RecommendationOrchestrator::new(
            client,
            cache.clone(),
            rate_limiter.clone(),
            degradation,
            explainer,
            settings.orchestrator,
        );

        Self {
            orchestrator,
            rate_limiter,
            cache,
        }
    }
}

/// Creates the application router with all routes
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .nest("/api/v1", api_routes())
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http().make_span_with(make_span_with_request_context))
        .layer(middleware::from_fn(request_context_middleware))
}

/// API routes under /api/v1
fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/recommendations", post(recommendations::recommend))
        .route(
            "/rate-limit",
            get(rate_limit::status).delete(rate_limit::reset),
        )
        .route("/cache/:namespace", delete(cache::clear_namespace))
}

/// Health check endpoint
async fn health_check() -> (StatusCode, Json<Value>) {
    (StatusCode::OK, Json(json!({ "status": "healthy" })))
}

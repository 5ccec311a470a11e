use std::sync::Arc;

use tastebridge_api::{
    config::Config,
    db::{create_redis_client, CacheStore, CacheWriterHandle, MemoryStore, RedisStore},
    routes::{create_router, AppState, ServiceSettings},
    services::{providers::HttpGraphProvider, Explainer, HttpExplainer, TemplateExplainer},
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;

    let (store, writer): (Arc<dyn CacheStore>, Option<CacheWriterHandle>) = match &config.redis_url {
        Some(redis_url) => {
            let client = create_redis_client(redis_url)?;
            let (store, writer) = RedisStore::new(client);
            tracing::info!("Using redis cache store");
            (Arc::new(store), Some(writer))
        }
        None => {
            tracing::info!("REDIS_URL not set, using in-process cache store");
            (Arc::new(MemoryStore::new()), None)
        }
    };

    let provider = HttpGraphProvider::new(
        config.graph_api_key.clone(),
        config.graph_api_url.clone(),
        config.upstream_timeout(),
    )
    .map_err(|e| anyhow::anyhow!("Failed to build graph client: {}", e))?;

    let explainer: Arc<dyn Explainer> = match &config.explanation_api_url {
        Some(url) => Arc::new(HttpExplainer::new(
            url.clone(),
            config.explanation_api_key.clone(),
            config.upstream_timeout(),
        )?),
        None => Arc::new(TemplateExplainer),
    };

    let settings = ServiceSettings {
        retry: config.retry_policy(),
        client: config.client_settings(),
        cache_ttls: config.cache_ttls(),
        rate_limiter: config.rate_limiter_settings(),
        degradation: config.degradation_settings(),
        orchestrator: config.orchestrator_settings(),
        tier_directory: Arc::new(config.tier_directory()),
    };

    let state = Arc::new(AppState::new(Arc::new(provider), store, explainer, settings));
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(config.bind_address()).await?;
    tracing::info!(
        address = %config.bind_address(),
        environment = %config.environment,
        explainer = if config.explanation_api_url.is_some() { "http" } else { "template" },
        "Server running"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(writer) = writer {
        writer.shutdown().await;
    }
    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Shutdown signal received"),
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
    }
}

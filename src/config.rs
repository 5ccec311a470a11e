use chrono::Duration as ChronoDuration;
use serde::Deserialize;
use std::time::Duration;

use crate::{
    models::DomainType,
    services::{
        fallback::ConfidenceBand, CacheTtls, ClientSettings, DegradationSettings, OrchestratorSettings,
        RateLimiterSettings, RetryPolicy, StaticTierDirectory,
    },
};

/// Application configuration loaded from environment variables
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Server host address
    #[serde(default = "default_host")]
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// `development` or `production`
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Redis connection URL; the in-process store is used when unset
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Cultural graph API base URL
    #[serde(default = "default_graph_api_url")]
    pub graph_api_url: String,

    /// Cultural graph API key
    pub graph_api_key: String,

    /// Text-generation endpoint; templated explanations only when unset
    #[serde(default)]
    pub explanation_api_url: Option<String>,

    #[serde(default)]
    pub explanation_api_key: Option<String>,

    #[serde(default = "default_upstream_timeout_ms")]
    pub upstream_timeout_ms: u64,

    #[serde(default = "default_slow_domain_timeout_ms")]
    pub slow_domain_timeout_ms: u64,

    /// Shared budget for one cross-domain generation pass
    #[serde(default = "default_request_budget_ms")]
    pub request_budget_ms: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_initial_delay_ms")]
    pub retry_initial_delay_ms: u64,

    #[serde(default = "default_retry_multiplier")]
    pub retry_multiplier: f64,

    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    /// Comma-separated tag counts, e.g. `8,5,3,1`
    #[serde(default = "default_tag_ladder")]
    pub tag_ladder: Vec<usize>,

    #[serde(default = "default_slow_domains")]
    pub slow_domains: Vec<String>,

    #[serde(default = "default_slow_domain_limit")]
    pub slow_domain_limit: usize,

    #[serde(default = "default_inter_request_delay_ms")]
    pub inter_request_delay_ms: u64,

    #[serde(default = "default_entity_concurrency")]
    pub entity_concurrency: usize,

    #[serde(default = "default_real_cache_ttl_secs")]
    pub real_cache_ttl_secs: u64,

    #[serde(default = "default_fallback_cache_ttl_secs")]
    pub fallback_cache_ttl_secs: u64,

    #[serde(default = "default_fallback_confidence_high")]
    pub fallback_confidence_high: f64,

    #[serde(default = "default_fallback_confidence_low")]
    pub fallback_confidence_low: f64,

    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,

    #[serde(default = "default_min_history_relevance")]
    pub min_history_relevance: f64,

    #[serde(default = "default_popularity_lookback_hours")]
    pub popularity_lookback_hours: i64,

    #[serde(default = "default_limit")]
    pub default_limit: usize,

    #[serde(default = "default_max_limit")]
    pub max_limit: usize,

    #[serde(default = "default_max_entities")]
    pub max_entities: usize,

    #[serde(default = "default_max_themes")]
    pub max_themes: usize,

    #[serde(default = "default_domains")]
    pub default_domains: Vec<String>,

    /// Comma-separated `user:tier` pairs
    #[serde(default)]
    pub user_tiers: Vec<String>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_graph_api_url() -> String {
    "http://localhost:8081".to_string()
}

fn default_upstream_timeout_ms() -> u64 {
    4000
}

fn default_slow_domain_timeout_ms() -> u64 {
    2500
}

fn default_request_budget_ms() -> u64 {
    8000
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_initial_delay_ms() -> u64 {
    200
}

fn default_retry_multiplier() -> f64 {
    2.0
}

fn default_retry_max_delay_ms() -> u64 {
    2000
}

fn default_tag_ladder() -> Vec<usize> {
    vec![8, 5, 3, 1]
}

fn default_slow_domains() -> Vec<String> {
    vec!["place".to_string()]
}

fn default_slow_domain_limit() -> usize {
    5
}

fn default_inter_request_delay_ms() -> u64 {
    100
}

fn default_entity_concurrency() -> usize {
    3
}

fn default_real_cache_ttl_secs() -> u64 {
    86_400
}

fn default_fallback_cache_ttl_secs() -> u64 {
    300
}

fn default_fallback_confidence_high() -> f64 {
    0.5
}

fn default_fallback_confidence_low() -> f64 {
    0.3
}

fn default_min_confidence() -> f64 {
    0.2
}

fn default_min_history_relevance() -> f64 {
    0.3
}

fn default_popularity_lookback_hours() -> i64 {
    24
}

fn default_limit() -> usize {
    10
}

fn default_max_limit() -> usize {
    50
}

fn default_max_entities() -> usize {
    10
}

fn default_max_themes() -> usize {
    8
}

fn default_domains() -> Vec<String> {
    ["movie", "tv_show", "book", "place"].iter().map(|d| d.to_string()).collect()
}

/// Parses domain names, dropping unknown ones with a warning
fn parse_domains(names: &[String]) -> Vec<DomainType> {
    names
        .iter()
        .filter(|name| !name.trim().is_empty())
        .filter_map(|name| match name.parse::<DomainType>() {
            Ok(domain) => Some(domain),
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring configured domain");
                None
            }
        })
        .collect()
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        envy::from_env::<Config>().map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))
    }

    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream_timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_delay: Duration::from_millis(self.retry_initial_delay_ms),
            multiplier: self.retry_multiplier,
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
        }
    }

    pub fn client_settings(&self) -> ClientSettings {
        ClientSettings {
            call_timeout: self.upstream_timeout(),
            slow_domain_timeout: Duration::from_millis(self.slow_domain_timeout_ms),
            request_budget: Duration::from_millis(self.request_budget_ms),
            tag_ladder: self.tag_ladder.iter().copied().filter(|n| *n > 0).collect(),
            slow_domains: parse_domains(&self.slow_domains),
            slow_domain_limit: self.slow_domain_limit,
            inter_request_delay: Duration::from_millis(self.inter_request_delay_ms),
            fallback_band: ConfidenceBand::ordered(self.fallback_confidence_high, self.fallback_confidence_low),
        }
    }

    pub fn cache_ttls(&self) -> CacheTtls {
        CacheTtls {
            real_secs: self.real_cache_ttl_secs,
            fallback_secs: self.fallback_cache_ttl_secs,
        }
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        let default_domains = parse_domains(&self.default_domains);
        OrchestratorSettings {
            default_limit: self.default_limit.clamp(1, self.max_limit.max(1)),
            max_limit: self.max_limit.max(1),
            max_entities: self.max_entities,
            max_themes: self.max_themes,
            entity_concurrency: self.entity_concurrency.max(1),
            min_confidence: self.min_confidence,
            default_domains: if default_domains.is_empty() {
                OrchestratorSettings::default().default_domains
            } else {
                default_domains
            },
        }
    }

    pub fn degradation_settings(&self) -> DegradationSettings {
        DegradationSettings {
            min_history_relevance: self.min_history_relevance,
            popularity_lookback: ChronoDuration::hours(self.popularity_lookback_hours.max(1)),
            ..DegradationSettings::default()
        }
    }

    pub fn rate_limiter_settings(&self) -> RateLimiterSettings {
        RateLimiterSettings {
            production: self.is_production(),
            ..RateLimiterSettings::default()
        }
    }

    pub fn tier_directory(&self) -> StaticTierDirectory {
        StaticTierDirectory::from_entries(&self.user_tiers)
    }
}

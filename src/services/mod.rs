pub mod aggregation;
pub mod degradation;
pub mod explanation;
pub mod fallback;
pub mod orchestrator;
pub mod providers;
pub mod quality_cache;
pub mod rate_limiter;
pub mod resilient_client;
pub mod retry;

pub use degradation::{DegradationChain, DegradationSettings};
pub use explanation::{Explainer, HttpExplainer, TemplateExplainer};
pub use orchestrator::{OrchestratorSettings, RecommendationOrchestrator};
pub use quality_cache::{CacheTtls, QualityAwareCache};
pub use rate_limiter::{RateLimiter, RateLimiterSettings, StaticTierDirectory, TierDirectory};
pub use resilient_client::{ClientSettings, ResilientUpstreamClient};
pub use retry::RetryPolicy;

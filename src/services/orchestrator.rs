//! Request-level recommendation flow
//!
//! RECEIVED → RATE_CHECK → PROFILE_EXTRACTION → CANDIDATE_GENERATION
//! (→ DEGRADED) → AGGREGATION → (EXPLANATION) → RESPONDED, or REJECTED when
//! the rate limiter vetoes. Only malformed input and rate limiting surface as
//! errors; entity and domain failures are absorbed along the way.

use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;
use std::sync::Arc;
use std::time::Instant;

use crate::{
    error::{AppError, AppResult},
    models::{
        Candidate, CulturalTag, DomainType, Entity, EntityInput, RecommendationMap, RecommendationRequest,
        RecommendationResponse, TasteProfile,
    },
    services::{
        aggregation::rank_domain,
        degradation::{DegradationChain, DegradationTier, HistoryEntry},
        explanation::{explain_recommendations, Explainer},
        fallback::is_fallback_id,
        quality_cache::{
            entity_search_key, insights_key, namespaces, recommendations_key, CacheSource, DataQuality, Lookup,
            QualityAwareCache,
        },
        rate_limiter::{RateLimitStatus, RateLimiter},
        resilient_client::{DomainOutcome, ResilientUpstreamClient},
    },
};

/// Endpoint name used for rate-limit accounting
pub const RECOMMENDATIONS_ENDPOINT: &str = "recommendations";

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub default_limit: usize,
    pub max_limit: usize,
    pub max_entities: usize,
    pub max_themes: usize,
    /// Entities resolved concurrently during profile extraction
    pub entity_concurrency: usize,
    pub min_confidence: f64,
    pub default_domains: Vec<DomainType>,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            default_limit: 10,
            max_limit: 50,
            max_entities: 10,
            max_themes: 8,
            entity_concurrency: 3,
            min_confidence: 0.2,
            default_domains: vec![DomainType::Movie, DomainType::TvShow, DomainType::Book, DomainType::Place],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStage {
    Received,
    RateCheck,
    ProfileExtraction,
    CandidateGeneration,
    Degraded,
    Aggregation,
    Explanation,
    Responded,
    Rejected,
}

impl Display for RequestStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RequestStage::Received => "RECEIVED",
            RequestStage::RateCheck => "RATE_CHECK",
            RequestStage::ProfileExtraction => "PROFILE_EXTRACTION",
            RequestStage::CandidateGeneration => "CANDIDATE_GENERATION",
            RequestStage::Degraded => "DEGRADED",
            RequestStage::Aggregation => "AGGREGATION",
            RequestStage::Explanation => "EXPLANATION",
            RequestStage::Responded => "RESPONDED",
            RequestStage::Rejected => "REJECTED",
        };
        write!(f, "{}", name)
    }
}

/// Per-request stage tracking
#[derive(Debug)]
struct StageTracker<'a> {
    request_id: &'a str,
    stage: RequestStage,
    history: Vec<RequestStage>,
}

impl<'a> StageTracker<'a> {
    fn new(request_id: &'a str) -> Self {
        Self {
            request_id,
            stage: RequestStage::Received,
            history: vec![RequestStage::Received],
        }
    }

    fn advance(&mut self, next: RequestStage) {
        tracing::debug!(request_id = self.request_id, from = %self.stage, to = %next, "Request stage transition");
        self.stage = next;
        self.history.push(next);
    }
}

/// A request that passed validation
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedRequest {
    pub entities: Vec<Entity>,
    pub domains: Vec<DomainType>,
    pub limit: usize,
    pub include_explanations: bool,
}

/// Response plus the admission status that let it through
#[derive(Debug, Clone)]
pub struct RecommendationOutcome {
    pub response: RecommendationResponse,
    pub rate_limit: RateLimitStatus,
    pub stages: Vec<RequestStage>,
}

/// Candidates for one domain before aggregation
struct DomainCandidates {
    candidates: Vec<Candidate>,
    real: bool,
    from_cache: bool,
}

pub struct RecommendationOrchestrator {
    client: Arc<ResilientUpstreamClient>,
    cache: QualityAwareCache,
    rate_limiter: Arc<RateLimiter>,
    degradation: Arc<DegradationChain>,
    explainer: Arc<dyn Explainer>,
    settings: OrchestratorSettings,
}

impl RecommendationOrchestrator {
    pub fn new(
        client: Arc<ResilientUpstreamClient>,
        cache: QualityAwareCache,
        rate_limiter: Arc<RateLimiter>,
        degradation: Arc<DegradationChain>,
        explainer: Arc<dyn Explainer>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            client,
            cache,
            rate_limiter,
            degradation,
            explainer,
            settings,
        }
    }

    /// Validates a request without touching the cache or the upstream
    pub fn validate(&self, request: &RecommendationRequest) -> AppResult<ValidatedRequest> {
        if request.entities.is_empty() {
            return Err(AppError::Validation("At least one entity is required".into()));
        }
        if request.entities.len() > self.settings.max_entities {
            return Err(AppError::Validation(format!(
                "At most {} entities are allowed",
                self.settings.max_entities
            )));
        }

        let entities = request
            .entities
            .iter()
            .map(validate_entity)
            .collect::<AppResult<Vec<_>>>()?;

        let domains = match &request.domains {
            Some(names) if !names.is_empty() => {
                let mut seen = BTreeSet::new();
                let mut domains = Vec::new();
                for name in names {
                    let domain = name.parse::<DomainType>().map_err(AppError::Validation)?;
                    if seen.insert(domain) {
                        domains.push(domain);
                    }
                }
                domains
            }
            _ => self.settings.default_domains.clone(),
        };

        let limit = match request.limit {
            Some(0) => return Err(AppError::Validation("limit must be at least 1".into())),
            Some(limit) => limit.min(self.settings.max_limit),
            None => self.settings.default_limit,
        };

        Ok(ValidatedRequest {
            entities,
            domains,
            limit,
            include_explanations: request.include_explanations.unwrap_or(true),
        })
    }

    pub async fn recommend(
        &self,
        user_id: &str,
        request_id: &str,
        request: RecommendationRequest,
    ) -> AppResult<RecommendationOutcome> {
        let started = Instant::now();
        let mut tracker = StageTracker::new(request_id);

        let validated = self.validate(&request)?;

        tracker.advance(RequestStage::RateCheck);
        let rate_limit = self
            .rate_limiter
            .check_limit(user_id, RECOMMENDATIONS_ENDPOINT)
            .await;
        if !rate_limit.allowed {
            tracker.advance(RequestStage::Rejected);
            return Err(AppError::RateLimited {
                limit: rate_limit.limit,
                remaining: rate_limit.remaining,
                reset_time: rate_limit.reset_time,
                retry_after: rate_limit.retry_after.unwrap_or(1),
            });
        }
        self.rate_limiter
            .record_request(user_id, RECOMMENDATIONS_ENDPOINT)
            .await;

        tracker.advance(RequestStage::ProfileExtraction);
        let profile = self.extract_profile(validated.entities).await;
        tracing::info!(
            request_id,
            entities = profile.input_entities.len(),
            themes = profile.themes.len(),
            "Taste profile extracted"
        );

        let mut recommendations = RecommendationMap::new();
        let mut cached = false;
        let mut degraded = false;

        if !profile.themes.is_empty() {
            tracker.advance(RequestStage::CandidateGeneration);
            let generated = self.generate_candidates(&profile, &validated.domains, validated.limit).await;

            let input_names: Vec<String> = profile.input_entities.iter().map(|e| e.name.clone()).collect();
            let mut per_domain = BTreeMap::new();
            for (domain, generated) in generated {
                if generated.real {
                    per_domain.insert(domain, generated);
                    continue;
                }
                if !degraded {
                    tracker.advance(RequestStage::Degraded);
                    degraded = true;
                }
                let candidates = self
                    .degrade_domain(user_id, &input_names, domain, validated.limit, generated.candidates)
                    .await;
                per_domain.insert(
                    domain,
                    DomainCandidates {
                        candidates,
                        real: false,
                        from_cache: false,
                    },
                );
            }

            tracker.advance(RequestStage::Aggregation);
            cached = !per_domain.is_empty() && per_domain.values().all(|d| d.from_cache);
            for (domain, domain_candidates) in per_domain {
                let ranked = rank_domain(
                    domain,
                    domain_candidates.candidates,
                    self.settings.min_confidence,
                    validated.limit,
                );
                if !ranked.is_empty() {
                    recommendations.insert(domain, ranked);
                }
            }

            if validated.include_explanations && !recommendations.is_empty() {
                tracker.advance(RequestStage::Explanation);
                explain_recommendations(self.explainer.as_ref(), &profile, &mut recommendations).await;
            }

            let has_real = recommendations.values().flatten().any(|r| !r.is_fallback());
            if !degraded && has_real {
                self.degradation
                    .record(
                        user_id,
                        HistoryEntry {
                            input_names,
                            recommendations: recommendations.clone(),
                            created_at: Utc::now(),
                        },
                    )
                    .await;
            }
        } else {
            tracing::warn!(request_id, "No themes extracted, returning empty recommendations");
        }

        tracker.advance(RequestStage::Responded);
        let processing_time = started.elapsed().as_millis() as u64;
        tracing::info!(
            request_id,
            domains = recommendations.len(),
            cached,
            degraded,
            processing_time,
            "Recommendation request completed"
        );

        Ok(RecommendationOutcome {
            response: RecommendationResponse {
                success: true,
                input: profile,
                recommendations,
                processing_time,
                cached,
                degraded,
            },
            rate_limit,
            stages: tracker.history,
        })
    }

    /// Resolves every input entity with bounded concurrency; failures skip the entity
    pub async fn extract_profile(&self, entities: Vec<Entity>) -> TasteProfile {
        let resolved: Vec<Option<(Entity, Vec<CulturalTag>)>> = stream::iter(entities)
            .map(|entity| self.resolve_entity(entity))
            .buffered(self.settings.entity_concurrency.max(1))
            .collect()
            .await;

        let (entities, tags): (Vec<Entity>, Vec<Vec<CulturalTag>>) = resolved.into_iter().flatten().unzip();
        let mut profile = TasteProfile::new(entities, tags.into_iter().flatten().collect());
        profile.themes.truncate(self.settings.max_themes);
        profile
    }

    async fn resolve_entity(&self, entity: Entity) -> Option<(Entity, Vec<CulturalTag>)> {
        let domain = entity.domain_type;

        if let Some(id) = entity.id.as_deref().filter(|id| is_fallback_id(id)) {
            tracing::warn!(entity = %entity.name, id, "Skipping placeholder entity id");
            return None;
        }

        let resolved = if entity.is_resolved() {
            entity
        } else {
            self.search_entity(entity).await?
        };

        let entity_id = resolved.id.clone()?;
        let key = insights_key(&entity_id, domain);
        let insights = self
            .cache
            .get_or_fetch(namespaces::INSIGHTS, &key, || async {
                Ok::<_, AppError>(self.client.insights(&entity_id, domain).await?)
            })
            .await;

        match insights {
            Ok(tags) => Some((resolved, tags.value)),
            Err(e) => {
                tracing::warn!(entity = %resolved.name, %domain, error = %e, "Insight lookup failed, skipping");
                None
            }
        }
    }

    /// First upstream match for the entity's name, keeping the caller's spelling
    async fn search_entity(&self, entity: Entity) -> Option<Entity> {
        let domain = entity.domain_type;
        let key = entity_search_key(&entity.name, domain);
        let search = self
            .cache
            .get_or_fetch(namespaces::ENTITY_SEARCH, &key, || async {
                Ok::<_, AppError>(self.client.search(&entity.name, domain).await?)
            })
            .await;

        let found = match search {
            Ok(found) => found.value,
            Err(e) => {
                tracing::warn!(entity = %entity.name, %domain, error = %e, "Entity search failed, skipping");
                return None;
            }
        };

        let Some(matched) = found
            .into_iter()
            .find(|candidate| candidate.id.as_deref().is_some_and(|id| !is_fallback_id(id)))
        else {
            tracing::warn!(entity = %entity.name, %domain, "Entity not found upstream, skipping");
            return None;
        };

        Some(Entity {
            name: entity.name,
            ..matched
        })
    }

    /// Per-domain candidates from cache, then the resilient client for the rest
    async fn generate_candidates(
        &self,
        profile: &TasteProfile,
        domains: &[DomainType],
        limit: usize,
    ) -> BTreeMap<DomainType, DomainCandidates> {
        let tag_ids: Vec<String> = profile.themes.iter().map(|t| t.tag_id.clone()).collect();
        let mut results = BTreeMap::new();
        let mut stale: BTreeMap<DomainType, Vec<Candidate>> = BTreeMap::new();
        let mut to_fetch = Vec::new();

        for domain in domains {
            let key = recommendations_key(&tag_ids, &[*domain]);
            match self.cache.lookup::<Vec<Candidate>>(namespaces::RECOMMENDATIONS, &key).await {
                Lookup::Hit(candidates) => {
                    tracing::debug!(%domain, "Recommendations served from cache");
                    results.insert(
                        *domain,
                        DomainCandidates {
                            candidates,
                            real: true,
                            from_cache: true,
                        },
                    );
                }
                Lookup::Stale(candidates) => {
                    stale.insert(*domain, candidates);
                    to_fetch.push(*domain);
                }
                Lookup::Miss => to_fetch.push(*domain),
            }
        }

        if to_fetch.is_empty() {
            return results;
        }

        let outcomes = self
            .client
            .cross_domain_recommendations(&tag_ids, &to_fetch, limit)
            .await;

        for (domain, outcome) in outcomes {
            let fresh = match outcome {
                DomainOutcome::Restricted => {
                    tracing::warn!(%domain, "Domain restricted upstream, omitted from response");
                    continue;
                }
                outcome => outcome.into_candidates(),
            };

            let key = recommendations_key(&tag_ids, &[domain]);
            let previous = stale.remove(&domain).filter(|previous| !previous.is_empty());
            let settled = self
                .cache
                .settle(namespaces::RECOMMENDATIONS, &key, Ok::<_, AppError>(fresh), previous)
                .await;
            if let Ok(cached) = settled {
                results.insert(
                    domain,
                    DomainCandidates {
                        real: cached.quality == DataQuality::Real,
                        from_cache: cached.source == CacheSource::Hit,
                        candidates: cached.value,
                    },
                );
            }
        }

        results
    }

    /// Chooses the best last-resort candidates for a domain without real data.
    ///
    /// History and popularity beat the client's curated fallback; the static
    /// catalog is only used when nothing the client produced would survive
    /// ranking. The chain only answers with candidates that do.
    async fn degrade_domain(
        &self,
        user_id: &str,
        input_names: &[String],
        domain: DomainType,
        limit: usize,
        client_fallback: Vec<Candidate>,
    ) -> Vec<Candidate> {
        let min_confidence = self.settings.min_confidence;
        let degraded = self
            .degradation
            .recommend(user_id, input_names, domain, limit, min_confidence)
            .await;
        let client_usable = client_fallback
            .iter()
            .any(|c| c.domain_type == domain && c.confidence >= min_confidence);
        match degraded.tier {
            DegradationTier::History | DegradationTier::Popularity => degraded.candidates,
            DegradationTier::StaticCatalog if client_usable => client_fallback,
            DegradationTier::StaticCatalog => degraded.candidates,
        }
    }
}

fn validate_entity(input: &EntityInput) -> AppResult<Entity> {
    let name = input.name.trim();
    if name.is_empty() {
        return Err(AppError::Validation("Entity name must not be empty".into()));
    }
    let domain = input
        .entity_type
        .parse::<DomainType>()
        .map_err(AppError::Validation)?;

    let entity = Entity::new(name, domain);
    Ok(match input.id.as_deref().map(str::trim) {
        Some(id) if !id.is_empty() => entity.with_id(id),
        _ => entity,
    })
}

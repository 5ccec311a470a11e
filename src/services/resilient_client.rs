//! Resilient access to the cultural-graph upstream
//!
//! Wraps a `GraphProvider` with per-call timeouts, exponential backoff on
//! 5xx/429, a progressive tag-reduction ladder for cross-domain requests, and
//! locally manufactured fallback candidates. Apart from a 403 on a domain,
//! cross-domain generation never fails: upstream flakiness turns into
//! fallback candidates instead of errors.

use futures::future::join_all;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::{
    models::{Candidate, CulturalTag, DomainType, Entity},
    services::{
        fallback::{fallback_candidates, ConfidenceBand},
        providers::{GraphProvider, UpstreamError, UpstreamResult},
        retry::{retry_with_backoff, retry_within_deadline, RetryPolicy},
    },
};

#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// Timeout for a single upstream call
    pub call_timeout: Duration,
    /// Tighter timeout for domains with variable latency
    pub slow_domain_timeout: Duration,
    /// Shared budget for one cross-domain generation pass
    pub request_budget: Duration,
    /// Tag counts tried in order when a domain fails (e.g. 8, 5, 3, 1)
    pub tag_ladder: Vec<usize>,
    pub slow_domains: Vec<DomainType>,
    /// Result cap for slow domains
    pub slow_domain_limit: usize,
    /// Stagger between concurrently started domain requests
    pub inter_request_delay: Duration,
    pub fallback_band: ConfidenceBand,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_millis(4000),
            slow_domain_timeout: Duration::from_millis(2500),
            request_budget: Duration::from_millis(8000),
            tag_ladder: vec![8, 5, 3, 1],
            slow_domains: vec![DomainType::Place],
            slow_domain_limit: 5,
            inter_request_delay: Duration::from_millis(100),
            fallback_band: ConfidenceBand::default(),
        }
    }
}

/// Result of cross-domain generation for one target domain
#[derive(Debug, Clone, PartialEq)]
pub enum DomainOutcome {
    /// Candidates returned by the upstream
    Real(Vec<Candidate>),
    /// Upstream produced nothing usable; manufactured candidates
    Fallback(Vec<Candidate>),
    /// Upstream answered 403 for this domain; skip it
    Restricted,
}

impl DomainOutcome {
    pub fn candidates(&self) -> &[Candidate] {
        match self {
            DomainOutcome::Real(c) | DomainOutcome::Fallback(c) => c,
            DomainOutcome::Restricted => &[],
        }
    }

    pub fn into_candidates(self) -> Vec<Candidate> {
        match self {
            DomainOutcome::Real(c) | DomainOutcome::Fallback(c) => c,
            DomainOutcome::Restricted => Vec::new(),
        }
    }

    pub fn is_real(&self) -> bool {
        matches!(self, DomainOutcome::Real(_))
    }
}

pub struct ResilientUpstreamClient {
    provider: Arc<dyn GraphProvider>,
    retry_policy: RetryPolicy,
    settings: ClientSettings,
}

async fn with_timeout<T, F>(timeout: Duration, fut: F) -> UpstreamResult<T>
where
    F: Future<Output = UpstreamResult<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(UpstreamError::Timeout),
    }
}

impl ResilientUpstreamClient {
    pub fn new(
        provider: Arc<dyn GraphProvider>,
        retry_policy: RetryPolicy,
        settings: ClientSettings,
    ) -> Self {
        Self {
            provider,
            retry_policy,
            settings,
        }
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }

    /// Resolves a name to upstream entities
    pub async fn search(&self, name: &str, domain: DomainType) -> UpstreamResult<Vec<Entity>> {
        let timeout = self.settings.call_timeout;
        retry_with_backoff("search", &self.retry_policy, || {
            with_timeout(timeout, self.provider.search(name, domain))
        })
        .await
    }

    /// Fetches cultural tags for a resolved entity
    pub async fn insights(&self, entity_id: &str, domain: DomainType) -> UpstreamResult<Vec<CulturalTag>> {
        let timeout = self.settings.call_timeout;
        retry_with_backoff("insights", &self.retry_policy, || {
            with_timeout(timeout, self.provider.insights(entity_id, domain))
        })
        .await
    }

    pub fn is_slow_domain(&self, domain: DomainType) -> bool {
        self.settings.slow_domains.contains(&domain)
    }

    /// Splits domains into (cheap, slow), preserving request order in each
    pub fn schedule(&self, domains: &[DomainType]) -> (Vec<DomainType>, Vec<DomainType>) {
        let mut seen = Vec::new();
        for domain in domains {
            if !seen.contains(domain) {
                seen.push(*domain);
            }
        }
        seen.into_iter().partition(|d| !self.is_slow_domain(*d))
    }

    /// Tag counts to try for `tag_count` input tags, largest first, without repeats
    pub fn ladder_steps(&self, tag_count: usize) -> Vec<usize> {
        let mut steps: Vec<usize> = Vec::new();
        for step in &self.settings.tag_ladder {
            let size = (*step).min(tag_count);
            if size > 0 && !steps.contains(&size) {
                steps.push(size);
            }
        }
        if steps.is_empty() && tag_count > 0 {
            steps.push(tag_count);
        }
        steps
    }

    /// Generates candidates for every requested domain.
    ///
    /// Cheap domains run concurrently with a small stagger between starts;
    /// slow domains run afterwards with a tighter timeout and smaller limit,
    /// so one slow domain cannot starve the others of the shared budget.
    pub async fn cross_domain_recommendations(
        &self,
        tag_ids: &[String],
        domains: &[DomainType],
        limit: usize,
    ) -> BTreeMap<DomainType, DomainOutcome> {
        let deadline = Instant::now() + self.settings.request_budget;
        let (cheap, slow) = self.schedule(domains);

        let cheap_tasks = cheap.iter().enumerate().map(|(index, domain)| {
            let stagger = self.settings.inter_request_delay * index as u32;
            async move {
                if !stagger.is_zero() {
                    tokio::time::sleep(stagger).await;
                }
                let outcome = self
                    .recommend_domain(tag_ids, *domain, limit, self.settings.call_timeout, deadline)
                    .await;
                (*domain, outcome)
            }
        });

        let mut outcomes: BTreeMap<DomainType, DomainOutcome> =
            join_all(cheap_tasks).await.into_iter().collect();

        for domain in slow {
            let slow_limit = limit.min(self.settings.slow_domain_limit).max(1);
            let outcome = self
                .recommend_domain(
                    tag_ids,
                    domain,
                    slow_limit,
                    self.settings.slow_domain_timeout,
                    deadline,
                )
                .await;
            outcomes.insert(domain, outcome);
        }

        outcomes
    }

    /// Runs the tag-reduction ladder for one domain
    async fn recommend_domain(
        &self,
        tag_ids: &[String],
        domain: DomainType,
        limit: usize,
        call_timeout: Duration,
        deadline: Instant,
    ) -> DomainOutcome {
        for step in self.ladder_steps(tag_ids.len()) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                tracing::warn!(%domain, "Request budget exhausted before domain completed");
                break;
            }
            let subset = &tag_ids[..step];

            let result = retry_within_deadline("recommendations", &self.retry_policy, deadline, call_timeout, || {
                self.provider.recommendations(subset, domain, limit)
            })
            .await;

            match result {
                Ok(candidates) => {
                    let usable: Vec<Candidate> = candidates
                        .into_iter()
                        .filter(|c| !c.name.trim().is_empty() && c.confidence > 0.0)
                        .map(|mut c| {
                            c.confidence = c.confidence.min(1.0);
                            c
                        })
                        .collect();

                    if !usable.is_empty() {
                        tracing::debug!(
                            %domain,
                            tags = step,
                            candidates = usable.len(),
                            "Cross-domain candidates fetched"
                        );
                        return DomainOutcome::Real(usable);
                    }
                    tracing::warn!(%domain, tags = step, "Upstream returned no usable candidates");
                }
                Err(err) if err.is_access_restricted() => {
                    tracing::warn!(%domain, error = %err, "Access restricted for domain, skipping");
                    return DomainOutcome::Restricted;
                }
                Err(err) => {
                    tracing::warn!(%domain, tags = step, error = %err, "Domain request failed, reducing tags");
                }
            }
        }

        tracing::warn!(%domain, "Tag ladder exhausted, using fallback candidates");
        DomainOutcome::Fallback(fallback_candidates(domain, limit, self.settings.fallback_band))
    }
}

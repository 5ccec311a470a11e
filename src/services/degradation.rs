//! Last-resort recommendation sources
//!
//! Tried in order when a domain has no real candidates: the caller's own
//! history, then what recently succeeded for everyone, then a static catalog
//! that always answers.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::{
    db::CacheStore,
    error::AppResult,
    models::{Candidate, DomainType, RecommendationMap, ANONYMOUS_USER},
    services::{
        fallback::{slug, ConfidenceBand, FALLBACK_ID_PREFIX},
        quality_cache::namespaces,
    },
};

const GLOBAL_HISTORY_KEY: &str = "global";

/// A past successful response, kept for degraded requests
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub input_names: Vec<String>,
    pub recommendations: RecommendationMap,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradationTier {
    History,
    Popularity,
    StaticCatalog,
}

#[derive(Debug, Clone)]
pub struct DegradedResult {
    pub tier: DegradationTier,
    pub candidates: Vec<Candidate>,
}

#[derive(Debug, Clone)]
pub struct DegradationSettings {
    /// Minimum name similarity for a history entry to be reused
    pub min_history_relevance: f64,
    pub popularity_lookback: ChronoDuration,
    pub user_history_cap: usize,
    pub global_history_cap: usize,
    pub user_history_ttl: ChronoDuration,
    pub popularity_band: ConfidenceBand,
    pub catalog_band: ConfidenceBand,
}

impl Default for DegradationSettings {
    fn default() -> Self {
        Self {
            min_history_relevance: 0.3,
            popularity_lookback: ChronoDuration::hours(24),
            user_history_cap: 20,
            global_history_cap: 200,
            user_history_ttl: ChronoDuration::days(7),
            popularity_band: ConfidenceBand { high: 0.5, low: 0.3 },
            catalog_band: ConfidenceBand { high: 0.4, low: 0.3 },
        }
    }
}

fn user_history_key(user_id: &str) -> String {
    format!("user:{}", user_id)
}

/// Best normalized Levenshtein similarity between any pair of names
pub fn name_relevance(inputs: &[String], candidates: &[&str]) -> f64 {
    inputs
        .iter()
        .flat_map(|input| {
            let input = input.trim().to_lowercase();
            candidates
                .iter()
                .map(move |name| strsim::normalized_levenshtein(&input, &name.trim().to_lowercase()))
        })
        .fold(0.0, f64::max)
}

fn static_catalog(domain: DomainType) -> &'static [&'static str] {
    match domain {
        DomainType::Artist => &["The Beatles", "Miles Davis", "David Bowie", "Nina Simone"],
        DomainType::Album => &["Kind of Blue", "OK Computer", "Abbey Road", "Blue"],
        DomainType::Movie => &["The Godfather", "Casablanca", "In the Mood for Love", "Amélie"],
        DomainType::TvShow => &["The Wire", "Breaking Bad", "The Sopranos", "Mad Men"],
        DomainType::Book => &["One Hundred Years of Solitude", "Beloved", "1984", "The Great Gatsby"],
        DomainType::Podcast => &["Serial", "Radiolab", "Reply All", "The Daily"],
        DomainType::VideoGame => &["The Legend of Zelda: Breath of the Wild", "Portal 2", "Journey", "Hades"],
        DomainType::Place => &["Local Night Market", "Neighborhood Bookshop Café", "Independent Cinema", "City Botanical Garden"],
        DomainType::Destination => &["Kyoto", "Lisbon", "Mexico City", "Reykjavík"],
        DomainType::Brand => &["Patagonia", "Muji", "Criterion Collection", "Moleskine"],
        DomainType::Person => &["Hayao Miyazaki", "Toni Morrison", "Brian Eno", "Agnès Varda"],
    }
}

pub struct DegradationChain {
    store: Arc<dyn CacheStore>,
    settings: DegradationSettings,
}

impl DegradationChain {
    pub fn new(store: Arc<dyn CacheStore>, settings: DegradationSettings) -> Self {
        Self { store, settings }
    }

    /// Runs the chain for one domain. Never fails: the static catalog answers last.
    ///
    /// A tier only answers when at least one of its candidates reaches
    /// `min_confidence`; catalog picks are raised to it so they always survive
    /// ranking.
    pub async fn recommend(
        &self,
        user_id: &str,
        input_names: &[String],
        domain: DomainType,
        limit: usize,
        min_confidence: f64,
    ) -> DegradedResult {
        let survives = |candidates: &[Candidate]| candidates.iter().any(|c| c.confidence >= min_confidence);

        match self.from_history(user_id, input_names, domain, limit).await {
            Some(candidates) if survives(&candidates) => {
                tracing::info!(%domain, count = candidates.len(), "Degraded to history match");
                return DegradedResult {
                    tier: DegradationTier::History,
                    candidates,
                };
            }
            Some(_) => tracing::debug!(%domain, "History match below confidence threshold"),
            None => {}
        }

        match self.from_popularity(domain, limit, Utc::now()).await {
            Some(candidates) if survives(&candidates) => {
                tracing::info!(%domain, count = candidates.len(), "Degraded to popular choices");
                return DegradedResult {
                    tier: DegradationTier::Popularity,
                    candidates,
                };
            }
            Some(_) => tracing::debug!(%domain, "Popular choices below confidence threshold"),
            None => {}
        }

        tracing::info!(%domain, "Degraded to static catalog");
        let floor = min_confidence.clamp(0.0, 1.0);
        DegradedResult {
            tier: DegradationTier::StaticCatalog,
            candidates: self
                .from_static_catalog(domain, limit)
                .into_iter()
                .map(|mut c| {
                    c.confidence = c.confidence.max(floor);
                    c
                })
                .collect(),
        }
    }

    /// Reuses the caller's most relevant past result for `domain`
    pub async fn from_history(
        &self,
        user_id: &str,
        input_names: &[String],
        domain: DomainType,
        limit: usize,
    ) -> Option<Vec<Candidate>> {
        if user_id == ANONYMOUS_USER || input_names.is_empty() {
            return None;
        }

        let history = self.load(&user_history_key(user_id)).await;
        let (relevance, entry) = history
            .iter()
            .filter(|entry| entry.recommendations.get(&domain).is_some_and(|recs| !recs.is_empty()))
            .map(|entry| {
                let mut names: Vec<&str> = entry.input_names.iter().map(String::as_str).collect();
                names.extend(entry.recommendations.values().flatten().map(|r| r.name.as_str()));
                (name_relevance(input_names, &names), entry)
            })
            .filter(|(relevance, _)| *relevance >= self.settings.min_history_relevance)
            .max_by(|a, b| a.0.total_cmp(&b.0))?;

        tracing::debug!(%domain, relevance, "History entry matched");
        let candidates = entry
            .recommendations
            .get(&domain)?
            .iter()
            .take(limit)
            .map(|rec| {
                let confidence = (rec.confidence * relevance).clamp(0.01, 1.0);
                Candidate::fallback(rec.id.clone(), rec.name.clone(), domain, confidence, "from your history")
            })
            .collect::<Vec<_>>();

        (!candidates.is_empty()).then_some(candidates)
    }

    /// Most frequent recent `(domain, name)` pairs across all users
    pub async fn from_popularity(
        &self,
        domain: DomainType,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Option<Vec<Candidate>> {
        let cutoff = now - self.settings.popularity_lookback;
        let history = self.load(GLOBAL_HISTORY_KEY).await;

        // lowercase name -> (count, first seen id, display name)
        let mut counts: HashMap<String, (usize, String, String)> = HashMap::new();
        for entry in history.iter().filter(|entry| entry.created_at >= cutoff) {
            for rec in entry.recommendations.get(&domain).into_iter().flatten() {
                counts
                    .entry(rec.name.trim().to_lowercase())
                    .and_modify(|(count, _, _)| *count += 1)
                    .or_insert_with(|| (1, rec.id.clone(), rec.name.clone()));
            }
        }

        if counts.is_empty() {
            return None;
        }

        let mut ranked: Vec<(usize, String, String)> = counts.into_values().collect();
        ranked.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.2.cmp(&b.2)));
        ranked.truncate(limit);

        let max_count = ranked.first().map(|r| r.0).unwrap_or(1).max(1) as f64;
        let band = self.settings.popularity_band;
        Some(
            ranked
                .into_iter()
                .map(|(count, id, name)| {
                    let confidence = band.low + (band.high - band.low) * count as f64 / max_count;
                    Candidate::fallback(id, name, domain, confidence, "popular choice")
                })
                .collect(),
        )
    }

    pub fn from_static_catalog(&self, domain: DomainType, limit: usize) -> Vec<Candidate> {
        let names = static_catalog(domain);
        let count = names.len().min(limit.max(1));
        names
            .iter()
            .take(count)
            .enumerate()
            .map(|(index, name)| {
                Candidate::fallback(
                    format!("{}catalog-{}-{}", FALLBACK_ID_PREFIX, domain, slug(name)),
                    *name,
                    domain,
                    self.settings.catalog_band.at(index, count),
                    "well-known pick",
                )
            })
            .collect()
    }

    /// Appends a successful result to the caller's history and the global list
    pub async fn record(&self, user_id: &str, entry: HistoryEntry) {
        if user_id != ANONYMOUS_USER {
            let ttl = self.settings.user_history_ttl.num_seconds().max(1) as u64;
            if let Err(e) = self
                .push(&user_history_key(user_id), &entry, self.settings.user_history_cap, ttl)
                .await
            {
                tracing::warn!(user_id, error = %e, "Failed to save recommendation history");
            }
        }

        let ttl = self.settings.popularity_lookback.num_seconds().max(1) as u64;
        if let Err(e) = self
            .push(GLOBAL_HISTORY_KEY, &entry, self.settings.global_history_cap, ttl)
            .await
        {
            tracing::warn!(error = %e, "Failed to save global recommendation history");
        }
    }

    /// History list, newest first; read errors count as empty
    async fn load(&self, key: &str) -> Vec<HistoryEntry> {
        match self.store.get(namespaces::HISTORY, key).await {
            Ok(Some(json)) => serde_json::from_str(&json).unwrap_or_else(|e| {
                tracing::warn!(key, error = %e, "Discarding undecodable history");
                Vec::new()
            }),
            Ok(None) => Vec::new(),
            Err(e) => {
                tracing::warn!(key, error = %e, "History read failed");
                Vec::new()
            }
        }
    }

    async fn push(&self, key: &str, entry: &HistoryEntry, cap: usize, ttl_secs: u64) -> AppResult<()> {
        let mut entries = self.load(key).await;
        entries.insert(0, entry.clone());
        entries.truncate(cap);
        self.store
            .set(namespaces::HISTORY, key, serde_json::to_string(&entries)?, ttl_secs)
            .await
    }
}

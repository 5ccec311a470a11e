use std::collections::HashMap;

use crate::models::{Candidate, DomainType, Recommendation};

/// Dedupes, filters and ranks one domain's candidates.
///
/// Duplicates share a lowercased name within the domain; the most confident
/// copy wins. Survivors at or above `min_confidence` are sorted by confidence
/// (name breaks ties) and truncated to `limit`.
pub fn rank_domain(
    domain: DomainType,
    candidates: Vec<Candidate>,
    min_confidence: f64,
    limit: usize,
) -> Vec<Recommendation> {
    let mut best: HashMap<(String, DomainType), Candidate> = HashMap::new();

    for mut candidate in candidates {
        if candidate.domain_type != domain {
            continue;
        }
        candidate.confidence = candidate.confidence.clamp(0.0, 1.0);
        if candidate.confidence <= 0.0 || candidate.confidence < min_confidence {
            continue;
        }

        match best.get_mut(&candidate.dedup_key()) {
            Some(existing) if existing.confidence >= candidate.confidence => {}
            Some(existing) => *existing = candidate,
            None => {
                best.insert(candidate.dedup_key(), candidate);
            }
        }
    }

    let mut ranked: Vec<Recommendation> = best.into_values().collect();
    ranked.sort_by(|a, b| {
        b.confidence
            .total_cmp(&a.confidence)
            .then_with(|| a.name.cmp(&b.name))
    });
    ranked.truncate(limit);
    ranked
}

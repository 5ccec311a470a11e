//! Locally manufactured candidates for domains where the upstream returned
//! nothing usable. They carry `Provenance::Fallback`, ids under
//! [`FALLBACK_ID_PREFIX`], and a confidence band below real results.

use crate::models::{Candidate, DomainType};

/// Ids with this prefix never exist upstream
pub const FALLBACK_ID_PREFIX: &str = "fallback-";

/// Confidence band for manufactured candidates, highest first
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConfidenceBand {
    pub high: f64,
    pub low: f64,
}

impl Default for ConfidenceBand {
    fn default() -> Self {
        Self {
            high: 0.5,
            low: 0.3,
        }
    }
}

impl ConfidenceBand {
    /// Band from two bounds in either order, kept inside `[0, 1]`
    pub fn ordered(a: f64, b: f64) -> Self {
        if a.is_nan() || b.is_nan() {
            return Self::default();
        }
        let high = a.max(b).clamp(0.0, 1.0);
        let low = a.min(b).clamp(0.0, high);
        Self { high, low }
    }

    /// Evenly spaced confidence for position `index` out of `count`
    pub fn at(&self, index: usize, count: usize) -> f64 {
        let (high, low) = (self.high.max(self.low), self.high.min(self.low));
        if count <= 1 {
            return high;
        }
        let step = (high - low) / (count - 1) as f64;
        (high - step * index as f64).clamp(low, high)
    }
}

fn curated_titles(domain: DomainType) -> Option<&'static [&'static str]> {
    let titles: &'static [&'static str] = match domain {
        DomainType::Movie => &[
            "Spirited Away",
            "The Grand Budapest Hotel",
            "Parasite",
            "Before Sunrise",
            "Blade Runner 2049",
        ],
        DomainType::TvShow => &[
            "Fleabag",
            "Twin Peaks",
            "The Bear",
            "Atlanta",
            "Severance",
        ],
        DomainType::Book => &[
            "Norwegian Wood",
            "Never Let Me Go",
            "The Remains of the Day",
            "Station Eleven",
            "The Secret History",
        ],
        DomainType::Artist => &[
            "Björk",
            "Portishead",
            "Nick Drake",
            "Massive Attack",
            "Joni Mitchell",
        ],
        DomainType::Place => &[
            "Neighborhood Ramen Bar",
            "Independent Coffee Roastery",
            "Late-Night Vinyl Bar",
            "Seasonal Farm-to-Table Bistro",
            "Family-Run Dim Sum House",
        ],
        DomainType::Podcast => &[
            "Song Exploder",
            "99% Invisible",
            "Radiolab",
            "This American Life",
            "Heavyweight",
        ],
        _ => return None,
    };
    Some(titles)
}

pub(crate) fn slug(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

/// Manufactures up to `limit` fallback candidates for `domain`.
///
/// Uses the curated list when one exists, otherwise a generic templated list.
pub fn fallback_candidates(domain: DomainType, limit: usize, band: ConfidenceBand) -> Vec<Candidate> {
    let names: Vec<String> = match curated_titles(domain) {
        Some(titles) => titles.iter().take(limit).map(|t| t.to_string()).collect(),
        None => (1..=limit.min(5))
            .map(|n| format!("Popular {} pick #{}", domain.label(), n))
            .collect(),
    };

    let count = names.len();
    names
        .into_iter()
        .enumerate()
        .map(|(index, name)| {
            let id = format!("{}{}-{}", FALLBACK_ID_PREFIX, domain, slug(&name));
            Candidate::fallback(id, name, domain, band.at(index, count), "curated fallback")
        })
        .collect()
}

pub fn is_fallback_id(id: &str) -> bool {
    id.starts_with(FALLBACK_ID_PREFIX)
}

use serde::{Deserialize, Serialize};

use super::DomainType;

/// Where a recommendation came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    /// Returned by the upstream graph
    Real,
    /// Manufactured locally (curated fallback, history, popularity or static catalog)
    Fallback,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RecommendationMetadata {
    pub provenance: Provenance,
    #[serde(default)]
    pub source_tags: Vec<String>,
    /// Short note on how a fallback item was produced (e.g. "popular choice")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotation: Option<String>,
}

/// A ranked cross-domain candidate; also the shape returned to clients
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Recommendation {
    pub id: String,
    pub name: String,
    pub domain_type: DomainType,
    /// Confidence in `(0, 1]`
    pub confidence: f64,
    #[serde(default)]
    pub explanation: String,
    pub metadata: RecommendationMetadata,
}

pub type Candidate = Recommendation;

impl Recommendation {
    pub fn real(
        id: impl Into<String>,
        name: impl Into<String>,
        domain_type: DomainType,
        confidence: f64,
        source_tags: Vec<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            domain_type,
            confidence,
            explanation: String::new(),
            metadata: RecommendationMetadata {
                provenance: Provenance::Real,
                source_tags,
                annotation: None,
            },
        }
    }

    pub fn fallback(
        id: impl Into<String>,
        name: impl Into<String>,
        domain_type: DomainType,
        confidence: f64,
        annotation: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            domain_type,
            confidence,
            explanation: String::new(),
            metadata: RecommendationMetadata {
                provenance: Provenance::Fallback,
                source_tags: Vec::new(),
                annotation: Some(annotation.into()),
            },
        }
    }

    pub fn is_fallback(&self) -> bool {
        self.metadata.provenance == Provenance::Fallback
    }

    /// Deduplication key: lowercased name within a domain
    pub fn dedup_key(&self) -> (String, DomainType) {
        (self.name.trim().to_lowercase(), self.domain_type)
    }
}

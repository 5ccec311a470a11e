use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub mod entity;
pub mod recommendation;
pub mod taste;

pub use entity::{DomainType, Entity};
pub use recommendation::{Candidate, Provenance, Recommendation, RecommendationMetadata};
pub use taste::{merge_themes, CulturalTag, CulturalTheme, TasteProfile};

/// Caller identity used when a request carries no `x-user-id`
pub const ANONYMOUS_USER: &str = "anonymous";

/// One input entity as supplied by the client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityInput {
    pub name: String,
    /// Free-form domain name, validated against `DomainType`
    #[serde(rename = "type")]
    pub entity_type: String,
    /// Upstream id, when the client already knows it
    #[serde(default)]
    pub id: Option<String>,
}

/// Request body for `POST /api/v1/recommendations`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecommendationRequest {
    #[serde(default)]
    pub entities: Vec<EntityInput>,
    #[serde(default)]
    pub domains: Option<Vec<String>>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub include_explanations: Option<bool>,
}

/// Recommendations grouped by target domain
pub type RecommendationMap = BTreeMap<DomainType, Vec<Recommendation>>;

/// Response body for `POST /api/v1/recommendations`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecommendationResponse {
    pub success: bool,
    pub input: TasteProfile,
    pub recommendations: RecommendationMap,
    /// Wall-clock processing time in milliseconds
    pub processing_time: u64,
    /// True when every returned domain was served from cache
    pub cached: bool,
    /// True when any returned domain lacks real upstream candidates
    pub degraded: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_deserialization_defaults() {
        let request: RecommendationRequest = serde_json::from_str(
            r#"{"entities":[{"name":"Radiohead","type":"artist"}],"includeExplanations":true}"#,
        )
        .unwrap();

        assert_eq!(request.entities.len(), 1);
        assert_eq!(request.entities[0].entity_type, "artist");
        assert_eq!(request.entities[0].id, None);
        assert_eq!(request.domains, None);
        assert_eq!(request.limit, None);
        assert_eq!(request.include_explanations, Some(true));
    }

    #[test]
    fn test_request_missing_entities_is_empty() {
        let request: RecommendationRequest = serde_json::from_str("{}").unwrap();
        assert!(request.entities.is_empty());
    }

    #[test]
    fn test_response_map_uses_domain_names_as_keys() {
        let mut recommendations = RecommendationMap::new();
        recommendations.insert(DomainType::TvShow, vec![]);

        let response = RecommendationResponse {
            success: true,
            input: TasteProfile::default(),
            recommendations,
            processing_time: 12,
            cached: false,
            degraded: false,
        };

        let json = serde_json::to_value(&response).unwrap();
        assert!(json["recommendations"]["tv_show"].is_array());
        assert_eq!(json["processingTime"], 12);
    }
}

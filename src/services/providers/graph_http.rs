/// HTTP+JSON cultural-graph provider
///
/// API Flow:
/// 1. Search: /search?query=..&types=urn:entity:{type} → entity ids
/// 2. Tags: /v2/insights?filter.type=urn:tag&signal.interests.entities={id} → tags
/// 3. Cross-domain: /v2/insights?filter.type=urn:entity:{type}&signal.interests.tags=.. → entities
///
/// The service has shipped several response shapes over time (ids under
/// `entity_id` or `id`, scores under `query.affinity`, `affinity`, `score` or
/// `popularity`, results flat or nested), so every field is read defensively.
use crate::{
    models::{Candidate, CulturalTag, DomainType, Entity},
    services::providers::{GraphProvider, UpstreamError, UpstreamResult},
};
use reqwest::Client as HttpClient;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

const SEARCH_TAKE: &str = "5";
const INSIGHT_TAG_TAKE: &str = "25";
const API_KEY_HEADER: &str = "X-Api-Key";
const ID_FIELDS: [&str; 3] = ["entity_id", "id", "tag_id"];

#[derive(Clone)]
pub struct HttpGraphProvider {
    http_client: HttpClient,
    api_key: String,
    api_url: String,
}

impl HttpGraphProvider {
    pub fn new(api_key: String, api_url: String, timeout: Duration) -> UpstreamResult<Self> {
        let http_client = HttpClient::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;

        Ok(Self {
            http_client,
            api_key,
            api_url: api_url.trim_end_matches('/').to_string(),
        })
    }

    async fn get_json(
        &self,
        path: &str,
        query: &[(&str, String)],
        domain: Option<DomainType>,
    ) -> UpstreamResult<Value> {
        let url = format!("{}{}", self.api_url, path);

        let response = self
            .http_client
            .get(&url)
            .header(API_KEY_HEADER, &self.api_key)
            .query(query)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::debug!(
                url = %url,
                status = %status,
                body = %body,
                "Cultural graph request failed"
            );
            return Err(UpstreamError::from_status(status.as_u16(), body, domain));
        }

        let text = response.text().await?;
        serde_json::from_str(&text).map_err(|e| {
            tracing::error!(error = %e, response = %text, "Failed to deserialize graph response");
            UpstreamError::Decode(e.to_string())
        })
    }
}

#[async_trait::async_trait]
impl GraphProvider for HttpGraphProvider {
    async fn search(&self, name: &str, domain: DomainType) -> UpstreamResult<Vec<Entity>> {
        let body = self
            .get_json(
                "/search",
                &[
                    ("query", name.to_string()),
                    ("types", domain.urn()),
                    ("take", SEARCH_TAKE.to_string()),
                ],
                Some(domain),
            )
            .await?;

        let entities = parse_entities(&body, domain);
        tracing::debug!(query = %name, %domain, results = entities.len(), "Entity search completed");
        Ok(entities)
    }

    async fn insights(&self, entity_id: &str, domain: DomainType) -> UpstreamResult<Vec<CulturalTag>> {
        let body = self
            .get_json(
                "/v2/insights",
                &[
                    ("filter.type", "urn:tag".to_string()),
                    ("signal.interests.entities", entity_id.to_string()),
                    ("take", INSIGHT_TAG_TAKE.to_string()),
                ],
                Some(domain),
            )
            .await?;

        let tags = parse_tags(&body);
        tracing::debug!(entity_id = %entity_id, %domain, tags = tags.len(), "Insights fetched");
        Ok(tags)
    }

    async fn recommendations(
        &self,
        tag_ids: &[String],
        domain: DomainType,
        limit: usize,
    ) -> UpstreamResult<Vec<Candidate>> {
        let body = self
            .get_json(
                "/v2/insights",
                &[
                    ("filter.type", domain.urn()),
                    ("signal.interests.tags", tag_ids.join(",")),
                    ("take", limit.to_string()),
                ],
                Some(domain),
            )
            .await?;

        Ok(parse_candidates(&body, domain, tag_ids))
    }

    fn name(&self) -> &'static str {
        "cultural_graph_http"
    }
}

/// Result items, whether the body is a bare array, `{results: [..]}` or
/// `{results: {<nested>: [..]}}`
fn extract_items<'a>(body: &'a Value, nested: &str) -> &'a [Value] {
    let candidates = [
        body.get("results").and_then(|r| r.get(nested)),
        body.get("results"),
        body.get(nested),
        Some(body),
    ];

    candidates
        .into_iter()
        .flatten()
        .find_map(|v| v.as_array())
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

fn pick_string(item: &Value, fields: &[&str]) -> Option<String> {
    fields.iter().find_map(|field| match item.get(*field) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// First score-like field present on the item
fn pick_score(item: &Value) -> Option<f64> {
    item.get("query")
        .and_then(|q| q.get("affinity"))
        .and_then(as_f64)
        .or_else(|| {
            ["affinity", "score", "popularity"]
                .iter()
                .find_map(|field| item.get(*field).and_then(as_f64))
        })
        .filter(|score| score.is_finite())
}

/// Maps a raw score into `(0, 1]`, falling back to a rank-based value
pub fn normalize_confidence(raw: Option<f64>, rank: usize) -> f64 {
    let score = match raw {
        // Some deployments report percentages
        Some(s) if s > 1.0 && s <= 100.0 => s / 100.0,
        Some(s) => s,
        None => 0.9 - 0.05 * rank as f64,
    };
    score.clamp(0.01, 1.0)
}

fn parse_domain_list(item: &Value) -> BTreeSet<DomainType> {
    let mut types = BTreeSet::new();
    for field in ["types", "type"] {
        match item.get(field) {
            Some(Value::Array(values)) => {
                types.extend(values.iter().filter_map(|v| v.as_str()?.parse::<DomainType>().ok()));
            }
            Some(Value::String(s)) => {
                if let Ok(domain) = s.parse() {
                    types.insert(domain);
                }
            }
            _ => {}
        }
    }
    types
}

pub fn parse_entities(body: &Value, domain: DomainType) -> Vec<Entity> {
    extract_items(body, "entities")
        .iter()
        .filter_map(|item| {
            let id = pick_string(item, &ID_FIELDS)?;
            let name = pick_string(item, &["name", "title"])?;

            let mut metadata = HashMap::new();
            if let Some(popularity) = item.get("popularity").filter(|v| !v.is_null()) {
                metadata.insert("popularity".to_string(), popularity.clone());
            }

            Some(Entity {
                id: Some(id),
                name,
                domain_type: domain,
                metadata,
            })
        })
        .collect()
}

pub fn parse_tags(body: &Value) -> Vec<CulturalTag> {
    extract_items(body, "tags")
        .iter()
        .enumerate()
        .filter_map(|(rank, item)| {
            let tag_id = pick_string(item, &ID_FIELDS)?;
            let name = pick_string(item, &["name", "label"])?;
            Some(CulturalTag {
                tag_id,
                name,
                applicable_types: parse_domain_list(item),
                subtype: pick_string(item, &["subtype"]),
                affinity: normalize_confidence(pick_score(item), rank),
            })
        })
        .collect()
}

pub fn parse_candidates(body: &Value, domain: DomainType, tag_ids: &[String]) -> Vec<Candidate> {
    extract_items(body, "entities")
        .iter()
        .enumerate()
        .filter_map(|(rank, item)| {
            let name = pick_string(item, &["name", "title"])?;
            let id = pick_string(item, &ID_FIELDS)
                .unwrap_or_else(|| format!("{}-{}", domain, name.to_lowercase().replace(' ', "-")));
            Some(Candidate::real(
                id,
                name,
                domain,
                normalize_confidence(pick_score(item), rank),
                tag_ids.to_vec(),
            ))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_entities_flat_results() {
        let body = json!({
            "results": [
                {"entity_id": "E1", "name": "Radiohead", "popularity": 0.98},
                {"id": "E2", "name": "Radiohead Tribute"},
                {"name": "No id"}
            ]
        });

        let entities = parse_entities(&body, DomainType::Artist);
        assert_eq!(entities.len(), 2);
        assert_eq!(entities[0].id.as_deref(), Some("E1"));
        assert_eq!(entities[0].metadata["popularity"], json!(0.98));
        assert_eq!(entities[1].id.as_deref(), Some("E2"));
        assert_eq!(entities[1].domain_type, DomainType::Artist);
    }

    #[test]
    fn test_parse_tags_nested_results_and_score_variants() {
        let body = json!({
            "results": {
                "tags": [
                    {"tag_id": "t1", "name": "Melancholy", "types": ["urn:entity:movie", "urn:entity:book"], "query": {"affinity": 0.91}},
                    {"id": "t2", "name": "Experimental", "subtype": "urn:tag:genre", "score": 0.5},
                    {"id": "t3", "name": "Art Rock"}
                ]
            }
        });

        let tags = parse_tags(&body);
        assert_eq!(tags.len(), 3);
        assert_eq!(tags[0].affinity, 0.91);
        assert!(tags[0].applicable_types.contains(&DomainType::Movie));
        assert!(tags[0].applicable_types.contains(&DomainType::Book));
        assert_eq!(tags[1].subtype.as_deref(), Some("urn:tag:genre"));
        assert_eq!(tags[1].affinity, 0.5);
        // rank-based default for the third item
        assert!((tags[2].affinity - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_parse_candidates_normalizes_confidence() {
        let body = json!({
            "results": {
                "entities": [
                    {"entity_id": "m1", "name": "Arrival", "query": {"affinity": "0.87"}},
                    {"entity_id": "m2", "name": "Her", "popularity": 64},
                    {"entity_id": "m3", "name": "Zero", "affinity": 0.0},
                    {"entity_id": "m4"}
                ]
            }
        });

        let tags = vec!["t1".to_string()];
        let candidates = parse_candidates(&body, DomainType::Movie, &tags);
        assert_eq!(candidates.len(), 3);
        assert_eq!(candidates[0].confidence, 0.87);
        assert_eq!(candidates[1].confidence, 0.64);
        assert_eq!(candidates[2].confidence, 0.01);
        assert!(candidates.iter().all(|c| !c.is_fallback()));
        assert_eq!(candidates[0].metadata.source_tags, tags);
    }

    #[test]
    fn test_extract_items_handles_unexpected_shapes() {
        assert!(parse_entities(&json!({"results": "nope"}), DomainType::Book).is_empty());
        assert!(parse_tags(&json!(null)).is_empty());
        assert_eq!(
            parse_entities(&json!([{"id": "b1", "name": "Dune"}]), DomainType::Book).len(),
            1
        );
    }

    #[test]
    fn test_normalize_confidence_bounds() {
        assert_eq!(normalize_confidence(Some(1.5), 0), 0.015);
        assert_eq!(normalize_confidence(Some(250.0), 0), 1.0);
        assert_eq!(normalize_confidence(Some(-3.0), 0), 0.01);
        assert_eq!(normalize_confidence(None, 100), 0.01);
    }
}

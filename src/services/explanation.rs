//! Natural-language justifications for recommendations
//!
//! The text-generation collaborator is consumed through a batch contract.
//! Anything it fails to produce, or filters, is replaced with a deterministic
//! template naming the recommendation and the top shared theme.

use reqwest::Client as HttpClient;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{
    error::AppResult,
    models::{Recommendation, RecommendationMap, TasteProfile},
    services::providers::UpstreamError,
};

const SHARED_THEME_COUNT: usize = 3;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExplanationRequest {
    pub input_entity: String,
    pub recommended_entity: String,
    pub shared_themes: Vec<String>,
    pub affinity_score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExplanationResponse {
    pub explanation: String,
    #[serde(default)]
    pub confidence: f64,
    /// Set when the collaborator's content filter suppressed the text
    #[serde(default)]
    pub filtered: bool,
}

/// Text-generation collaborator, one response per request in the same order
#[async_trait::async_trait]
pub trait Explainer: Send + Sync {
    async fn explain(&self, batch: &[ExplanationRequest]) -> AppResult<Vec<ExplanationResponse>>;

    fn name(&self) -> &'static str;
}

/// Deterministic explanation used whenever generated text is unavailable
pub fn template_explanation(request: &ExplanationRequest) -> String {
    match request.shared_themes.first() {
        Some(theme) => format!(
            "Because you enjoy {}, {} shares your taste for {}.",
            request.input_entity, request.recommended_entity, theme
        ),
        None => format!(
            "Because you enjoy {}, {} is a close match for your taste.",
            request.input_entity, request.recommended_entity
        ),
    }
}

/// Offline explainer producing only templated text
#[derive(Debug, Clone, Default)]
pub struct TemplateExplainer;

#[async_trait::async_trait]
impl Explainer for TemplateExplainer {
    async fn explain(&self, batch: &[ExplanationRequest]) -> AppResult<Vec<ExplanationResponse>> {
        Ok(batch
            .iter()
            .map(|request| ExplanationResponse {
                explanation: template_explanation(request),
                confidence: request.affinity_score,
                filtered: false,
            })
            .collect())
    }

    fn name(&self) -> &'static str {
        "template"
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ExplanationBatch {
    Wrapped { explanations: Vec<ExplanationResponse> },
    Bare(Vec<ExplanationResponse>),
}

#[derive(Clone)]
pub struct HttpExplainer {
    http_client: HttpClient,
    api_url: String,
    api_key: Option<String>,
}

impl HttpExplainer {
    pub fn new(api_url: String, api_key: Option<String>, timeout: Duration) -> AppResult<Self> {
        let http_client = HttpClient::builder().timeout(timeout).build()?;
        Ok(Self {
            http_client,
            api_url,
            api_key,
        })
    }
}

#[async_trait::async_trait]
impl Explainer for HttpExplainer {
    async fn explain(&self, batch: &[ExplanationRequest]) -> AppResult<Vec<ExplanationResponse>> {
        let mut request = self
            .http_client
            .post(&self.api_url)
            .json(&serde_json::json!({ "requests": batch }));
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamError::from_status(status.as_u16(), body, None).into());
        }

        let batch = match response.json::<ExplanationBatch>().await? {
            ExplanationBatch::Wrapped { explanations } => explanations,
            ExplanationBatch::Bare(explanations) => explanations,
        };
        Ok(batch)
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

/// Theme names the recommendation shares with the profile, falling back to
/// the profile's strongest themes
pub fn shared_themes(recommendation: &Recommendation, profile: &TasteProfile) -> Vec<String> {
    let matched: Vec<String> = recommendation
        .metadata
        .source_tags
        .iter()
        .filter_map(|tag_id| profile.theme_by_tag_id(tag_id))
        .map(|theme| theme.name.clone())
        .take(SHARED_THEME_COUNT)
        .collect();

    if !matched.is_empty() {
        return matched;
    }
    profile
        .top_themes(SHARED_THEME_COUNT)
        .iter()
        .map(|theme| theme.name.clone())
        .collect()
}

/// Fills `explanation` on every recommendation. Never fails.
pub async fn explain_recommendations(
    explainer: &dyn Explainer,
    profile: &TasteProfile,
    recommendations: &mut RecommendationMap,
) {
    let input_entity = match profile.input_entities.as_slice() {
        [] => "your picks".to_string(),
        [only] => only.name.clone(),
        [first, second, ..] => format!("{} and {}", first.name, second.name),
    };

    let requests: Vec<ExplanationRequest> = recommendations
        .values()
        .flatten()
        .map(|rec| ExplanationRequest {
            input_entity: input_entity.clone(),
            recommended_entity: rec.name.clone(),
            shared_themes: shared_themes(rec, profile),
            affinity_score: rec.confidence,
        })
        .collect();

    if requests.is_empty() {
        return;
    }

    let responses = match explainer.explain(&requests).await {
        Ok(responses) => responses,
        Err(e) => {
            tracing::warn!(explainer = explainer.name(), error = %e, "Explanation call failed, using templates");
            Vec::new()
        }
    };

    let mut substituted = 0usize;
    let targets = recommendations.values_mut().flatten();
    for (index, (rec, request)) in targets.zip(requests.iter()).enumerate() {
        rec.explanation = match responses.get(index) {
            Some(response) if !response.filtered && !response.explanation.trim().is_empty() => {
                response.explanation.trim().to_string()
            }
            _ => {
                substituted += 1;
                template_explanation(request)
            }
        };
    }

    if substituted > 0 && explainer.name() != "template" {
        tracing::warn!(substituted, total = requests.len(), "Substituted templated explanations");
    }
}

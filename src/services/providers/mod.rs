//! Cultural-graph provider abstraction
//!
//! A provider performs exactly one upstream round trip per call. Retries,
//! timeouts, tag reduction and fallbacks are layered on top by
//! `ResilientUpstreamClient`, so providers stay thin and easy to fake.
use crate::models::{Candidate, CulturalTag, DomainType, Entity};

pub mod graph_http;

pub use graph_http::HttpGraphProvider;

/// Failure of a single upstream round trip
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum UpstreamError {
    #[error("upstream returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("upstream call timed out")]
    Timeout,

    #[error("upstream transport error: {0}")]
    Transport(String),

    #[error("failed to decode upstream response: {0}")]
    Decode(String),

    #[error("access restricted for domain {domain}")]
    AccessRestricted { domain: String },
}

impl UpstreamError {
    /// Only server errors and throttling are worth retrying. Timeouts fail
    /// fast so one slow call cannot eat the whole request budget.
    pub fn is_retryable(&self) -> bool {
        match self {
            UpstreamError::Status { status, .. } => *status == 429 || (500..600).contains(status),
            _ => false,
        }
    }

    pub fn is_access_restricted(&self) -> bool {
        matches!(self, UpstreamError::AccessRestricted { .. })
    }

    /// Classifies a non-success HTTP status
    pub fn from_status(status: u16, body: String, domain: Option<DomainType>) -> Self {
        if status == 403 {
            return UpstreamError::AccessRestricted {
                domain: domain.map(|d| d.to_string()).unwrap_or_else(|| "unknown".into()),
            };
        }
        UpstreamError::Status { status, body }
    }
}

impl From<reqwest::Error> for UpstreamError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            UpstreamError::Timeout
        } else if err.is_decode() {
            UpstreamError::Decode(err.to_string())
        } else {
            UpstreamError::Transport(err.to_string())
        }
    }
}

pub type UpstreamResult<T> = Result<T, UpstreamError>;

/// One upstream cultural-graph service
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait GraphProvider: Send + Sync {
    /// Resolves a name to upstream entities of the given type
    async fn search(&self, name: &str, domain: DomainType) -> UpstreamResult<Vec<Entity>>;

    /// Fetches cultural tags for a resolved entity
    async fn insights(&self, entity_id: &str, domain: DomainType) -> UpstreamResult<Vec<CulturalTag>>;

    /// Fetches candidates of one target domain that match the given tags
    async fn recommendations(
        &self,
        tag_ids: &[String],
        domain: DomainType,
        limit: usize,
    ) -> UpstreamResult<Vec<Candidate>>;

    /// Provider name for logging and debugging
    fn name(&self) -> &'static str;
}

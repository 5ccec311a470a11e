use axum::{
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde_json::json;

use crate::services::providers::UpstreamError;

/// Application-level errors
#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Rate limit exceeded, retry after {retry_after}s")]
    RateLimited {
        limit: u32,
        remaining: u32,
        reset_time: DateTime<Utc>,
        retry_after: u64,
    },

    #[error("Upstream error: {0}")]
    Upstream(#[from] UpstreamError),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal server error: {0}")]
    Internal(String),
}

/// Standard `X-RateLimit-*` headers
pub fn rate_limit_headers(limit: u32, remaining: u32, reset_time: DateTime<Utc>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("x-ratelimit-limit", HeaderValue::from(limit));
    headers.insert("x-ratelimit-remaining", HeaderValue::from(remaining));
    headers.insert("x-ratelimit-reset", HeaderValue::from(reset_time.timestamp()));
    headers
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if let AppError::RateLimited {
            limit,
            remaining,
            reset_time,
            retry_after,
        } = self
        {
            let mut headers = rate_limit_headers(limit, remaining, reset_time);
            headers.insert("retry-after", HeaderValue::from(retry_after));
            let body = Json(json!({
                "error": "Rate limit exceeded",
                "limit": limit,
                "remaining": remaining,
                "resetTime": reset_time,
                "retryAfter": retry_after,
            }));
            return (StatusCode::TOO_MANY_REQUESTS, headers, body).into_response();
        }

        let (status, message) = match self {
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Upstream(_) | AppError::HttpClient(_) => {
                (StatusCode::BAD_GATEWAY, self.to_string())
            }
            AppError::Cache(_)
            | AppError::Redis(_)
            | AppError::Serialization(_)
            | AppError::Internal(_)
            | AppError::RateLimited { .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string())
            }
        };

        let body = Json(json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

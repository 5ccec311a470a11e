use axum::{extract::State, Extension, Json};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::{
    error::AppResult,
    middleware::RequestContext,
    routes::AppState,
    services::{orchestrator::RECOMMENDATIONS_ENDPOINT, rate_limiter::RateLimitStatus},
};

/// Current admission status for the caller; does not count as a request
pub async fn status(
    State(state): State<Arc<AppState>>,
    Extension(context): Extension<RequestContext>,
) -> Json<RateLimitStatus> {
    Json(
        state
            .rate_limiter
            .check_limit(&context.user_id, RECOMMENDATIONS_ENDPOINT)
            .await,
    )
}

/// Administrative reset of the caller's counters
pub async fn reset(
    State(state): State<Arc<AppState>>,
    Extension(context): Extension<RequestContext>,
) -> AppResult<Json<Value>> {
    state
        .rate_limiter
        .reset(&context.user_id, RECOMMENDATIONS_ENDPOINT)
        .await?;

    tracing::info!(request_id = %context.request_id, user_id = %context.user_id, "Rate limit reset");
    Ok(Json(json!({ "reset": true, "userId": context.user_id })))
}

use axum::{
    extract::{rejection::JsonRejection, State},
    http::HeaderMap,
    Extension, Json,
};
use std::sync::Arc;

use crate::{
    error::{rate_limit_headers, AppError, AppResult},
    middleware::RequestContext,
    models::{RecommendationRequest, RecommendationResponse},
    routes::AppState,
};

/// Handler for the recommendations endpoint
pub async fn recommend(
    State(state): State<Arc<AppState>>,
    Extension(context): Extension<RequestContext>,
    payload: Result<Json<RecommendationRequest>, JsonRejection>,
) -> AppResult<(HeaderMap, Json<RecommendationResponse>)> {
    let Json(request) = payload.map_err(|e| AppError::Validation(e.body_text()))?;
    let request_id = context.request_id();

    tracing::info!(
        request_id = %request_id,
        user_id = %context.user_id,
        entity_count = request.entities.len(),
        "Processing recommendation request"
    );

    let outcome = state
        .orchestrator
        .recommend(&context.user_id, &request_id, request)
        .await?;

    let headers = if outcome.rate_limit.enforced {
        rate_limit_headers(
            outcome.rate_limit.limit,
            outcome.rate_limit.remaining.saturating_sub(1),
            outcome.rate_limit.reset_time,
        )
    } else {
        HeaderMap::new()
    };

    Ok((headers, Json(outcome.response)))
}

use axum::{
    extract::{Path, State},
    Extension, Json,
};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::{
    error::{AppError, AppResult},
    middleware::RequestContext,
    routes::AppState,
    services::quality_cache::namespaces,
};

/// Clears one cache namespace
pub async fn clear_namespace(
    State(state): State<Arc<AppState>>,
    Extension(context): Extension<RequestContext>,
    Path(namespace): Path<String>,
) -> AppResult<Json<Value>> {
    if !namespaces::CLEARABLE.contains(&namespace.as_str()) {
        return Err(AppError::Validation(format!("Unknown cache namespace: {}", namespace)));
    }

    let removed = state.cache.clear_namespace(&namespace).await?;
    tracing::info!(request_id = %context.request_id, namespace = %namespace, removed, "Cache namespace cleared");

    Ok(Json(json!({ "namespace": namespace, "removed": removed })))
}

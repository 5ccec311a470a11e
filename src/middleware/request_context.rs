use axum::{
    body::Body,
    extract::Request,
    http::HeaderValue,
    middleware::Next,
    response::Response,
};
use uuid::Uuid;

use crate::models::ANONYMOUS_USER;

/// HTTP header name for request ID
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// HTTP header carrying the caller identity
pub const USER_ID_HEADER: &str = "x-user-id";

const MAX_USER_ID_LEN: usize = 128;

/// Per-request identity stored in request extensions
#[derive(Clone, Debug)]
pub struct RequestContext {
    pub request_id: Uuid,
    pub user_id: String,
}

impl RequestContext {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            user_id: user_id.into(),
        }
    }

    pub fn request_id(&self) -> String {
        self.request_id.to_string()
    }

    /// Builds the context from incoming headers.
    ///
    /// A valid UUID `x-request-id` is kept, anything else is replaced. Missing,
    /// blank or oversized `x-user-id` values become the anonymous user.
    pub fn from_request(request: &Request) -> Self {
        let headers = request.headers();
        let request_id = headers
            .get(REQUEST_ID_HEADER)
            .and_then(|h| h.to_str().ok())
            .and_then(|s| Uuid::parse_str(s.trim()).ok())
            .unwrap_or_else(Uuid::new_v4);

        let user_id = headers
            .get(USER_ID_HEADER)
            .and_then(|h| h.to_str().ok())
            .map(str::trim)
            .filter(|s| !s.is_empty() && s.len() <= MAX_USER_ID_LEN)
            .unwrap_or(ANONYMOUS_USER)
            .to_string();

        Self { request_id, user_id }
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new(ANONYMOUS_USER)
    }
}

/// Attaches a `RequestContext` to the request extensions and echoes both
/// identifiers on the response.
pub async fn request_context_middleware(mut request: Request, next: Next) -> Response {
    let context = RequestContext::from_request(&request);
    request.extensions_mut().insert(context.clone());

    let mut response = next.run(request).await;

    if let Ok(value) = HeaderValue::from_str(&context.request_id()) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    if let Ok(value) = HeaderValue::from_str(&context.user_id) {
        response.headers_mut().insert(USER_ID_HEADER, value);
    }

    response
}

/// Tracing span carrying the request context
pub fn make_span_with_request_context(request: &Request<Body>) -> tracing::Span {
    let (request_id, user_id) = request
        .extensions()
        .get::<RequestContext>()
        .map(|ctx| (ctx.request_id(), ctx.user_id.clone()))
        .unwrap_or_else(|| ("unknown".to_string(), ANONYMOUS_USER.to_string()));

    tracing::info_span!(
        "http_request",
        method = %request.method(),
        uri = %request.uri(),
        request_id = %request_id,
        user_id = %user_id,
    )
}

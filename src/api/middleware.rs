/// Session authentication and request metrics middleware
use crate::{context::AppContext, error::IdpError, metrics, session::VerifiedSession};
use axum::{
    extract::{MatchedPath, Request, State},
    http::{HeaderMap, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use std::time::Instant;

/// Response header carrying a renewed session token
pub const SESSION_TOKEN_HEADER: &str = "x-session-token";

/// Extract bearer token from Authorization header
pub fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty())
}

/// Verify the session token and stash the session in request extensions
///
/// When verification renewed the session, the new token is returned in the
/// `x-session-token` response header unless the handler already set one.
pub async fn require_session(
    State(ctx): State<AppContext>,
    mut req: Request,
    next: Next,
) -> Result<Response, IdpError> {
    let token = extract_bearer_token(req.headers())
        .ok_or_else(|| IdpError::Authentication("Missing authorization header".to_string()))?;

    let verified = ctx.sessions.verify(&token).await?;
    let renewed = verified.renewed_token.clone();
    req.extensions_mut().insert(Arc::new(verified));

    let mut response = next.run(req).await;
    if response.headers().contains_key(SESSION_TOKEN_HEADER) {
        return Ok(response);
    }
    if let Some(token) = renewed {
        match HeaderValue::from_str(&token) {
            Ok(value) => {
                response.headers_mut().insert(SESSION_TOKEN_HEADER, value);
            }
            Err(e) => tracing::error!("Renewed session token is not a valid header: {}", e),
        }
    }
    Ok(response)
}

/// Count and time every request by its route template
pub async fn track_metrics(req: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().to_string();
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());

    let response = next.run(req).await.into_response();

    metrics::record_http_request(
        &method,
        &path,
        response.status().as_u16(),
        start.elapsed().as_secs_f64(),
    );
    response
}

/// Pull the verified session put in place by [`require_session`]
pub(crate) fn verified_session(req_extensions: &axum::http::Extensions) -> Option<Arc<VerifiedSession>> {
    req_extensions.get::<Arc<VerifiedSession>>().cloned()
}

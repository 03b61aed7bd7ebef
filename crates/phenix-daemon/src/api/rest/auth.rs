//! Request authentication
//!
//! Resolves the caller to a [`RequestContext`] and stores it in the request
//! extensions for handlers to pick up. The token is read from the
//! `Authorization: Bearer` header, or from a `token` query parameter for
//! clients (browsers opening a WebSocket) that cannot set headers.

use super::state::AppState;
use crate::error::ApiError;
use axum::{
    extract::{Query, Request, State},
    http::{header, HeaderMap},
    middleware::Next,
    response::Response,
};
use phenix_control::RequestContext;
use serde::Deserialize;
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
struct TokenQuery {
    token: String,
}

/// Attach the caller's [`RequestContext`] or reject with 401
pub async fn require_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let ctx = if state.auth_enabled {
        let token = request_token(&req)
            .ok_or_else(|| ApiError::Unauthorized("missing bearer token".to_string()))?;

        match state.plane.authenticate(&token).await? {
            Some(ctx) => ctx,
            None => {
                warn!(path = %req.uri().path(), "Rejected unknown token");
                return Err(ApiError::Unauthorized("invalid token".to_string()));
            }
        }
    } else {
        RequestContext::anonymous_admin()
    };

    debug!(user = %ctx.user, request_id = %ctx.request_id, "Request authenticated");

    req.extensions_mut().insert(ctx);
    Ok(next.run(req).await)
}

fn request_token(req: &Request) -> Option<String> {
    bearer_token(req.headers()).or_else(|| {
        Query::<TokenQuery>::try_from_uri(req.uri())
            .ok()
            .map(|Query(query)| query.token)
            .filter(|token| !token.is_empty())
    })
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?.trim();
    (!token.is_empty()).then(|| token.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::HeaderValue;

    #[test]
    fn test_bearer_header() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        assert_eq!(bearer_token(&headers).as_deref(), Some("abc"));
    }

    #[test]
    fn test_query_token_fallback() {
        let req = Request::builder()
            .uri("/api/v1/ws?token=t0k%20en")
            .body(Body::empty())
            .unwrap();
        assert_eq!(request_token(&req).as_deref(), Some("t0k en"));

        let req = Request::builder()
            .uri("/api/v1/ws?token=")
            .body(Body::empty())
            .unwrap();
        assert_eq!(request_token(&req), None);
    }

    #[test]
    fn test_header_wins_over_query() {
        let req = Request::builder()
            .uri("/api/v1/experiments?token=query")
            .header(header::AUTHORIZATION, "Bearer header")
            .body(Body::empty())
            .unwrap();
        assert_eq!(request_token(&req).as_deref(), Some("header"));
    }
}

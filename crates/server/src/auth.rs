//! Allowed-user gate.
//!
//! The service runs behind an authenticating proxy that forwards the user's
//! identity. When `ALLOWED_USERS` is set, only those users get through.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::api::QueryErrorResponse;
use crate::state::AppState;

const USER_HEADERS: &[&str] = &["x-forwarded-email", "x-forwarded-user"];

/// Identity forwarded by the proxy, available to handlers as an extension.
#[derive(Debug, Clone, Default)]
pub struct ForwardedUser(pub Option<String>);

pub fn forwarded_user(headers: &HeaderMap) -> Option<String> {
    USER_HEADERS.iter().find_map(|name| {
        headers
            .get(*name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(String::from)
    })
}

pub async fn require_allowed_user(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Response {
    let user = forwarded_user(request.headers());
    if !state.auth.is_allowed(user.as_deref()) {
        tracing::warn!(user = user.as_deref().unwrap_or("(anonymous)"), "request from user not in allow list");
        return (
            StatusCode::FORBIDDEN,
            Json(QueryErrorResponse {
                error: "Access denied".into(),
            }),
        )
            .into_response();
    }
    request.extensions_mut().insert(ForwardedUser(user));
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_forwarded_user_prefers_email() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-user", HeaderValue::from_static("alice"));
        headers.insert("x-forwarded-email", HeaderValue::from_static("alice@example.com"));
        assert_eq!(forwarded_user(&headers).as_deref(), Some("alice@example.com"));
    }

    #[test]
    fn test_forwarded_user_ignores_blank() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-email", HeaderValue::from_static("  "));
        headers.insert("x-forwarded-user", HeaderValue::from_static("bob"));
        assert_eq!(forwarded_user(&headers).as_deref(), Some("bob"));
        assert_eq!(forwarded_user(&HeaderMap::new()), None);
    }
}

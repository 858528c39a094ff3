use axum::{
    extract::{Query, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use std::sync::Arc;
use tracing::warn;

/// API keys accepted by the management surface. Empty = no auth required.
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    pub api_keys: Vec<String>,
}

impl AuthConfig {
    pub fn new(api_keys: Vec<String>) -> Self {
        Self { api_keys }
    }

    pub fn is_enabled(&self) -> bool {
        !self.api_keys.is_empty()
    }

    fn accepts(&self, key: &str) -> bool {
        self.api_keys.iter().any(|k| k == key)
    }
}

#[derive(serde::Deserialize, Default)]
pub struct AuthQuery {
    pub api_key: Option<String>,
}

/// Validates the API key from `Authorization: Bearer <key>`, then
/// `X-Api-Key`, then `?api_key=<key>`.
pub async fn auth_middleware(
    State(auth): State<Arc<AuthConfig>>,
    headers: HeaderMap,
    query: Query<AuthQuery>,
    request: Request,
    next: Next,
) -> Response {
    if !auth.is_enabled() {
        return next.run(request).await;
    }

    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .map(str::to_string)
    };
    let key = header("authorization")
        .and_then(|v| v.strip_prefix("Bearer ").map(str::to_string))
        .or_else(|| header("x-api-key"))
        .or_else(|| query.api_key.clone());

    match key {
        Some(k) if auth.accepts(&k) => next.run(request).await,
        Some(_) => {
            warn!(path = %request.uri().path(), "Rejected request: invalid API key");
            unauthorized("Invalid API key")
        }
        None => {
            warn!(path = %request.uri().path(), "Rejected request: missing API key");
            unauthorized("API key required")
        }
    }
}

fn unauthorized(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({"error": "unauthorized", "message": message})),
    )
        .into_response()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::{body::Body, http::StatusCode, routing::get, Router};
    use tower::ServiceExt;

    fn guarded() -> Router {
        let auth = Arc::new(AuthConfig::new(vec!["key123".to_string()]));
        Router::new()
            .route("/ping", get(|| async { "pong" }))
            .layer(axum::middleware::from_fn_with_state(auth, auth_middleware))
    }

    async fn status_of(request: Request) -> StatusCode {
        guarded().oneshot(request).await.unwrap().status()
    }

    #[test]
    fn test_auth_config_disabled() {
        assert!(!AuthConfig::default().is_enabled());
    }

    #[test]
    fn test_auth_config_matches_exact_key() {
        let config = AuthConfig::new(vec!["key123".to_string()]);
        assert!(config.is_enabled());
        assert!(config.accepts("key123"));
        assert!(!config.accepts("key12"));
    }

    #[tokio::test]
    async fn test_middleware_accepts_every_key_location() {
        let bearer = axum::http::Request::builder()
            .uri("/ping")
            .header("authorization", "Bearer key123")
            .body(Body::empty())
            .unwrap();
        assert_eq!(status_of(bearer).await, StatusCode::OK);

        let header = axum::http::Request::builder()
            .uri("/ping")
            .header("x-api-key", "key123")
            .body(Body::empty())
            .unwrap();
        assert_eq!(status_of(header).await, StatusCode::OK);

        let query = axum::http::Request::builder()
            .uri("/ping?api_key=key123")
            .body(Body::empty())
            .unwrap();
        assert_eq!(status_of(query).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_middleware_rejects_missing_or_wrong_key() {
        let missing = axum::http::Request::builder().uri("/ping").body(Body::empty()).unwrap();
        assert_eq!(status_of(missing).await, StatusCode::UNAUTHORIZED);

        let wrong = axum::http::Request::builder()
            .uri("/ping")
            .header("authorization", "Bearer nope")
            .body(Body::empty())
            .unwrap();
        assert_eq!(status_of(wrong).await, StatusCode::UNAUTHORIZED);
    }
}

//! Rate limiting middleware and routes.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{any, get},
    Json, Router,
};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::ratelimit::{Decision, RateLimiter};

/// Header carrying the caller's access token.
pub const API_KEY_HEADER: &str = "api_key";

/// Proxy header whose raw value replaces the remote address.
pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

/// Body sent with every 429, whatever the rejection reason.
pub const REJECTION_BODY: &str = r#"{"error": "you have reached the maximum number of requests or actions allowed within a certain time frame"}"#;

const HELLO_BODY: &str = r#"{"message": "Hello, World!"}"#;

/// Identity strings extracted from a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity {
    pub address: String,
    /// Empty when the request carried no token
    pub token: String,
}

/// Extract the caller's address and token.
///
/// A non-empty `X-Forwarded-For` replaces the socket address wholesale; the
/// proxy chain is not split. The `API_KEY` value is taken verbatim.
pub fn caller_identity(headers: &HeaderMap, remote: Option<SocketAddr>) -> CallerIdentity {
    let forwarded = headers
        .get(FORWARDED_FOR_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty());

    let address = match (forwarded, remote) {
        (Some(forwarded), _) => forwarded.to_string(),
        (None, Some(remote)) => remote.ip().to_string(),
        (None, None) => String::new(),
    };

    let token = headers
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();

    CallerIdentity { address, token }
}

/// Admit the request or answer 429.
pub async fn rate_limit(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    let remote = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let identity = caller_identity(request.headers(), remote);

    match limiter.decide(&identity.address, &identity.token).await {
        Decision::Allow => next.run(request).await,
        Decision::Reject(reason) => {
            debug!(
                address = %identity.address,
                has_token = !identity.token.is_empty(),
                reason = %reason,
                "Request rejected"
            );
            too_many_requests()
        }
    }
}

fn too_many_requests() -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        [(header::CONTENT_TYPE, "application/json")],
        REJECTION_BODY,
    )
        .into_response()
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
}

/// Health check endpoint. Not rate limited.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        service: "turnstile",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn hello() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "application/json")], HELLO_BODY)
}

/// Build the application router with every route except `/health` behind
/// the limiter.
pub fn router(limiter: Arc<RateLimiter>) -> Router {
    let limited = Router::new()
        .route("/", any(hello))
        .fallback(hello)
        .layer(middleware::from_fn_with_state(limiter, rate_limit));

    Router::new()
        .route("/health", get(health))
        .merge(limited)
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::LimiterSettings;
    use crate::storage::{MemoryStorage, Storage};
    use axum::body::{to_bytes, Body};
    use axum::http::{HeaderValue, Request as HttpRequest};
    use std::time::Duration;
    use tower::ServiceExt;

    fn create_app() -> (Arc<MemoryStorage>, Router) {
        let storage = Arc::new(MemoryStorage::with_manual_clock());
        let limiter = RateLimiter::new(
            storage.clone(),
            LimiterSettings {
                address_limit: 5,
                token_limit: 10,
                block_duration: Duration::from_secs(300),
            },
        );
        (storage, router(Arc::new(limiter)))
    }

    fn request(forwarded_for: Option<&str>, token: Option<&str>) -> HttpRequest<Body> {
        let mut builder = HttpRequest::builder().uri("/");
        if let Some(forwarded_for) = forwarded_for {
            builder = builder.header(FORWARDED_FOR_HEADER, forwarded_for);
        }
        if let Some(token) = token {
            builder = builder.header("API_KEY", token);
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn body_string(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn test_identity_from_remote_address() {
        let remote: SocketAddr = "192.168.1.1:52000".parse().unwrap();
        let identity = caller_identity(&HeaderMap::new(), Some(remote));

        assert_eq!(identity.address, "192.168.1.1");
        assert_eq!(identity.token, "");
    }

    #[test]
    fn test_forwarded_for_replaces_address_verbatim() {
        let mut headers = HeaderMap::new();
        headers.insert(
            FORWARDED_FOR_HEADER,
            HeaderValue::from_static("203.0.113.7, 10.0.0.1"),
        );
        headers.insert(API_KEY_HEADER, HeaderValue::from_static("abc123"));
        let remote: SocketAddr = "10.0.0.1:40000".parse().unwrap();

        let identity = caller_identity(&headers, Some(remote));
        assert_eq!(identity.address, "203.0.113.7, 10.0.0.1");
        assert_eq!(identity.token, "abc123");
    }

    #[test]
    fn test_empty_forwarded_for_is_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert(FORWARDED_FOR_HEADER, HeaderValue::from_static(""));
        let remote: SocketAddr = "[2001:db8::1]:443".parse().unwrap();

        let identity = caller_identity(&headers, Some(remote));
        assert_eq!(identity.address, "2001:db8::1");
    }

    #[tokio::test]
    async fn test_address_requests_limited() {
        let (_, app) = create_app();

        for i in 1..=5 {
            let response = app
                .clone()
                .oneshot(request(Some("192.168.1.1"), None))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK, "Request {}", i);
            assert_eq!(body_string(response).await, HELLO_BODY);
        }

        let response = app
            .clone()
            .oneshot(request(Some("192.168.1.1"), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );

        let body: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(
            body["error"],
            "you have reached the maximum number of requests or actions allowed within a certain time frame"
        );
    }

    #[tokio::test]
    async fn test_token_requests_limited() {
        let (storage, app) = create_app();

        for _ in 0..10 {
            let response = app
                .clone()
                .oneshot(request(Some("192.168.1.2"), Some("abc123")))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = app
            .clone()
            .oneshot(request(Some("192.168.1.2"), Some("abc123")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body_string(response).await, REJECTION_BODY);

        storage.advance(Duration::from_secs(300));
        let response = app
            .oneshot(request(Some("192.168.1.2"), Some("abc123")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_any_path_is_limited() {
        let (storage, app) = create_app();

        let response = app
            .oneshot(
                HttpRequest::builder()
                    .method("POST")
                    .uri("/orders/42")
                    .header(FORWARDED_FOR_HEADER, "198.51.100.4")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(storage.counter_value("198.51.100.4"), Some(1));
    }

    #[tokio::test]
    async fn test_health_bypasses_limiter() {
        let (storage, app) = create_app();
        storage.block("", Duration::from_secs(60)).await.unwrap();

        let response = app
            .oneshot(
                HttpRequest::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(body["status"], "healthy");
    }
}

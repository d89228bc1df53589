use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use beamgate::config::{Config, Environment};
use beamgate::csrf::SECRET_COOKIE;
use beamgate::http_server::router;
use beamgate::provider::HyperbeamClient;
use beamgate::state::AppState;
use beamgate::testing::{MockProvider, MockTerminate};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

struct Harness {
    app: Router,
    state: AppState,
    provider: Arc<MockProvider>,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(Config::default())
    }

    fn with_config(config: Config) -> Self {
        let provider = Arc::new(MockProvider::new());
        let state = AppState::new(config, provider.clone());
        Self {
            app: router(state.clone()),
            state,
            provider,
        }
    }

    fn csrf(&self) -> (String, String) {
        let pair = self.state.tokens.issue().unwrap();
        (pair.secret, pair.token)
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Value) {
        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, headers, body)
    }

    async fn guarded(
        &self,
        method: Method,
        uri: &str,
        ip: &str,
        body: Value,
    ) -> (StatusCode, Value) {
        let (secret, token) = self.csrf();
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("x-forwarded-for", ip)
            .header(header::COOKIE, format!("{}={}", SECRET_COOKIE, secret))
            .header("x-csrf-token", token)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let (status, _, body) = self.send(request).await;
        (status, body)
    }

    async fn create(&self, ip: &str) -> (StatusCode, Value) {
        self.guarded(Method::POST, "/vm", ip, json!({})).await
    }

    async fn ping(&self, ip: &str, body: &str) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(Method::PATCH)
            .uri("/vm")
            .header("x-forwarded-for", ip)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let (status, _, body) = self.send(request).await;
        (status, body)
    }
}

#[tokio::test]
async fn csrf_endpoint_issues_cookie_and_matching_token() {
    let h = Harness::new();
    let request = Request::builder()
        .uri("/csrf-token")
        .body(Body::empty())
        .unwrap();
    let (status, headers, body) = h.send(request).await;
    assert_eq!(status, StatusCode::OK);

    let cookie = headers
        .get(header::SET_COOKIE)
        .and_then(|v| v.to_str().ok())
        .unwrap()
        .to_string();
    assert!(cookie.contains("HttpOnly"));
    assert!(cookie.contains("SameSite=Lax"));
    assert!(cookie.contains("Path=/"));
    assert!(cookie.contains("Max-Age=3600"));
    assert!(!cookie.contains("Secure"));

    let secret = beamgate::csrf::parse_cookie(&cookie, SECRET_COOKIE).unwrap();
    let token = body["csrfToken"].as_str().unwrap();
    assert!(h.state.tokens.verify(&secret, token));
    assert!(!h.state.tokens.verify("someone-elses-secret", token));
}

#[tokio::test]
async fn production_cookie_is_secure() {
    let h = Harness::with_config(Config {
        environment: Environment::Production,
        ..Config::default()
    });
    let request = Request::builder()
        .uri("/csrf-token")
        .body(Body::empty())
        .unwrap();
    let (_, headers, _) = h.send(request).await;
    let cookie = headers.get(header::SET_COOKIE).unwrap().to_str().unwrap();
    assert!(cookie.contains("Secure"));
}

#[tokio::test]
async fn create_returns_session_and_tracks_it() {
    let h = Harness::new();
    h.provider.queue_session("s1", "https://x");

    let before = chrono::Utc::now().timestamp_millis();
    let (status, body) = h.create("203.0.113.7").await;
    let after = chrono::Utc::now().timestamp_millis();

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], "s1");
    assert_eq!(body["url"], "https://x");
    let expires_at = body["expiresAt"].as_i64().unwrap();
    assert!(expires_at >= before + 240_000 && expires_at <= after + 240_000);
    assert!(body.get("admin_token").is_none());

    assert!(h.state.lifecycle.session("s1").await.is_some());
    assert_eq!(
        h.state.lifecycle.sessions_for("203.0.113.7").await,
        vec!["s1".to_string()]
    );
}

#[tokio::test]
async fn create_requires_csrf() {
    let h = Harness::new();

    let no_secret = Request::builder()
        .method(Method::POST)
        .uri("/vm")
        .header("x-csrf-token", "abc-def")
        .body(Body::from("{}"))
        .unwrap();
    let (status, _, body) = h.send(no_secret).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "Missing CSRF secret");

    let (secret, _) = h.csrf();
    let no_token = Request::builder()
        .method(Method::POST)
        .uri("/vm")
        .header(header::COOKIE, format!("{}={}", SECRET_COOKIE, secret))
        .body(Body::from("{}"))
        .unwrap();
    let (status, _, body) = h.send(no_token).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "Missing CSRF token");

    let (_, other_token) = h.csrf();
    let mismatched = Request::builder()
        .method(Method::POST)
        .uri("/vm")
        .header(header::COOKIE, format!("{}={}", SECRET_COOKIE, secret))
        .header("x-csrf-token", other_token)
        .body(Body::from("{}"))
        .unwrap();
    let (status, _, body) = h.send(mismatched).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "Invalid CSRF token");

    assert_eq!(h.provider.create_calls(), 0);
}

#[tokio::test]
async fn third_create_from_same_ip_is_rate_limited() {
    let h = Harness::new();
    assert_eq!(h.create("198.51.100.1").await.0, StatusCode::OK);
    assert_eq!(h.create("198.51.100.1").await.0, StatusCode::OK);

    let (status, body) = h.create("198.51.100.1").await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["retryAfter"], 300);
    assert!(body["error"].as_str().unwrap().contains("Maximum 2 sessions"));

    assert_eq!(h.create("198.51.100.2").await.0, StatusCode::OK);
    assert_eq!(h.provider.create_calls(), 3);
}

#[tokio::test]
async fn provider_failure_on_create_is_500_without_record() {
    let h = Harness::with_config(Config {
        environment: Environment::Production,
        ..Config::default()
    });
    h.provider.queue_create_failure(429);

    let (status, body) = h.create("ip").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"], "Failed to create session");
    assert_eq!(body["details"], "Service temporarily overloaded");
    assert_eq!(h.state.lifecycle.session_count().await, 0);
}

#[tokio::test]
async fn missing_api_key_is_a_500() {
    let config = Config::default();
    let client = HyperbeamClient::new("http://127.0.0.1:9", None, Duration::from_secs(1)).unwrap();
    let state = AppState::new(config, Arc::new(client));
    let app = router(state.clone());
    let pair = state.tokens.issue().unwrap();

    let request = Request::builder()
        .method(Method::POST)
        .uri("/vm")
        .header(header::COOKIE, format!("{}={}", SECRET_COOKIE, pair.secret))
        .header("x-csrf-token", pair.token)
        .body(Body::from("{}"))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["error"], "Service temporarily unavailable");
}

#[tokio::test]
async fn ping_unknown_session_is_404() {
    let h = Harness::new();
    let (status, body) = h.ping("ip", r#"{"sessionId":"nope"}"#).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, json!({"error": "Session not found or expired"}));
}

#[tokio::test]
async fn ping_validates_body() {
    let h = Harness::new();
    let (status, body) = h.ping("ip", "{oops").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Invalid JSON body");

    let (status, body) = h.ping("ip", r#"{"sessionId":""}"#).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Invalid session ID");
}

#[tokio::test]
async fn ping_is_scoped_to_owner_ip() {
    let h = Harness::new();
    h.provider.queue_session("s1", "https://x");
    h.create("10.0.0.1").await;

    let (status, body) = h.ping("10.0.0.2", r#"{"sessionId":"s1"}"#).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "Access denied");

    let (status, body) = h.ping("10.0.0.1", r#"{"sessionId":"s1"}"#).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"ok": true}));
}

#[tokio::test]
async fn delete_terminates_once_and_is_idempotent() {
    let h = Harness::new();
    h.provider.queue_session("s1", "https://x");
    h.create("10.0.0.1").await;

    let (status, _) = h
        .guarded(Method::DELETE, "/vm", "10.0.0.2", json!({"sessionId": "s1"}))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(h.state.lifecycle.session("s1").await.is_some());

    let (status, body) = h
        .guarded(Method::DELETE, "/vm", "10.0.0.1", json!({"sessionId": "s1"}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"ok": true}));
    assert!(h.state.lifecycle.session("s1").await.is_none());
    assert!(h.state.lifecycle.sessions_for("10.0.0.1").await.is_empty());

    let (status, _) = h
        .guarded(Method::DELETE, "/vm", "10.0.0.1", json!({"sessionId": "s1"}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(h.provider.terminate_count("s1"), 1);
}

#[tokio::test]
async fn delete_requires_session_id() {
    let h = Harness::new();
    let (status, body) = h.guarded(Method::DELETE, "/vm", "ip", json!({})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Invalid session ID");
}

#[tokio::test]
async fn delete_swallows_remote_failure() {
    let h = Harness::new();
    h.provider.queue_session("s1", "https://x");
    h.provider.queue_terminate(MockTerminate::Fail);
    h.create("ip").await;

    let (status, _) = h
        .guarded(Method::DELETE, "/vm", "ip", json!({"sessionId": "s1"}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(h.state.lifecycle.session("s1").await.is_none());
}

#[tokio::test]
async fn terminate_endpoint_reports_remote_failure_after_cleanup() {
    let h = Harness::new();
    h.provider.queue_session("s1", "https://x");
    h.provider.queue_terminate(MockTerminate::Fail);
    h.create("ip").await;

    let (status, body) = h
        .guarded(Method::POST, "/terminate", "ip", json!({"sessionId": "s1"}))
        .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"], "Failed to terminate Hyperbeam session");
    assert_eq!(body["details"], "engine unavailable");

    assert!(h.state.lifecycle.session("s1").await.is_none());
    assert!(h.state.lifecycle.sessions_for("ip").await.is_empty());
}

#[tokio::test]
async fn terminate_endpoint_succeeds_for_unknown_session() {
    let h = Harness::new();
    let (status, body) = h
        .guarded(Method::POST, "/terminate", "ip", json!({"sessionId": "gone"}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"ok": true}));
    assert!(h.provider.terminate_calls().is_empty());
}

#[tokio::test]
async fn responses_carry_security_headers() {
    let h = Harness::new();
    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let response = h.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers();
    assert_eq!(headers["x-content-type-options"], "nosniff");
    assert_eq!(headers["x-frame-options"], "DENY");
    assert_eq!(headers["x-xss-protection"], "1; mode=block");
}

#[tokio::test]
async fn unsupported_method_is_405() {
    let h = Harness::new();
    let request = Request::builder()
        .method(Method::PUT)
        .uri("/vm")
        .body(Body::empty())
        .unwrap();
    let response = h.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
}

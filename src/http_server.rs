//! HTTP server implementation using Axum.

use crate::csrf::{self, SECRET_COOKIE, TOKEN_HEADER};
use crate::error::ApiError;
use crate::lifecycle::{CreatedSession, LifecycleError, RemoteOutcome, Termination, TerminationReason};
use crate::state::AppState;
use axum::{
    body::Bytes,
    extract::{ConnectInfo, FromRequestParts, Request, State},
    http::{header, request::Parts, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use tokio::time::interval;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

const MAX_SESSION_ID_LEN: usize = 256;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CsrfTokenResponse {
    csrf_token: String,
}

#[derive(Serialize)]
struct OkResponse {
    ok: bool,
}

impl OkResponse {
    fn json() -> Json<Self> {
        Json(Self { ok: true })
    }
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/csrf-token", get(issue_csrf_token))
        .route(
            "/vm",
            post(create_vm).patch(ping_vm).delete(delete_vm),
        )
        .route("/terminate", post(terminate_vm))
        .route("/health", get(health))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-frame-options"),
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-xss-protection"),
            HeaderValue::from_static("1; mode=block"),
        ))
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &Request| {
                tracing::info_span!(
                    "request",
                    id = %uuid::Uuid::new_v4(),
                    method = %request.method(),
                    uri = %request.uri(),
                )
            }),
        )
        .with_state(state)
}

/// Run the HTTP server on the given port with the provided state.
///
/// On Ctrl-C the listener stops and every tracked session is terminated.
pub async fn run_server(port: u16, state: AppState) -> std::io::Result<()> {
    // Spawn sweep task
    let lifecycle = state.lifecycle.clone();
    let period = state.config.sweep_interval();
    let sweeper = tokio::spawn(async move {
        let mut interval = interval(period);
        loop {
            interval.tick().await;
            lifecycle.sweep_expired(chrono::Utc::now()).await;
        }
    });

    let lifecycle = state.lifecycle.clone();
    let app = router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    sweeper.abort();
    lifecycle.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

async fn health() -> &'static str {
    "OK"
}

/// Caller address: first `X-Forwarded-For` hop, then `X-Real-IP`, then the
/// socket peer.
pub struct ClientIp(pub String);

#[axum::async_trait]
impl<S: Send + Sync> FromRequestParts<S> for ClientIp {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string());
        Ok(ClientIp(client_ip(&parts.headers, peer)))
    }
}

fn client_ip(headers: &HeaderMap, peer: Option<String>) -> String {
    let header_value = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };
    if let Some(forwarded) = header_value("x-forwarded-for") {
        if let Some(first) = forwarded.split(',').map(str::trim).find(|s| !s.is_empty()) {
            return first.to_string();
        }
    }
    if let Some(real) = header_value("x-real-ip") {
        return real.to_string();
    }
    peer.unwrap_or_else(|| "unknown".to_string())
}

/// Proof that the request carried a CSRF token matching its secret cookie.
pub struct CsrfVerified;

#[axum::async_trait]
impl FromRequestParts<AppState> for CsrfVerified {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let secret = parts
            .headers
            .get_all(header::COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .find_map(|v| csrf::parse_cookie(v, SECRET_COOKIE))
            .filter(|s| !s.is_empty());
        let Some(secret) = secret else {
            warn!("Rejected request without CSRF secret");
            return Err(ApiError::Auth("Missing CSRF secret".to_string()));
        };

        let token = parts
            .headers
            .get(TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|s| !s.is_empty());
        let Some(token) = token else {
            warn!("Rejected request without CSRF token");
            return Err(ApiError::Auth("Missing CSRF token".to_string()));
        };

        if !state.tokens.verify(&secret, token) {
            warn!("Rejected request with invalid CSRF token");
            return Err(ApiError::Auth("Invalid CSRF token".to_string()));
        }
        Ok(CsrfVerified)
    }
}

/// Extract and validate `sessionId` from a JSON body.
fn session_id_from_body(body: &Bytes) -> Result<String, ApiError> {
    let value: serde_json::Value = if body.iter().all(u8::is_ascii_whitespace) {
        serde_json::Value::Object(Default::default())
    } else {
        serde_json::from_slice(body)
            .map_err(|_| ApiError::Validation("Invalid JSON body".to_string()))?
    };

    match value.get("sessionId").and_then(|v| v.as_str()) {
        Some(id) if !id.is_empty() && id.len() < MAX_SESSION_ID_LEN => Ok(id.to_string()),
        _ => Err(ApiError::Validation("Invalid session ID".to_string())),
    }
}

async fn issue_csrf_token(State(state): State<AppState>) -> Response {
    let pair = match state.tokens.issue() {
        Ok(pair) => pair,
        Err(e) => {
            error!("CSRF token generation failed: {}", e);
            return ApiError::Internal("Failed to generate CSRF token".to_string())
                .into_response();
        }
    };

    let cookie = csrf::secret_cookie(
        &pair.secret,
        state.config.csrf_cookie_max_age_secs,
        state.config.is_production(),
    );
    match HeaderValue::from_str(&cookie) {
        Ok(cookie) => (
            StatusCode::OK,
            [(header::SET_COOKIE, cookie)],
            Json(CsrfTokenResponse {
                csrf_token: pair.token,
            }),
        )
            .into_response(),
        Err(e) => {
            error!("CSRF cookie could not be encoded: {}", e);
            ApiError::Internal("Failed to generate CSRF token".to_string()).into_response()
        }
    }
}

async fn create_vm(
    State(state): State<AppState>,
    _csrf: CsrfVerified,
    ClientIp(ip): ClientIp,
) -> Result<Json<CreatedSession>, ApiError> {
    info!(client = %ip, "POST /vm");
    let verbose = !state.config.is_production();
    let created = state
        .lifecycle
        .create(&ip)
        .await
        .map_err(|e| match e {
            LifecycleError::Provider(e) => ApiError::from_create_failure(e, verbose),
            other => other.into(),
        })?;
    Ok(Json(created))
}

async fn ping_vm(
    State(state): State<AppState>,
    ClientIp(ip): ClientIp,
    body: Bytes,
) -> Result<Json<OkResponse>, ApiError> {
    let id = session_id_from_body(&body)?;
    state.lifecycle.ping_owned(&id, &ip).await?;
    Ok(OkResponse::json())
}

async fn delete_vm(
    State(state): State<AppState>,
    _csrf: CsrfVerified,
    ClientIp(ip): ClientIp,
    body: Bytes,
) -> Result<Json<OkResponse>, ApiError> {
    let id = session_id_from_body(&body)?;
    state
        .lifecycle
        .terminate_owned(&id, &ip, TerminationReason::UserRequest)
        .await?;
    Ok(OkResponse::json())
}

async fn terminate_vm(
    State(state): State<AppState>,
    _csrf: CsrfVerified,
    ClientIp(ip): ClientIp,
    body: Bytes,
) -> Result<Json<OkResponse>, ApiError> {
    let id = session_id_from_body(&body)?;
    let termination = state
        .lifecycle
        .terminate_owned(&id, &ip, TerminationReason::UserRequest)
        .await?;
    match termination {
        Termination::Completed {
            remote: RemoteOutcome::Failed(e),
            ..
        } => Err(ApiError::from_terminate_failure(e)),
        Termination::Completed {
            remote: RemoteOutcome::Interrupted,
            ..
        } => Err(ApiError::Internal(
            "Failed to terminate Hyperbeam session".to_string(),
        )),
        _ => Ok(OkResponse::json()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_ip_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static(" 9.9.9.9, 10.0.0.1"));
        headers.insert("x-real-ip", HeaderValue::from_static("8.8.8.8"));
        assert_eq!(client_ip(&headers, Some("127.0.0.1".into())), "9.9.9.9");
    }

    #[test]
    fn client_ip_falls_back_in_order() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("8.8.8.8"));
        assert_eq!(client_ip(&headers, Some("127.0.0.1".into())), "8.8.8.8");

        let headers = HeaderMap::new();
        assert_eq!(client_ip(&headers, Some("127.0.0.1".into())), "127.0.0.1");
        assert_eq!(client_ip(&headers, None), "unknown");
    }

    #[test]
    fn session_id_validation() {
        let ok = Bytes::from_static(br#"{"sessionId":"abc"}"#);
        assert_eq!(session_id_from_body(&ok).unwrap(), "abc");

        for bad in [
            &br#"{"sessionId":""}"#[..],
            &br#"{"sessionId":42}"#[..],
            &br#"{}"#[..],
            &b""[..],
        ] {
            match session_id_from_body(&Bytes::copy_from_slice(bad)) {
                Err(ApiError::Validation(msg)) => assert_eq!(msg, "Invalid session ID"),
                other => panic!("unexpected: {other:?}"),
            }
        }

        let long = format!(r#"{{"sessionId":"{}"}}"#, "a".repeat(256));
        assert!(session_id_from_body(&Bytes::from(long)).is_err());

        match session_id_from_body(&Bytes::from_static(b"{not json")) {
            Err(ApiError::Validation(msg)) => assert_eq!(msg, "Invalid JSON body"),
            other => panic!("unexpected: {other:?}"),
        }
    }
}

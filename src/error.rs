//! Error taxonomy surfaced by the HTTP layer.

use crate::lifecycle::LifecycleError;
use crate::provider::ProviderError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Auth(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{message}")]
    RateLimited { message: String, retry_after: u64 },

    #[error("{message}")]
    Provider {
        message: String,
        details: Option<String>,
    },

    #[error("{0}")]
    Config(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn session_not_found() -> Self {
        ApiError::NotFound("Session not found or expired".to_string())
    }

    pub fn access_denied() -> Self {
        ApiError::Auth("Access denied".to_string())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Auth(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Provider { .. } | ApiError::Config(_) | ApiError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Map a provider failure during session creation. `verbose` passes the
    /// raw error text through instead of the generic hint.
    pub fn from_create_failure(err: ProviderError, verbose: bool) -> Self {
        let (message, hint) = match &err {
            ProviderError::MissingApiKey => {
                return ApiError::Config("Service temporarily unavailable".to_string())
            }
            ProviderError::Http { status, .. } if *status == 429 => (
                "Failed to create session",
                "Service temporarily overloaded".to_string(),
            ),
            ProviderError::Http { status, .. } => {
                ("Failed to create session", format!("HTTP {}", status))
            }
            ProviderError::InvalidResponse(_) => {
                return ApiError::Provider {
                    message: "Invalid session data received".to_string(),
                    details: verbose.then(|| err.to_string()),
                }
            }
            ProviderError::Transport(_) => (
                "Failed to connect to session service",
                "Network error".to_string(),
            ),
        };
        ApiError::Provider {
            message: message.to_string(),
            details: Some(if verbose { err.to_string() } else { hint }),
        }
    }

    /// Map a provider failure during an explicit terminate request. The
    /// provider's own diagnostic text is passed through.
    pub fn from_terminate_failure(err: ProviderError) -> Self {
        match err {
            ProviderError::MissingApiKey => {
                ApiError::Config("Missing Hyperbeam API key".to_string())
            }
            ProviderError::Http { body, .. } => ApiError::Provider {
                message: "Failed to terminate Hyperbeam session".to_string(),
                details: Some(body),
            },
            other => ApiError::Provider {
                message: "Failed to terminate Hyperbeam session".to_string(),
                details: Some(other.to_string()),
            },
        }
    }
}

impl From<LifecycleError> for ApiError {
    fn from(err: LifecycleError) -> Self {
        let message = err.to_string();
        match err {
            LifecycleError::RateLimited { retry_after, .. } => ApiError::RateLimited {
                message,
                retry_after,
            },
            LifecycleError::NotFound => ApiError::session_not_found(),
            LifecycleError::AccessDenied => ApiError::access_denied(),
            LifecycleError::Provider(e) => ApiError::from_create_failure(e, false),
            LifecycleError::Interrupted | LifecycleError::ShuttingDown => {
                ApiError::Internal(message)
            }
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after: Option<u64>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match self {
            ApiError::RateLimited {
                message,
                retry_after,
            } => ErrorBody {
                error: message,
                details: None,
                retry_after: Some(retry_after),
            },
            ApiError::Provider { message, details } => ErrorBody {
                error: message,
                details,
                retry_after: None,
            },
            ApiError::Validation(message)
            | ApiError::Auth(message)
            | ApiError::NotFound(message)
            | ApiError::Config(message)
            | ApiError::Internal(message) => ErrorBody {
                error: message,
                details: None,
                retry_after: None,
            },
        };
        (status, Json(body)).into_response()
    }
}

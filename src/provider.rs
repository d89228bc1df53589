//! Client for the remote browser VM provider (Hyperbeam).

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error};

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider API key is not configured")]
    MissingApiKey,

    #[error("provider returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("invalid provider response: {0}")]
    InvalidResponse(String),

    #[error("provider request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Timeouts forwarded to the provider on creation, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VmTimeouts {
    pub absolute: u64,
    pub inactive: u64,
    pub offline: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateVmRequest {
    pub timeout: VmTimeouts,
}

/// A VM the provider has just started.
#[derive(Debug, Clone)]
pub struct ProvisionedVm {
    pub session_id: String,
    pub embed_url: String,
    pub admin_token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateOutcome {
    Terminated,
    AlreadyGone,
}

#[async_trait]
pub trait VmProvider: Send + Sync {
    async fn create(&self, request: &CreateVmRequest) -> Result<ProvisionedVm, ProviderError>;

    async fn terminate(&self, session_id: &str) -> Result<TerminateOutcome, ProviderError>;
}

#[derive(Deserialize)]
struct CreateVmResponse {
    session_id: Option<String>,
    embed_url: Option<String>,
    admin_token: Option<String>,
}

/// HTTP client for the Hyperbeam engine API.
pub struct HyperbeamClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HyperbeamClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.is_empty()),
        })
    }

    fn api_key(&self) -> Result<&str, ProviderError> {
        self.api_key.as_deref().ok_or(ProviderError::MissingApiKey)
    }
}

#[async_trait]
impl VmProvider for HyperbeamClient {
    async fn create(&self, request: &CreateVmRequest) -> Result<ProvisionedVm, ProviderError> {
        let api_key = self.api_key()?;
        let url = format!("{}/vm", self.base_url);
        debug!(?request, "Creating provider VM");

        let response = self
            .http
            .post(&url)
            .bearer_auth(api_key)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(status = status.as_u16(), body = %body, "Provider rejected VM creation");
            return Err(ProviderError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let data: CreateVmResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        match (data.session_id, data.embed_url) {
            (Some(session_id), Some(embed_url))
                if !session_id.is_empty() && !embed_url.is_empty() =>
            {
                Ok(ProvisionedVm {
                    session_id,
                    embed_url,
                    admin_token: data.admin_token,
                })
            }
            _ => Err(ProviderError::InvalidResponse(
                "missing session_id or embed_url".to_string(),
            )),
        }
    }

    async fn terminate(&self, session_id: &str) -> Result<TerminateOutcome, ProviderError> {
        let api_key = self.api_key()?;
        let url = format!("{}/vm/{}", self.base_url, session_id);

        let response = self.http.delete(&url).bearer_auth(api_key).send().await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(TerminateOutcome::AlreadyGone);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Http {
                status: status.as_u16(),
                body,
            });
        }
        Ok(TerminateOutcome::Terminated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_request_serializes_timeouts() {
        let request = CreateVmRequest {
            timeout: VmTimeouts {
                absolute: 240,
                inactive: 30,
                offline: 3600,
            },
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"timeout": {"absolute": 240, "inactive": 30, "offline": 3600}})
        );
    }

    #[tokio::test]
    async fn missing_key_fails_before_any_request() {
        let client =
            HyperbeamClient::new("http://127.0.0.1:9", Some(String::new()), Duration::from_secs(1))
                .unwrap();
        let request = CreateVmRequest {
            timeout: VmTimeouts {
                absolute: 1,
                inactive: 1,
                offline: 1,
            },
        };
        assert!(matches!(
            client.create(&request).await,
            Err(ProviderError::MissingApiKey)
        ));
        assert!(matches!(
            client.terminate("s1").await,
            Err(ProviderError::MissingApiKey)
        ));
    }
}

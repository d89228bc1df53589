//! Shared application state.

use crate::config::Config;
use crate::csrf::CsrfTokens;
use crate::lifecycle::LifecycleManager;
use crate::provider::{HyperbeamClient, ProviderError, VmProvider};
use std::sync::Arc;

/// Everything a handler needs, built once at startup and cloned per request.
#[derive(Clone)]
pub struct AppState {
    pub lifecycle: Arc<LifecycleManager>,
    pub tokens: CsrfTokens,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(config: Config, provider: Arc<dyn VmProvider>) -> Self {
        let lifecycle = LifecycleManager::new(config.lifecycle(), provider);
        Self {
            lifecycle,
            tokens: CsrfTokens::new(),
            config: Arc::new(config),
        }
    }

    /// State backed by the real Hyperbeam client.
    pub fn with_hyperbeam(config: Config) -> Result<Self, ProviderError> {
        let client = HyperbeamClient::new(
            config.provider_url.clone(),
            config.api_key.clone(),
            config.provider_timeout(),
        )?;
        Ok(Self::new(config, Arc::new(client)))
    }
}

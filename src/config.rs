//! Process configuration: CLI flags with environment fallbacks.

use clap::{Args, ValueEnum};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_PROVIDER_URL: &str = "https://engine.hyperbeam.com/v0";

/// Deployment environment. Production turns on `Secure` cookies and hides
/// raw error text from responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Environment {
    Development,
    Production,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    #[error("max sessions per client must be at least 1")]
    NoSessionsAllowed,
}

#[derive(Debug, Clone, Args)]
pub struct Config {
    /// Port to listen on
    #[arg(long, env = "PORT", default_value = "8080")]
    pub port: u16,

    /// Hyperbeam API key (required for create/terminate calls)
    #[arg(long, env = "HYPERBEAM_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Base URL of the Hyperbeam engine API
    #[arg(long, env = "HYPERBEAM_API_URL", default_value = DEFAULT_PROVIDER_URL)]
    pub provider_url: String,

    /// Maximum concurrent sessions per client IP
    #[arg(long, env = "MAX_SESSIONS_PER_IP", default_value = "2")]
    pub max_sessions_per_client: usize,

    /// Hard session lifetime in seconds, counted from creation
    #[arg(long, env = "SESSION_LIFETIME_SECS", default_value = "240")]
    pub session_lifetime_secs: u64,

    /// Inactivity window in seconds, reset on every ping
    #[arg(long, env = "INACTIVITY_TIMEOUT_SECS", default_value = "30")]
    pub inactivity_secs: u64,

    /// Offline timeout forwarded to the provider
    #[arg(long, env = "OFFLINE_TIMEOUT_SECS", default_value = "3600")]
    pub offline_secs: u64,

    /// Interval of the safety-net sweep over expired records
    #[arg(long, env = "SWEEP_INTERVAL_SECS", default_value = "60")]
    pub sweep_interval_secs: u64,

    /// Timeout applied to every provider request
    #[arg(long, env = "PROVIDER_TIMEOUT_SECS", default_value = "10")]
    pub provider_timeout_secs: u64,

    /// Retry hint returned with rate-limit rejections
    #[arg(long, env = "RATE_LIMIT_RETRY_AFTER_SECS", default_value = "300")]
    pub retry_after_secs: u64,

    /// Max-Age of the CSRF secret cookie
    #[arg(long, env = "CSRF_COOKIE_MAX_AGE_SECS", default_value = "3600")]
    pub csrf_cookie_max_age_secs: u64,

    #[arg(long, env = "APP_ENV", value_enum, default_value = "development")]
    pub environment: Environment,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session_lifetime_secs == 0 {
            return Err(ConfigError::ZeroDuration("session lifetime"));
        }
        if self.inactivity_secs == 0 {
            return Err(ConfigError::ZeroDuration("inactivity window"));
        }
        if self.max_sessions_per_client == 0 {
            return Err(ConfigError::NoSessionsAllowed);
        }
        if self.sweep_interval_secs == 0 {
            return Err(ConfigError::ZeroDuration("sweep interval"));
        }
        Ok(())
    }

    pub fn is_production(&self) -> bool {
        self.environment == Environment::Production
    }

    pub fn lifecycle(&self) -> LifecycleConfig {
        LifecycleConfig {
            hard_lifetime: Duration::from_secs(self.session_lifetime_secs),
            inactivity_window: Duration::from_secs(self.inactivity_secs),
            offline_timeout: Duration::from_secs(self.offline_secs),
            max_sessions_per_client: self.max_sessions_per_client,
            retry_after_secs: self.retry_after_secs,
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            api_key: None,
            provider_url: DEFAULT_PROVIDER_URL.to_string(),
            max_sessions_per_client: 2,
            session_lifetime_secs: 240,
            inactivity_secs: 30,
            offline_secs: 3600,
            sweep_interval_secs: 60,
            provider_timeout_secs: 10,
            retry_after_secs: 300,
            csrf_cookie_max_age_secs: 3600,
            environment: Environment::Development,
        }
    }
}

/// The policy knobs the lifecycle manager needs.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub hard_lifetime: Duration,
    pub inactivity_window: Duration,
    pub offline_timeout: Duration,
    pub max_sessions_per_client: usize,
    pub retry_after_secs: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Config::default().lifecycle()
    }
}

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::capabilities::{HttpError, ValidatedUrl, DEFAULT_TIMEOUT_MS, MAX_TIMEOUT_MS};
use crate::store::STATE_VERSION;

pub const ENV_API_URL: &str = "MEDALERT_API_URL";
pub const ENV_API_TIMEOUT_MS: &str = "MEDALERT_API_TIMEOUT_MS";
pub const ENV_ALLOW_PRIVATE_NETWORK: &str = "MEDALERT_ALLOW_PRIVATE_NETWORK";
pub const ENV_GOOGLE_CLIENT_ID: &str = "MEDALERT_GOOGLE_CLIENT_ID";
pub const ENV_USE_MOCK_AUTH: &str = "MEDALERT_USE_MOCK_AUTH";
pub const ENV_QUEUE_MAX_ATTEMPTS: &str = "MEDALERT_QUEUE_MAX_ATTEMPTS";

pub const DEFAULT_API_URL: &str = "https://api.medalert.app";
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("invalid base URL: {0}")]
    InvalidBaseUrl(#[from] HttpError),

    #[error("unsupported configuration: {0}")]
    Unsupported(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiConfig {
    pub base_url: String,
    pub timeout_ms: u64,
    /// Permits loopback and private-range hosts, for development servers.
    pub allow_private_network: bool,
    pub google_client_id: Option<String>,
    pub use_mock_auth: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_API_URL.to_string(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            allow_private_network: false,
            google_client_id: None,
            use_mock_auth: false,
        }
    }
}

impl ApiConfig {
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_private_network(mut self, allow: bool) -> Self {
        self.allow_private_network = allow;
        self
    }

    pub fn base_url(&self) -> Result<ValidatedUrl, ConfigError> {
        Ok(ValidatedUrl::with_policy(
            self.base_url.clone(),
            self.allow_private_network,
        )?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.base_url()?;
        if self.timeout_ms == 0 || self.timeout_ms > MAX_TIMEOUT_MS {
            return Err(ConfigError::InvalidValue {
                key: "timeout_ms".into(),
                reason: format!("must be between 1 and {}", MAX_TIMEOUT_MS),
            });
        }
        if matches!(&self.google_client_id, Some(id) if id.trim().is_empty()) {
            return Err(ConfigError::InvalidValue {
                key: "google_client_id".into(),
                reason: "must not be blank when set".into(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Failed deliveries after which a queued mutation is dead-lettered.
    pub max_attempts: u32,
    pub namespace_version: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            namespace_version: STATE_VERSION,
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "max_attempts".into(),
                reason: "must be > 0".into(),
            });
        }
        if self.namespace_version == 0 {
            return Err(ConfigError::InvalidValue {
                key: "namespace_version".into(),
                reason: "must be > 0".into(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreConfig {
    pub api: ApiConfig,
    pub queue: QueueConfig,
}

impl CoreConfig {
    /// Reads `MEDALERT_*` variables from the process environment. Unset
    /// variables keep their defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup(ENV_API_URL).filter(|v| !v.trim().is_empty()) {
            config.api.base_url = url.trim().to_string();
        }
        if let Some(raw) = lookup(ENV_API_TIMEOUT_MS) {
            config.api.timeout_ms = parse_number(ENV_API_TIMEOUT_MS, &raw)?;
        }
        if let Some(raw) = lookup(ENV_ALLOW_PRIVATE_NETWORK) {
            config.api.allow_private_network = parse_flag(ENV_ALLOW_PRIVATE_NETWORK, &raw)?;
        }
        if let Some(id) = lookup(ENV_GOOGLE_CLIENT_ID).filter(|v| !v.trim().is_empty()) {
            config.api.google_client_id = Some(id);
        }
        if let Some(raw) = lookup(ENV_USE_MOCK_AUTH) {
            config.api.use_mock_auth = parse_flag(ENV_USE_MOCK_AUTH, &raw)?;
        }
        if let Some(raw) = lookup(ENV_QUEUE_MAX_ATTEMPTS) {
            config.queue.max_attempts = parse_number(ENV_QUEUE_MAX_ATTEMPTS, &raw)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.api.validate()?;
        self.queue.validate()
    }
}

fn parse_flag(key: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            reason: format!("'{}' is not a boolean", other),
        }),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

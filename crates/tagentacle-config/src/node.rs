//! Runtime options for a Tagentacle node

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::secrets::{SecretsFile, SECRETS_FILE_ENV};
use crate::ConfigError;

/// Overrides [`NodeConfig::call_timeout`], in milliseconds.
pub const CALL_TIMEOUT_ENV: &str = "TAGENTACLE_CALL_TIMEOUT_MS";
/// Overrides [`NodeConfig::poll_interval`], in milliseconds.
pub const POLL_INTERVAL_ENV: &str = "TAGENTACLE_POLL_INTERVAL_MS";

/// Default deadline for `call_service` when the caller does not pick one.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Default time the dispatch loop waits for a frame before sweeping
/// expired calls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Options consumed by the node runtime.
///
/// On disk the durations are written in milliseconds:
///
/// ```toml
/// call_timeout_ms = 10000
/// poll_interval_ms = 25
/// secrets_file = "/etc/tagentacle/secrets.toml"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawNodeConfig", into = "RawNodeConfig")]
pub struct NodeConfig {
    /// Deadline applied to service calls made without an explicit timeout
    pub call_timeout: Duration,
    /// Upper bound on how long one dispatch iteration waits for a frame
    pub poll_interval: Duration,
    /// Secrets file to hand to the node, if any
    pub secrets_file: Option<PathBuf>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            call_timeout: DEFAULT_CALL_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            secrets_file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawNodeConfig {
    call_timeout_ms: u64,
    poll_interval_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    secrets_file: Option<PathBuf>,
}

impl Default for RawNodeConfig {
    fn default() -> Self {
        NodeConfig::default().into()
    }
}

impl From<RawNodeConfig> for NodeConfig {
    fn from(raw: RawNodeConfig) -> Self {
        Self {
            call_timeout: Duration::from_millis(raw.call_timeout_ms),
            poll_interval: Duration::from_millis(raw.poll_interval_ms),
            secrets_file: raw.secrets_file,
        }
    }
}

impl From<NodeConfig> for RawNodeConfig {
    fn from(config: NodeConfig) -> Self {
        Self {
            call_timeout_ms: saturating_millis(config.call_timeout),
            poll_interval_ms: saturating_millis(config.poll_interval),
            secrets_file: config.secrets_file,
        }
    }
}

fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl NodeConfig {
    /// Defaults overridden by environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_env_overrides()
    }

    /// Parse a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        debug!("Loaded node config from {}", path.display());
        config.validate()?;
        Ok(config)
    }

    /// Apply `TAGENTACLE_*` environment overrides on top of `self`
    pub fn with_env_overrides(mut self) -> Result<Self, ConfigError> {
        if let Some(ms) = read_millis_env(CALL_TIMEOUT_ENV)? {
            self.call_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = read_millis_env(POLL_INTERVAL_ENV)? {
            self.poll_interval = Duration::from_millis(ms);
        }
        if let Ok(path) = std::env::var(SECRETS_FILE_ENV) {
            if !path.trim().is_empty() {
                self.secrets_file = Some(PathBuf::from(path));
            }
        }
        self.validate()?;
        Ok(self)
    }

    /// Secrets from [`secrets_file`](Self::secrets_file), empty when none
    /// is configured
    pub fn load_secrets(&self) -> Result<HashMap<String, String>, ConfigError> {
        match &self.secrets_file {
            Some(path) => SecretsFile::with_path(path).load(),
            None => Ok(HashMap::new()),
        }
    }

    /// Reject zero durations
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.call_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "call timeout must be greater than zero".to_string(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "poll interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn read_millis_env(var: &str) -> Result<Option<u64>, ConfigError> {
    match std::env::var(var) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|e| ConfigError::Invalid(format!("{}={:?}: {}", var, raw, e))),
        Err(_) => Ok(None),
    }
}

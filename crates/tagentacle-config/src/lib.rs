//! # Tagentacle node configuration
//!
//! Everything a node reads from its environment before it touches the bus:
//!
//! - [`NodeConfig`]: call deadline and dispatch poll interval, from TOML or
//!   `TAGENTACLE_*` environment variables
//! - [`SecretsFile`]: the secrets file handed over by the launcher through
//!   `TAGENTACLE_SECRETS_FILE`
//! - [`init_logging`]: `tracing` subscriber setup for node binaries

#![warn(missing_docs)]

mod logging;
mod node;
mod secrets;

pub use logging::init_logging;
pub use node::{
    NodeConfig, CALL_TIMEOUT_ENV, DEFAULT_CALL_TIMEOUT, DEFAULT_POLL_INTERVAL, POLL_INTERVAL_ENV,
};
pub use secrets::{load_secrets_from_env, SecretsFile, SECRETS_FILE_ENV};

/// Errors raised while loading node configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// IO error reading a config or secrets file
    #[error("config IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parse error
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// Value out of range or malformed
    #[error("invalid config: {0}")]
    Invalid(String),
}

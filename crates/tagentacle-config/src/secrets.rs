//! Secrets loading for nodes launched by the Tagentacle CLI
//!
//! The launcher points a node at a TOML file through the
//! `TAGENTACLE_SECRETS_FILE` environment variable:
//!
//! ```toml
//! # secrets.toml
//! OPENAI_API_KEY = "sk-..."
//! SEARCH_TOKEN = "tok-..."
//! ```
//!
//! Only top-level string entries are kept; tables and non-string values are
//! ignored. A missing file yields an empty map, and so does a file that
//! fails to parse (with a warning), so a broken secrets file never prevents
//! a node from starting.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::ConfigError;

/// Environment variable naming the secrets file.
pub const SECRETS_FILE_ENV: &str = "TAGENTACLE_SECRETS_FILE";

/// Read-only view of a secrets file on disk
pub struct SecretsFile {
    path: PathBuf,
}

impl SecretsFile {
    /// Secrets file at an explicit path
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Secrets file named by `TAGENTACLE_SECRETS_FILE`, if set and non-empty
    pub fn from_env() -> Option<Self> {
        match std::env::var(SECRETS_FILE_ENV) {
            Ok(path) if !path.trim().is_empty() => Some(Self::with_path(path)),
            _ => None,
        }
    }

    /// Path of the secrets file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load all top-level string entries
    pub fn load(&self) -> Result<HashMap<String, String>, ConfigError> {
        if !self.path.is_file() {
            debug!("No secrets file at {}", self.path.display());
            return Ok(HashMap::new());
        }

        let content = std::fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(HashMap::new());
        }

        let table: toml::Table = match toml::from_str(&content) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(
                    "Failed to parse secrets file at {}: {}. Treating as empty.",
                    self.path.display(),
                    e
                );
                return Ok(HashMap::new());
            }
        };

        Ok(table
            .into_iter()
            .filter_map(|(key, value)| match value {
                toml::Value::String(s) => Some((key, s)),
                _ => None,
            })
            .collect())
    }
}

/// Load secrets from the file named by `TAGENTACLE_SECRETS_FILE`.
///
/// Returns an empty map when the variable is unset.
pub fn load_secrets_from_env() -> Result<HashMap<String, String>, ConfigError> {
    let Some(file) = SecretsFile::from_env() else {
        return Ok(HashMap::new());
    };
    let secrets = file.load()?;
    if !secrets.is_empty() {
        info!(
            "Loaded {} secret(s) from {}",
            secrets.len(),
            file.path().display()
        );
    }
    Ok(secrets)
}

//! JSON-loadable policy tables.
//!
//! ```json
//! {
//!   "cleanup_interval_secs": 300,
//!   "store_timeout_ms": 50,
//!   "policies": [
//!     { "name": "auth", "window_ms": 900000, "max": 5, "skip_successful": true },
//!     { "name": "booking", "window_ms": 3600000, "max": 20, "key": "user" }
//!   ]
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::policy::{Policy, PolicyError};
use crate::rate_limit::key::KeyStrategy;
use crate::rate_limit::store::DEFAULT_CLEANUP_INTERVAL;

/// Errors raised while loading configuration.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error(transparent)]
    InvalidPolicy(#[from] PolicyError),
    #[error("policy '{policy}': unknown key strategy '{key}' (expected \"ip\" or \"user\")")]
    UnknownKey { policy: String, key: String },
    #[error("cleanup_interval_secs must be > 0")]
    ZeroCleanupInterval,
}

fn default_cleanup_interval_secs() -> u64 {
    DEFAULT_CLEANUP_INTERVAL.as_secs()
}

fn default_key() -> String {
    "ip".to_string()
}

/// Top-level admission configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Period of the in-memory store sweep.
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    /// Store calls slower than this fail open.
    #[serde(default)]
    pub store_timeout_ms: Option<u64>,
    #[serde(default)]
    pub policies: Vec<PolicyConfig>,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            cleanup_interval_secs: default_cleanup_interval_secs(),
            store_timeout_ms: None,
            policies: Vec::new(),
        }
    }
}

/// One policy entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyConfig {
    pub name: String,
    pub window_ms: u64,
    pub max: u64,
    #[serde(default)]
    pub message: Option<String>,
    /// `"ip"` or `"user"`.
    #[serde(default = "default_key")]
    pub key: String,
    #[serde(default)]
    pub skip_successful: bool,
    #[serde(default)]
    pub skip_failed: bool,
}

impl AdmissionConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        Self::from_json_str(&raw)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn store_timeout(&self) -> Option<Duration> {
        self.store_timeout_ms.map(Duration::from_millis)
    }

    /// Validate every entry into a [`Policy`].
    pub fn build_policies(&self) -> Result<Vec<Policy>, ConfigError> {
        self.policies.iter().map(PolicyConfig::build).collect()
    }
}

impl PolicyConfig {
    pub fn build(&self) -> Result<Policy, ConfigError> {
        let key = match self.key.as_str() {
            "ip" => KeyStrategy::Ip,
            "user" => KeyStrategy::user(),
            other => {
                return Err(ConfigError::UnknownKey {
                    policy: self.name.clone(),
                    key: other.to_string(),
                })
            }
        };
        let mut builder = Policy::builder(self.name.clone())
            .window(Duration::from_millis(self.window_ms))
            .max(self.max)
            .key(key)
            .skip_successful(self.skip_successful)
            .skip_failed(self.skip_failed);
        if let Some(message) = &self.message {
            builder = builder.message(message.clone());
        }
        Ok(builder.build()?)
    }
}

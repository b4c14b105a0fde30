use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::retry::RetryPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("invalid config file {path}: {reason}")]
    Invalid { path: PathBuf, reason: String },
}

/// Service settings. Every field has a default, so a config file only needs
/// the values it wants to change.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Number of message channel partitions (and consumer workers).
    pub partitions: usize,
    /// Deadline for a single store call.
    pub store_timeout_ms: u64,
    /// Retries for store calls on the synchronous balance path.
    pub store_retry: RetryPolicy,
    /// Immediate publish retries before an event goes to the outbox.
    pub emit_retry: RetryPolicy,
    /// Backoff for the ledger consumer, which retries until shutdown.
    pub consumer_retry: RetryPolicy,
    /// Store readiness checks at startup.
    pub startup_retry: RetryPolicy,
    pub sweep_interval_ms: u64,
    /// File backing the outbox; kept in memory when unset.
    pub outbox_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            partitions: 4,
            store_timeout_ms: 2_000,
            store_retry: RetryPolicy::bounded(3, 10, 200),
            emit_retry: RetryPolicy::bounded(3, 10, 100),
            consumer_retry: RetryPolicy::unbounded(10, 1_000),
            startup_retry: RetryPolicy::bounded(10, 100, 3_000),
            sweep_interval_ms: 500,
            outbox_path: None,
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate().map_err(|reason| ConfigError::Invalid {
            path: path.to_path_buf(),
            reason,
        })?;
        Ok(config)
    }

    /// Balance-path and startup retries must be bounded; the ledger consumer
    /// retries until shutdown.
    pub fn validate(&self) -> Result<(), String> {
        if self.partitions == 0 {
            return Err("partitions must be at least 1".to_string());
        }
        for (name, policy) in [
            ("store_retry", &self.store_retry),
            ("emit_retry", &self.emit_retry),
            ("startup_retry", &self.startup_retry),
        ] {
            if policy.max_attempts.is_none() {
                return Err(format!("{name}.max_attempts must be set"));
            }
        }
        if self.consumer_retry.max_attempts.is_some() {
            return Err("consumer_retry.max_attempts must be null".to_string());
        }
        Ok(())
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

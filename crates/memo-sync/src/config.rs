//! Engine configuration loading and management

use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write config file {path:?}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config.json: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Main configuration for an autosave engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Base URL of the memo service (e.g. "https://notes.example.com/api")
    #[serde(default)]
    pub server_url: Option<String>,

    /// Retry schedule for transient write failures
    #[serde(default)]
    pub retry: RetryConfig,

    /// Bound on the flush performed when the page hides or unloads
    #[serde(default = "default_unload_deadline")]
    pub unload_deadline_ms: u64,

    /// Per-request HTTP timeout
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt (default: 2)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before each retry; the last entry repeats. Empty means
    /// exponential backoff from 1s, doubling up to 30s
    #[serde(default = "default_delays")]
    pub delays_ms: Vec<u64>,

    /// Timeout applied to each attempt
    #[serde(default = "default_attempt_timeout")]
    pub attempt_timeout_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            delays_ms: default_delays(),
            attempt_timeout_ms: default_attempt_timeout(),
        }
    }
}

fn default_max_retries() -> u32 {
    2
}

fn default_delays() -> Vec<u64> {
    vec![1000, 2000]
}

fn default_attempt_timeout() -> u64 {
    15_000
}

fn default_unload_deadline() -> u64 {
    2000
}

fn default_request_timeout() -> u64 {
    15_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            server_url: None,
            retry: RetryConfig::default(),
            unload_deadline_ms: default_unload_deadline(),
            request_timeout_ms: default_request_timeout(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from `<dir>/config.json`, writing the defaults
    /// there if the file does not exist yet.
    pub fn load(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let config_file = dir.join("config.json");

        if config_file.exists() {
            let content = std::fs::read_to_string(&config_file).map_err(|source| ConfigError::Read {
                path: config_file.clone(),
                source,
            })?;
            let config: EngineConfig = serde_json::from_str(&content)?;
            config.validate()?;
            tracing::info!("Loaded configuration from {:?}", config_file);
            Ok(config)
        } else {
            tracing::info!("No config file found at {:?}, using defaults", config_file);
            let config = EngineConfig::default();

            std::fs::create_dir_all(dir).map_err(|source| ConfigError::Write {
                path: dir.to_path_buf(),
                source,
            })?;

            // Write default config for reference
            let content = serde_json::to_string_pretty(&config)?;
            std::fs::write(&config_file, content).map_err(|source| ConfigError::Write {
                path: config_file.clone(),
                source,
            })?;
            tracing::info!("Created default config at {:?}", config_file);

            Ok(config)
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.retry.attempt_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "retry.attempt_timeout_ms must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let attempt_timeout = Duration::from_millis(self.retry.attempt_timeout_ms);
        if self.retry.max_retries == 0 {
            return RetryPolicy::no_retry(attempt_timeout);
        }
        if self.retry.delays_ms.is_empty() {
            return RetryPolicy {
                attempt_timeout,
                ..RetryPolicy::exponential(
                    self.retry.max_retries,
                    Duration::from_secs(1),
                    2.0,
                    Duration::from_secs(30),
                )
            };
        }
        RetryPolicy {
            max_retries: self.retry.max_retries,
            delays: self
                .retry
                .delays_ms
                .iter()
                .copied()
                .map(Duration::from_millis)
                .collect(),
            attempt_timeout,
        }
    }

    pub fn unload_deadline(&self) -> Duration {
        Duration::from_millis(self.unload_deadline_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

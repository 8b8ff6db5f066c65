//! Dispatcher configuration
//!
//! Loaded once at startup from `dispatcher.toml` (or a YAML file) and passed
//! by reference into [`PollingManager::start`](crate::PollingManager::start).

use crate::executor::retry::MAX_DURATION_SECS;
use crate::executor::RetryPolicy;
use crate::{DispatchError, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Database settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite connection string (`sqlite://path/to.db` or `sqlite::memory:`)
    #[serde(default = "default_database_url")]
    pub url: String,

    /// Connection pool size
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
        }
    }
}

fn default_database_url() -> String {
    "sqlite://dispatcher.db".to_string()
}

fn default_max_connections() -> u32 {
    5
}

/// Worker pool settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of tasks that may execute at the same time
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Safety-net re-check interval for `wait`, in milliseconds
    #[serde(default = "default_wait_fallback_ms")]
    pub wait_fallback_ms: u64,

    /// Fail tasks left non-terminal by a previous process on start
    #[serde(default = "default_recover_orphans")]
    pub recover_orphans: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            wait_fallback_ms: default_wait_fallback_ms(),
            recover_orphans: default_recover_orphans(),
        }
    }
}

fn default_pool_size() -> usize {
    4
}

fn default_wait_fallback_ms() -> u64 {
    1500
}

fn default_recover_orphans() -> bool {
    true
}

/// Terminal-task garbage collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Delete terminal tasks completed longer ago than this; unset keeps everything
    #[serde(default)]
    pub retain_terminal_secs: Option<u64>,

    /// How often the janitor runs
    #[serde(default = "default_gc_interval_secs")]
    pub gc_interval_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            retain_terminal_secs: None,
            gc_interval_secs: default_gc_interval_secs(),
        }
    }
}

fn default_gc_interval_secs() -> u64 {
    300
}

/// Defaults applied to submissions that leave fields unset
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DefaultsConfig {
    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Complete dispatcher configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DispatcherConfig {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub workers: WorkerConfig,

    #[serde(default)]
    pub retention: RetentionConfig,

    #[serde(default)]
    pub defaults: DefaultsConfig,
}

impl DispatcherConfig {
    /// Load configuration from a TOML or YAML file, chosen by extension
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            DispatchError::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        let config = match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content).map_err(|e| {
                DispatchError::Config(format!("Failed to parse YAML config: {}", e))
            })?,
            _ => Self::from_toml_str(&content)?,
        };

        Ok(config)
    }

    /// Load configuration from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| DispatchError::Config(format!("Failed to parse TOML config: {}", e)))
    }

    /// Load configuration from the default location, then apply env overrides
    ///
    /// Searches for config in:
    /// 1. DISPATCHER_CONFIG environment variable
    /// 2. ./config/dispatcher.toml
    /// 3. ./dispatcher.toml
    ///
    /// Falls back to defaults when no file exists.
    pub fn load() -> Result<Self> {
        let mut config = if let Ok(config_path) = env::var("DISPATCHER_CONFIG") {
            Self::from_file(config_path)?
        } else {
            let paths = [
                PathBuf::from("config/dispatcher.toml"),
                PathBuf::from("./dispatcher.toml"),
            ];

            match paths.iter().find(|path| path.exists()) {
                Some(path) => Self::from_file(path)?,
                None => {
                    tracing::debug!("No dispatcher config file found, using defaults");
                    Self::default()
                }
            }
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides
    ///
    /// Supported environment variables:
    /// - DISPATCHER_DATABASE_URL: SQLite connection string
    /// - DISPATCHER_WORKERS: Worker pool size
    /// - DISPATCHER_WAIT_FALLBACK_MS: Wait safety-net interval
    /// - DISPATCHER_RETENTION_SECS: Terminal task retention window
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = env::var("DISPATCHER_DATABASE_URL") {
            self.database.url = url;
        }

        if let Ok(workers) = env::var("DISPATCHER_WORKERS") {
            if let Ok(value) = workers.parse::<usize>() {
                self.workers.pool_size = value;
            }
        }

        if let Ok(fallback) = env::var("DISPATCHER_WAIT_FALLBACK_MS") {
            if let Ok(value) = fallback.parse::<u64>() {
                self.workers.wait_fallback_ms = value;
            }
        }

        if let Ok(retention) = env::var("DISPATCHER_RETENTION_SECS") {
            if let Ok(value) = retention.parse::<u64>() {
                self.retention.retain_terminal_secs = Some(value);
            }
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.database.url.is_empty() {
            return Err(DispatchError::Config("database.url cannot be empty".to_string()));
        }

        if self.database.max_connections == 0 {
            return Err(DispatchError::Config(
                "database.max_connections must be greater than 0".to_string(),
            ));
        }

        if self.workers.pool_size == 0 {
            return Err(DispatchError::Config(
                "workers.pool_size must be greater than 0".to_string(),
            ));
        }

        if self.workers.wait_fallback_ms == 0 {
            return Err(DispatchError::Config(
                "workers.wait_fallback_ms must be greater than 0".to_string(),
            ));
        }

        if self.retention.gc_interval_secs == 0 {
            return Err(DispatchError::Config(
                "retention.gc_interval_secs must be greater than 0".to_string(),
            ));
        }

        self.defaults
            .retry
            .validate()
            .map_err(|e| DispatchError::Config(format!("defaults.retry: {}", e)))?;

        if let Some(secs) = self.defaults.timeout_secs {
            if secs == 0 || secs as f64 > MAX_DURATION_SECS {
                return Err(DispatchError::Config(format!(
                    "defaults.timeout_secs must be between 1 and {}, got {}",
                    MAX_DURATION_SECS, secs
                )));
            }
        }

        Ok(())
    }

    /// Set the database URL
    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database.url = url.into();
        self
    }

    /// Set the worker pool size
    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.workers.pool_size = pool_size;
        self
    }

    /// Set the wait fallback interval
    pub fn with_wait_fallback(mut self, interval: Duration) -> Self {
        self.workers.wait_fallback_ms = interval.as_millis() as u64;
        self
    }

    /// Set the terminal task retention window
    pub fn with_retention(mut self, retain: Duration) -> Self {
        self.retention.retain_terminal_secs = Some(retain.as_secs());
        self
    }

    /// Set the default retry policy
    pub fn with_default_retry(mut self, policy: RetryPolicy) -> Self {
        self.defaults.retry = policy;
        self
    }

    pub fn wait_fallback(&self) -> Duration {
        Duration::from_millis(self.workers.wait_fallback_ms)
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.retention.gc_interval_secs)
    }

    pub fn retention(&self) -> Option<Duration> {
        self.retention.retain_terminal_secs.map(Duration::from_secs)
    }
}

//! Node configuration.
//!
//! # Hierarchy
//!
//! Configuration is loaded in this order (later overrides earlier):
//! 1. Built-in defaults
//! 2. TOML file passed with `--config`
//! 3. Environment variables: `TICKWORK_*`
//!
//! # Example Config
//!
//! ```toml
//! log_level = "info"
//!
//! [cluster]
//! node_id = "node-a"
//! member_timeout_ms = 5000
//!
//! [dispatcher]
//! batch_size = 32
//! max_concurrent = 8
//!
//! [store]
//! url = "rocksdb://data/tickwork"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::persistence::StoreConfig;
use crate::timers::{DispatcherConfig, ExecutorConfig};
use crate::{Error, Result};

const ENV_NODE_ID: &str = "TICKWORK_NODE_ID";
const ENV_STORE_URL: &str = "TICKWORK_STORE_URL";
const ENV_LOG_LEVEL: &str = "TICKWORK_LOG_LEVEL";

// ═══════════════════════════════════════════════════════════════════════════
// CONFIGURATION STRUCTURES
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    pub log_level: LogLevel,
    pub cluster: ClusterSection,
    pub dispatcher: DispatcherSection,
    pub executor: ExecutorSection,
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClusterSection {
    pub node_id: String,
    pub member_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DispatcherSection {
    pub batch_size: usize,
    pub max_concurrent: usize,
    pub misfire_grace_ms: u64,
    pub idle_poll_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExecutorSection {
    pub max_transient_retries: u32,
    pub retry_backoff_ms: u64,
    pub failure_retry_delay_ms: u64,
}

/// Log verbosity understood by the node's tracing filter.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Directive string for an env filter.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "trace" => Some(Self::Trace),
            "debug" => Some(Self::Debug),
            "info" => Some(Self::Info),
            "warn" | "warning" => Some(Self::Warn),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// DEFAULT IMPLEMENTATIONS
// ═══════════════════════════════════════════════════════════════════════════

impl Default for ClusterSection {
    fn default() -> Self {
        Self {
            node_id: "node-1".to_string(),
            member_timeout_ms: 5_000,
        }
    }
}

impl Default for DispatcherSection {
    fn default() -> Self {
        let defaults = DispatcherConfig::default();
        Self {
            batch_size: defaults.batch_size,
            max_concurrent: defaults.max_concurrent,
            misfire_grace_ms: u64::try_from(defaults.misfire_grace.num_milliseconds())
                .unwrap_or(60_000),
            idle_poll_ms: u64::try_from(defaults.idle_poll.as_millis()).unwrap_or(5_000),
        }
    }
}

impl Default for ExecutorSection {
    fn default() -> Self {
        let defaults = ExecutorConfig::default();
        Self {
            max_transient_retries: defaults.max_transient_retries,
            retry_backoff_ms: u64::try_from(defaults.retry_backoff.as_millis()).unwrap_or(50),
            failure_retry_delay_ms: u64::try_from(defaults.failure_retry_delay.as_millis())
                .unwrap_or(5_000),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// PUBLIC API
// ═══════════════════════════════════════════════════════════════════════════

impl EngineConfig {
    /// Load configuration: defaults, then `path` if given, then the
    /// process environment.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - The file cannot be read or is malformed TOML
    /// - An environment override is invalid
    /// - The resulting values fail validation
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides(std::env::vars())?;
        config.validate()?;
        Ok(config)
    }

    /// Read a TOML file. Missing keys keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::config_read_failed(path, e.to_string()))?;
        toml::from_str(&content).map_err(|e| Error::config_read_failed(path, e.to_string()))
    }

    /// Parse a TOML document.
    ///
    /// # Errors
    ///
    /// Returns error if the TOML is malformed.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::config_invalid(e.to_string()))
    }

    /// Apply `TICKWORK_*` overrides from `vars`.
    ///
    /// # Errors
    ///
    /// Returns error if an override value is invalid.
    pub fn apply_env_overrides<I>(&mut self, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            match key.as_str() {
                ENV_NODE_ID => self.cluster.node_id = value,
                ENV_STORE_URL => self.store.url = value,
                ENV_LOG_LEVEL => {
                    self.log_level = LogLevel::parse(&value).ok_or_else(|| {
                        Error::config_invalid(format!("Invalid {ENV_LOG_LEVEL} value: {value}"))
                    })?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// Returns error for an empty node id or store URL, or zero-sized pools.
    pub fn validate(&self) -> Result<()> {
        if self.cluster.node_id.trim().is_empty() {
            return Err(Error::config_invalid("cluster.node_id must not be empty"));
        }
        if self.cluster.member_timeout_ms == 0 {
            return Err(Error::config_invalid(
                "cluster.member_timeout_ms must be positive",
            ));
        }
        if self.dispatcher.batch_size == 0 {
            return Err(Error::config_invalid("dispatcher.batch_size must be positive"));
        }
        if self.dispatcher.max_concurrent == 0 {
            return Err(Error::config_invalid(
                "dispatcher.max_concurrent must be positive",
            ));
        }
        if self.dispatcher.idle_poll_ms == 0 {
            return Err(Error::config_invalid("dispatcher.idle_poll_ms must be positive"));
        }
        if self.store.url.trim().is_empty() {
            return Err(Error::config_invalid("store.url must not be empty"));
        }
        Ok(())
    }

    /// Dispatcher settings.
    #[must_use]
    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            batch_size: self.dispatcher.batch_size,
            max_concurrent: self.dispatcher.max_concurrent,
            misfire_grace: chrono::Duration::milliseconds(
                i64::try_from(self.dispatcher.misfire_grace_ms).unwrap_or(i64::MAX / 1_000_000),
            ),
            idle_poll: Duration::from_millis(self.dispatcher.idle_poll_ms),
        }
    }

    /// Executor settings.
    #[must_use]
    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            max_transient_retries: self.executor.max_transient_retries,
            retry_backoff: Duration::from_millis(self.executor.retry_backoff_ms),
            failure_retry_delay: Duration::from_millis(self.executor.failure_retry_delay_ms),
        }
    }

    /// Store connection settings.
    #[must_use]
    pub fn store_config(&self) -> StoreConfig {
        self.store.clone()
    }

    /// Bound on each member call during a cluster broadcast.
    #[must_use]
    pub fn member_timeout(&self) -> Duration {
        Duration::from_millis(self.cluster.member_timeout_ms)
    }
}

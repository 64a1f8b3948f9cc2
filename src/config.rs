//! Configuration loading and validation
//!
//! Configuration is a TOML file naming the reachable source nodes plus the
//! policy knobs the coordinator and maintainer consume: per-source connection
//! limits, fetch attempt limit and backoff parameters, maintenance interval
//! and retention grace period.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::constants::{maintenance, pool, retry};

fn default_listen_port() -> u16 {
    19090
}

fn default_store_dir() -> PathBuf {
    PathBuf::from("filedist-store")
}

fn default_max_connections() -> u32 {
    pool::DEFAULT_MAX_CONNECTIONS
}

fn default_max_attempts() -> u32 {
    retry::DEFAULT_MAX_ATTEMPTS
}

fn default_initial_backoff_ms() -> u64 {
    retry::DEFAULT_INITIAL_BACKOFF_MS
}

fn default_max_backoff_ms() -> u64 {
    retry::DEFAULT_MAX_BACKOFF_MS
}

fn default_request_timeout_ms() -> u64 {
    retry::DEFAULT_REQUEST_TIMEOUT_MS
}

fn default_interval_secs() -> u64 {
    maintenance::DEFAULT_INTERVAL_SECS
}

fn default_grace_secs() -> u64 {
    maintenance::DEFAULT_GRACE_SECS
}

/// Top-level daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Port the distribution RPC server listens on
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Root directory of the local content store
    #[serde(default = "default_store_dir")]
    pub store_dir: PathBuf,

    /// Re-hash downloaded payloads and reject digest mismatches
    #[serde(default)]
    pub verify_content: bool,

    /// Optional file listing currently active references, one per line
    ///
    /// Supplied by the configuration-generation owner; consumed read-only
    /// by the cache maintainer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_references_file: Option<PathBuf>,

    /// Candidate source nodes, in preference order
    pub sources: Vec<SourceConfig>,

    /// Fetch retry policy
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Cache maintenance policy
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
}

/// One reachable source node
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceConfig {
    pub host: String,
    pub port: u16,
    pub name: String,
    /// Maximum number of concurrent connections to this source
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl SourceConfig {
    /// The `host:port` address string of this source
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Fetch attempt limit and backoff parameters
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Maximum network attempts before a fetch fails terminally
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff after the first failed attempt, in milliseconds
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Backoff ceiling, in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Per-attempt request timeout, in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl RetryPolicy {
    /// Backoff to sleep after `attempt` failed attempts (1-based)
    ///
    /// Doubles per attempt starting from `initial_backoff_ms`, clamped to
    /// `max_backoff_ms`. Attempt 0 gets no backoff.
    #[must_use]
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exp = attempt.saturating_sub(1).min(32);
        let backoff = self
            .initial_backoff_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_backoff_ms);
        Duration::from_millis(backoff)
    }

    /// Per-attempt request timeout as a `Duration`
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Cache maintenance interval and retention grace period
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct MaintenanceConfig {
    /// Seconds between maintenance passes
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Minimum idle time before a stale artifact may be deleted, in seconds
    #[serde(default = "default_grace_secs")]
    pub retention_grace_secs: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            retention_grace_secs: default_grace_secs(),
        }
    }
}

impl MaintenanceConfig {
    /// Interval between passes as a `Duration`
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Retention grace period as a `Duration`
    #[must_use]
    pub fn retention_grace(&self) -> Duration {
        Duration::from_secs(self.retention_grace_secs)
    }
}

impl Config {
    /// Validate configuration for correctness
    ///
    /// Checks the semantic constraints serde cannot express:
    /// - at least one source, at most [`pool::MAX_SOURCES`]
    /// - non-empty source names and hosts, no duplicate names
    /// - non-zero connection limits, ports and attempt limit
    /// - backoff range sanity (warning only)
    pub fn validate(&self) -> Result<()> {
        if self.sources.is_empty() {
            anyhow::bail!("configuration must have at least one source");
        }
        if self.sources.len() > pool::MAX_SOURCES {
            anyhow::bail!(
                "at most {} sources are supported, got {}",
                pool::MAX_SOURCES,
                self.sources.len()
            );
        }

        for source in &self.sources {
            if source.name.is_empty() {
                anyhow::bail!("source name must not be empty");
            }
            if source.host.is_empty() {
                anyhow::bail!("source '{}' has an empty host", source.name);
            }
            if source.port == 0 {
                anyhow::bail!("source '{}' has port 0", source.name);
            }
            if source.max_connections == 0 {
                anyhow::bail!("source '{}' has max_connections 0", source.name);
            }
        }

        for (i, source) in self.sources.iter().enumerate() {
            if self.sources[..i].iter().any(|s| s.name == source.name) {
                anyhow::bail!("duplicate source name '{}'", source.name);
            }
        }

        if self.retry.max_attempts == 0 {
            anyhow::bail!("retry.max_attempts must be at least 1");
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            tracing::warn!(
                "retry.initial_backoff_ms ({}) exceeds retry.max_backoff_ms ({}); \
                 backoff will be constant at the ceiling",
                self.retry.initial_backoff_ms,
                self.retry.max_backoff_ms
            );
        }
        if self.maintenance.interval_secs == 0 {
            anyhow::bail!("maintenance.interval_secs must be at least 1");
        }

        Ok(())
    }
}

/// Load and parse a configuration file
pub fn load_config(config_path: &str) -> Result<Config> {
    let config_content = std::fs::read_to_string(config_path)
        .map_err(|e| anyhow::anyhow!("failed to read config file '{}': {}", config_path, e))?;

    let config: Config = toml::from_str(&config_content)
        .map_err(|e| anyhow::anyhow!("failed to parse config file '{}': {}", config_path, e))?;

    Ok(config)
}

/// A single-source default configuration, useful as a starting template
#[must_use]
pub fn create_default_config() -> Config {
    Config {
        listen_port: default_listen_port(),
        store_dir: default_store_dir(),
        verify_content: false,
        active_references_file: None,
        sources: vec![SourceConfig {
            host: "config-node.example.com".to_string(),
            port: 19090,
            name: "config-node".to_string(),
            max_connections: default_max_connections(),
        }],
        retry: RetryPolicy::default(),
        maintenance: MaintenanceConfig::default(),
    }
}

//! Configuration management for the resource governor.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{GovernorError, Result};
use crate::ratelimit::{GcraParams, RetryPolicy, DEFAULT_KEY_PREFIX};

/// Environment variable prefix for overrides, e.g. `GOVERNOR__LIMITS__BURST_CAPACITY`.
const ENV_PREFIX: &str = "GOVERNOR";

/// Main configuration for the resource governor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GovernorConfig {
    /// Global GCRA parameters
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Storage key layout
    #[serde(default)]
    pub storage: StorageConfig,

    /// CAS contention handling
    #[serde(default)]
    pub retry: RetryConfig,

    /// Route cost rules
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

/// Budget shared by every tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Units of budget regained per second
    #[serde(default = "default_refill_rate")]
    pub refill_rate: f64,

    /// Units that may be spent at once
    #[serde(default = "default_burst_capacity")]
    pub burst_capacity: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            refill_rate: default_refill_rate(),
            burst_capacity: default_burst_capacity(),
        }
    }
}

fn default_refill_rate() -> f64 {
    10.0
}

fn default_burst_capacity() -> u64 {
    100
}

/// Storage key configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Prefix prepended to tenant IDs
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
        }
    }
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

/// Retry behaviour when a CAS race is lost.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Give up after this many attempts; unset retries until the caller's deadline
    #[serde(default)]
    pub max_attempts: Option<u32>,

    /// First backoff delay in milliseconds; 0 retries immediately
    #[serde(default)]
    pub base_backoff_ms: u64,

    /// Largest single backoff delay in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            base_backoff_ms: 0,
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

fn default_max_backoff_ms() -> u64 {
    50
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.map(|n| n.max(1)),
            base_backoff: Duration::from_millis(self.base_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
        }
    }
}

/// A route cost rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    /// HTTP method; empty matches any
    #[serde(default)]
    pub method: String,

    /// Exact path, or a prefix when it ends with `/`
    pub path: String,

    /// Headers that must match exactly
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Units charged per matching request
    pub cost: u64,
}

impl GovernorConfig {
    /// Load configuration from a file, applying `GOVERNOR__*` environment overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading governor configuration");

        let config: GovernorConfig = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| {
                GovernorError::Config(format!("Failed to load {}: {}", path.display(), e))
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file without environment overrides.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: GovernorConfig = serde_yaml::from_str(yaml)
            .map_err(|e| GovernorError::Config(format!("Failed to parse governor config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check that the limits describe a schedulable rate and that routes are well formed.
    pub fn validate(&self) -> Result<()> {
        GcraParams::new(self.limits.refill_rate, self.limits.burst_capacity)?;

        if let Some(route) = self.routes.iter().find(|r| r.cost == 0) {
            return Err(GovernorError::Config(format!(
                "route {} {} has zero cost",
                route.method, route.path
            )));
        }
        Ok(())
    }
}

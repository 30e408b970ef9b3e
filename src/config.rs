//! Configuration management for the limiter.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{LimiterError, Result};

/// Immutable limiter configuration.
///
/// A limiter built from this holds no other state, so one instance can be
/// shared freely between tasks, threads and processes that talk to the same
/// store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Prefix of every store key written by this limiter
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Quota refilled over one period
    #[serde(default = "default_max_requests")]
    pub max_requests: f64,

    /// Length of the sliding window in seconds
    #[serde(default = "default_period_secs")]
    pub period_secs: f64,

    /// Guard contended updates with an advisory lock instead of CAS retries
    #[serde(default = "default_locking")]
    pub locking: bool,

    /// Wall-clock bound for lock acquisition or the CAS retry loop
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    /// Attempt bound for lock acquisition or the CAS retry loop
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Scale of the randomized backoff between attempts
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            max_requests: default_max_requests(),
            period_secs: default_period_secs(),
            locking: default_locking(),
            lock_timeout_ms: default_lock_timeout_ms(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
        }
    }
}

fn default_key_prefix() -> String {
    "hivemind".to_string()
}

fn default_max_requests() -> f64 {
    5.0
}

fn default_period_secs() -> f64 {
    8.0
}

fn default_locking() -> bool {
    true
}

fn default_lock_timeout_ms() -> u64 {
    500
}

fn default_max_attempts() -> u32 {
    32
}

fn default_backoff_base_ms() -> u64 {
    10
}

impl LimiterConfig {
    /// Create a configuration with the given quota and default tuning.
    pub fn new(max_requests: f64, period_secs: f64) -> Self {
        Self {
            max_requests,
            period_secs,
            ..Self::default()
        }
    }

    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading limiter configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: LimiterConfig = serde_yaml::from_str(yaml)
            .map_err(|e| LimiterError::Config(format!("Failed to parse limiter config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check that every bound is usable.
    pub fn validate(&self) -> Result<()> {
        if !(self.max_requests.is_finite() && self.max_requests > 0.0) {
            return Err(LimiterError::Config(format!(
                "max_requests must be a positive number, got {}",
                self.max_requests
            )));
        }
        if !(self.period_secs.is_finite() && self.period_secs > 0.0) {
            return Err(LimiterError::Config(format!(
                "period_secs must be a positive number, got {}",
                self.period_secs
            )));
        }
        if self.lock_timeout_ms == 0 {
            return Err(LimiterError::Config(
                "lock_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(LimiterError::Config(
                "max_attempts must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// The lock/CAS wall-clock bound.
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// The backoff scale.
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    /// TTL of the bucket records, in whole seconds.
    pub fn period_ttl(&self) -> u64 {
        self.period_secs.ceil() as u64
    }
}

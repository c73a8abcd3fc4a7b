//! Explicit, constructor-injected configuration for the arbiter.
//!
//! `ArbiterConfig` is threaded through component constructors rather than
//! read from a global, so every part of the service can be built with test
//! doubles without touching process-wide state.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Server-wide configuration for the arbiter process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArbiterConfig {
    /// Address the outward RPC surface binds to.
    pub address: String,
    /// Port the outward RPC surface binds to.
    pub port: u16,

    /// Window after a full detach during which a new attach from a
    /// different node is treated as a sequential handoff.
    #[serde(with = "duration_secs")]
    pub grace_period: Duration,

    /// Default migration timeout applied when a volume's provisioning
    /// context doesn't carry `migration_timeout_seconds`.
    pub migration_timeout_default_secs: u32,
    /// Minimum accepted `migration_timeout_seconds`.
    pub migration_timeout_min_secs: u32,
    /// Maximum accepted `migration_timeout_seconds`.
    pub migration_timeout_max_secs: u32,

    /// Interval between reconciler scans.
    #[serde(with = "duration_secs")]
    pub reconcile_interval: Duration,

    /// Bound on the device-busy check's own wait.
    #[serde(with = "duration_secs")]
    pub device_busy_check_timeout: Duration,
    /// Number of short-delay retries the interlock performs before
    /// concluding a device is in use.
    pub device_busy_check_retries: u32,

    /// Base URL of the orchestrator's node API. When set, the process
    /// talks to it over HTTP for node-existence checks; when unset, it
    /// falls back to an in-process fake, which is all a local run needs.
    pub orchestrator_base_url: Option<String>,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            port: 9100,
            grace_period: Duration::from_secs(30),
            migration_timeout_default_secs: 300,
            migration_timeout_min_secs: 30,
            migration_timeout_max_secs: 3600,
            reconcile_interval: Duration::from_secs(300),
            device_busy_check_timeout: Duration::from_secs(5),
            device_busy_check_retries: 2,
            orchestrator_base_url: None,
        }
    }
}

/// Errors reading or writing the on-disk configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ConfigError {
    FailedToWrite,
    ParseError,
}

impl ArbiterConfig {
    /// Reads configuration from `path`, writing out a default file (and
    /// returning the defaults) if none exists yet.
    pub fn read(path: &str) -> Result<Self, ConfigError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(_) => {
                let config = Self::default();
                config.write(path)?;
                return Ok(config);
            }
        };

        serde_json::from_str(&content).map_err(|_| ConfigError::ParseError)
    }

    pub fn write(&self, path: &str) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self).map_err(|_| ConfigError::ParseError)?;
        std::fs::write(path, content).map_err(|_| ConfigError::FailedToWrite)
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

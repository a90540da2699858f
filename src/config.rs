//! Configuration management for Tollgate.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, TollgateError};
use crate::ratelimit::{EscalationPolicy, StrategyKind, TierPolicy};

/// Prefix for environment variable overrides, e.g. `TOLLGATE__STRATEGY`.
pub const ENV_PREFIX: &str = "TOLLGATE";

/// Main configuration for the rate limiter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Limiting algorithm
    #[serde(default)]
    pub strategy: StrategyKind,

    /// Per-tier quotas
    #[serde(default)]
    pub tiers: TierPolicy,

    /// Sliding window configuration
    #[serde(default)]
    pub sliding_window: SlidingWindowConfig,

    /// Violation tracking and blocking
    #[serde(default)]
    pub escalation: EscalationConfig,

    /// Background maintenance
    #[serde(default)]
    pub maintenance: MaintenanceConfig,

    /// What to do when the limiter itself fails
    #[serde(default)]
    pub failure_mode: FailureMode,
}

/// Behavior when evaluating a limit fails internally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureMode {
    /// Admit the request
    #[default]
    Open,
    /// Deny the request
    Closed,
}

/// Sliding window configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlidingWindowConfig {
    /// Window length in minutes; 1 uses the per-minute limit, anything else the hourly one
    #[serde(default = "default_window_minutes")]
    pub window_minutes: u32,
}

impl Default for SlidingWindowConfig {
    fn default() -> Self {
        Self {
            window_minutes: default_window_minutes(),
        }
    }
}

fn default_window_minutes() -> u32 {
    1
}

/// Violation tracking and blocking configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationConfig {
    /// Violations within the window that trigger a block
    #[serde(default = "default_violation_threshold")]
    pub violation_threshold: u32,

    /// Rolling window for counting violations, in seconds
    #[serde(default = "default_violation_window")]
    pub violation_window_seconds: u64,

    /// Block length per retained violation, in seconds
    #[serde(default = "default_block_per_violation")]
    pub block_seconds_per_violation: u64,

    /// Longest single block, in seconds
    #[serde(default = "default_max_block")]
    pub max_block_seconds: u64,

    /// Retry hint returned for requests from a blocked IP address
    #[serde(default = "default_ip_retry_after")]
    pub ip_block_retry_after_seconds: u64,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            violation_threshold: default_violation_threshold(),
            violation_window_seconds: default_violation_window(),
            block_seconds_per_violation: default_block_per_violation(),
            max_block_seconds: default_max_block(),
            ip_block_retry_after_seconds: default_ip_retry_after(),
        }
    }
}

fn default_violation_threshold() -> u32 {
    10
}

fn default_violation_window() -> u64 {
    3600
}

fn default_block_per_violation() -> u64 {
    60
}

fn default_max_block() -> u64 {
    3600
}

fn default_ip_retry_after() -> u64 {
    300
}

impl EscalationConfig {
    /// Escalation parameters for the violation tracker.
    pub fn policy(&self) -> EscalationPolicy {
        EscalationPolicy {
            threshold: self.violation_threshold,
            window: Duration::from_secs(self.violation_window_seconds),
            block_per_violation: Duration::from_secs(self.block_seconds_per_violation),
            max_block: Duration::from_secs(self.max_block_seconds),
        }
    }
}

/// Background maintenance configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    /// Seconds between maintenance passes
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_seconds: u64,

    /// Pause after a failed pass, in seconds
    #[serde(default = "default_error_backoff")]
    pub error_backoff_seconds: u64,

    /// Idle time after which per-client state is dropped, in seconds
    #[serde(default = "default_state_retention")]
    pub state_retention_seconds: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            cleanup_interval_seconds: default_cleanup_interval(),
            error_backoff_seconds: default_error_backoff(),
            state_retention_seconds: default_state_retention(),
        }
    }
}

fn default_cleanup_interval() -> u64 {
    300
}

fn default_error_backoff() -> u64 {
    60
}

fn default_state_retention() -> u64 {
    86_400
}

impl MaintenanceConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_seconds)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_secs(self.error_backoff_seconds)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.state_retention_seconds)
    }
}

impl TollgateConfig {
    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TollgateConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Layer defaults, an optional YAML file and `TOLLGATE__*` environment variables.
    ///
    /// Nested keys use `__` as separator, e.g. `TOLLGATE__ESCALATION__VIOLATION_THRESHOLD=5`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading rate limit configuration");
            builder = builder.add_source(
                ::config::File::from(path).format(::config::FileFormat::Yaml),
            );
        }

        builder = builder.add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: TollgateConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the limiter cannot run with.
    pub fn validate(&self) -> Result<()> {
        self.tiers.validate()?;

        if self.sliding_window.window_minutes == 0 {
            return Err(TollgateError::Config(
                "sliding_window.window_minutes must be at least 1".to_string(),
            ));
        }
        if self.escalation.violation_threshold == 0 {
            return Err(TollgateError::Config(
                "escalation.violation_threshold must be at least 1".to_string(),
            ));
        }
        if self.escalation.violation_window_seconds == 0 {
            return Err(TollgateError::Config(
                "escalation.violation_window_seconds must be non-zero".to_string(),
            ));
        }
        if self.maintenance.cleanup_interval_seconds == 0 {
            return Err(TollgateError::Config(
                "maintenance.cleanup_interval_seconds must be non-zero".to_string(),
            ));
        }
        if self.maintenance.state_retention_seconds == 0 {
            return Err(TollgateError::Config(
                "maintenance.state_retention_seconds must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

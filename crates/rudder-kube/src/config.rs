//! Engine configuration
//!
//! Loaded from YAML; durations use humantime notation (`30s`, `5m`).
//!
//! ```yaml
//! defaultTimeout: 10m
//! poll:
//!   initialInterval: 500ms
//!   maxInterval: 5s
//!   multiplier: 2
//! fieldManager: rudder
//! storage:
//!   compression:
//!     method: zstd
//!     level: 3
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{KubeError, Result};
use crate::storage::StorageConfig;

/// Configuration shared by every engine operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// Timeout used when an operation doesn't specify one (default: 5m)
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub default_timeout: Duration,

    /// Completion polling for hooks, tests and readiness waits
    #[serde(default)]
    pub poll: PollConfig,

    /// Field manager name for server-side apply
    #[serde(default = "default_field_manager")]
    pub field_manager: String,

    #[serde(default)]
    pub storage: StorageConfig,
}

fn default_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_field_manager() -> String {
    "rudder".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_timeout: default_timeout(),
            poll: PollConfig::default(),
            field_manager: default_field_manager(),
            storage: StorageConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Parse and validate a YAML document
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a YAML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&content)
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_timeout.is_zero() {
            return Err(KubeError::InvalidConfig(
                "defaultTimeout must be greater than zero".to_string(),
            ));
        }
        if self.field_manager.trim().is_empty() {
            return Err(KubeError::InvalidConfig(
                "fieldManager must not be empty".to_string(),
            ));
        }
        self.poll.validate()
    }

    /// Resolve an operation's timeout against the default
    pub fn timeout_or_default(&self, timeout: Option<Duration>) -> Duration {
        timeout.unwrap_or(self.default_timeout)
    }
}

/// Bounded exponential backoff between completion polls
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollConfig {
    /// First delay (default: 1s)
    #[serde(default = "default_initial_interval", with = "humantime_serde")]
    pub initial_interval: Duration,

    /// Delay ceiling (default: 10s)
    #[serde(default = "default_max_interval", with = "humantime_serde")]
    pub max_interval: Duration,

    /// Growth factor per attempt (default: 2)
    #[serde(default = "default_multiplier")]
    pub multiplier: u32,
}

fn default_initial_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_max_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_multiplier() -> u32 {
    2
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            initial_interval: default_initial_interval(),
            max_interval: default_max_interval(),
            multiplier: default_multiplier(),
        }
    }
}

impl PollConfig {
    /// Constant-interval polling
    pub fn fixed(interval: Duration) -> Self {
        Self {
            initial_interval: interval,
            max_interval: interval,
            multiplier: 1,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.initial_interval.is_zero() {
            return Err(KubeError::InvalidConfig(
                "poll.initialInterval must be greater than zero".to_string(),
            ));
        }
        if self.max_interval < self.initial_interval {
            return Err(KubeError::InvalidConfig(
                "poll.maxInterval must not be smaller than poll.initialInterval".to_string(),
            ));
        }
        if self.multiplier == 0 {
            return Err(KubeError::InvalidConfig(
                "poll.multiplier must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn backoff(&self) -> Backoff {
        Backoff {
            next: self.initial_interval,
            max: self.max_interval,
            multiplier: self.multiplier.max(1),
        }
    }
}

/// Iterator-like delay sequence produced by [`PollConfig::backoff`]
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    max: Duration,
    multiplier: u32,
}

impl Backoff {
    /// Delay before the next attempt
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next.min(self.max);
        self.next = self
            .next
            .checked_mul(self.multiplier)
            .unwrap_or(self.max)
            .min(self.max);
        delay
    }
}

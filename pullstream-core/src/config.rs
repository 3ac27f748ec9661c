//! Configuration for the delivery engine.
//!
//! Loaded from TOML with one table per component. Every field has a default,
//! so an empty document is a valid configuration. Validation runs on load and
//! again when a provider is built, so contradictions never reach runtime.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
pub use pullstream_cache::CacheConfig;

/// Where a subscriber resumes after its cursor fell below the cache's low-water mark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapRecovery {
    /// Replay from the oldest item still cached.
    #[default]
    LowWaterMark,
    /// Skip to items produced from now on.
    Latest,
}

/// Pulling delivery agent settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Time without a successful delivery after which an agent may be torn down.
    #[serde(default = "default_stream_inactivity_period", with = "humantime_serde")]
    pub stream_inactivity_period: Duration,

    /// Maximum items read from the cache per subscriber per delivery.
    #[serde(default = "default_pull_batch_size")]
    pub pull_batch_size: usize,

    /// Poll timer period; also the delay before retrying a failed push.
    #[serde(default = "default_pull_interval", with = "humantime_serde")]
    pub pull_interval: Duration,

    /// Consecutive push failures before a subscription is marked degraded.
    #[serde(default = "default_max_delivery_attempts")]
    pub max_delivery_attempts: u32,

    /// How long in-flight deliveries may finish during shutdown.
    #[serde(default = "default_shutdown_grace", with = "humantime_serde")]
    pub shutdown_grace: Duration,

    #[serde(default)]
    pub gap_recovery: GapRecovery,
}

fn default_stream_inactivity_period() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_pull_batch_size() -> usize {
    16
}

fn default_pull_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_max_delivery_attempts() -> u32 {
    5
}

fn default_shutdown_grace() -> Duration {
    Duration::from_secs(5)
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            stream_inactivity_period: default_stream_inactivity_period(),
            pull_batch_size: default_pull_batch_size(),
            pull_interval: default_pull_interval(),
            max_delivery_attempts: default_max_delivery_attempts(),
            shutdown_grace: default_shutdown_grace(),
            gap_recovery: GapRecovery::default(),
        }
    }
}

/// Background maintenance settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Period of the inactivity sweep.
    #[serde(default = "default_monitor_poll_interval", with = "humantime_serde")]
    pub monitor_poll_interval: Duration,

    /// Period of the cache eviction pass.
    #[serde(default = "default_eviction_interval", with = "humantime_serde")]
    pub eviction_interval: Duration,

    /// Buffered lifecycle events per receiver before it starts lagging.
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

fn default_monitor_poll_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_eviction_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_event_channel_capacity() -> usize {
    256
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            monitor_poll_interval: default_monitor_poll_interval(),
            eviction_interval: default_eviction_interval(),
            event_channel_capacity: default_event_channel_capacity(),
        }
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub agent: AgentConfig,

    #[serde(default)]
    pub monitor: MonitorConfig,
}

impl StreamConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: StreamConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    #[must_use]
    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    #[must_use]
    pub fn with_inactivity_period(mut self, period: Duration) -> Self {
        self.agent.stream_inactivity_period = period;
        self
    }

    #[must_use]
    pub fn with_pull_batch_size(mut self, size: usize) -> Self {
        self.agent.pull_batch_size = size;
        self
    }

    #[must_use]
    pub fn with_pull_interval(mut self, interval: Duration) -> Self {
        self.agent.pull_interval = interval;
        self
    }

    #[must_use]
    pub fn with_max_delivery_attempts(mut self, attempts: u32) -> Self {
        self.agent.max_delivery_attempts = attempts;
        self
    }

    #[must_use]
    pub fn with_gap_recovery(mut self, recovery: GapRecovery) -> Self {
        self.agent.gap_recovery = recovery;
        self
    }

    #[must_use]
    pub fn with_monitor_poll_interval(mut self, interval: Duration) -> Self {
        self.monitor.monitor_poll_interval = interval;
        self
    }

    #[must_use]
    pub fn with_eviction_interval(mut self, interval: Duration) -> Self {
        self.monitor.eviction_interval = interval;
        self
    }

    /// Reject settings that cannot work together
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.cache.validate()?;

        if self.agent.pull_batch_size == 0 {
            return Err(invalid("pull_batch_size must be greater than zero"));
        }
        if self.agent.max_delivery_attempts == 0 {
            return Err(invalid("max_delivery_attempts must be greater than zero"));
        }
        if self.agent.pull_interval.is_zero() {
            return Err(invalid("pull_interval must be non-zero"));
        }
        if self.monitor.monitor_poll_interval.is_zero() {
            return Err(invalid("monitor_poll_interval must be non-zero"));
        }
        if self.monitor.eviction_interval.is_zero() {
            return Err(invalid("eviction_interval must be non-zero"));
        }
        if self.monitor.event_channel_capacity == 0 {
            return Err(invalid("event_channel_capacity must be greater than zero"));
        }
        Ok(())
    }
}

fn invalid(message: &str) -> ConfigError {
    ConfigError::Invalid(message.to_string())
}

//! EventHub configuration section.
//!
//! The controller's configuration subsystem owns the file; this module only
//! describes the `[eventhub]` section and checks it is coherent.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default interval between poll ticks.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Default interval between cleanup ticks.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Default maximum event age kept by the cleanup loop.
pub const DEFAULT_RETENTION_PERIOD: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid eventhub config: {0}")]
    Invalid(String),
}

/// Timing knobs for the poll and cleanup loops.
///
/// Durations are written as milliseconds (`poll_interval_ms = 500`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EventHubConfig {
    #[serde(rename = "poll_interval_ms", with = "duration_ms")]
    pub poll_interval: Duration,
    #[serde(rename = "cleanup_interval_ms", with = "duration_ms")]
    pub cleanup_interval: Duration,
    #[serde(rename = "retention_period_ms", with = "duration_ms")]
    pub retention_period: Duration,
}

impl Default for EventHubConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            retention_period: DEFAULT_RETENTION_PERIOD,
        }
    }
}

impl EventHubConfig {
    /// Parse an already-extracted `[eventhub]` section and validate it.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the loops cannot run with.
    ///
    /// Retention must exceed the poll interval, otherwise a cursor that is
    /// one tick behind could have its undelivered events pruned.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval.is_zero() {
            return Err(ConfigError::Invalid("poll_interval must be non-zero".into()));
        }
        if self.cleanup_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "cleanup_interval must be non-zero".into(),
            ));
        }
        if self.retention_period <= self.poll_interval {
            return Err(ConfigError::Invalid(format!(
                "retention_period ({:?}) must be longer than poll_interval ({:?})",
                self.retention_period, self.poll_interval
            )));
        }
        Ok(())
    }
}

// Duration <-> integer milliseconds
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis().try_into().unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

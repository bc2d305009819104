//! Runtime settings for the offline write pipeline.
//!
//! Values come from the environment (`WARD_*` variables) with validated
//! defaults, so clients and the API server tune retry and timer behaviour
//! the same way.

use std::collections::HashMap;
use std::env;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Tuning knobs for the network monitor, queue replay, and change stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSettings {
    /// Transient replay failures tolerated before an item becomes failed
    pub max_retries: u32,
    /// Upper bound for a single replay attempt
    pub replay_timeout: Duration,
    /// First backoff delay after a transient failure
    pub backoff_base: Duration,
    /// Backoff ceiling
    pub backoff_max: Duration,
    /// Period of the offline-duration recomputation
    pub offline_tick: Duration,
    /// Period of the connectivity probe fallback
    pub probe_interval: Duration,
    /// Buffered entries per broadcast channel
    pub channel_capacity: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            max_retries: 5,
            replay_timeout: Duration::from_secs(10),
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
            offline_tick: Duration::from_secs(1),
            probe_interval: Duration::from_secs(30),
            channel_capacity: 256,
        }
    }
}

impl SyncSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let max_retries = parse_u64(&lookup, "WARD_QUEUE_MAX_RETRIES", 1, 1_000)?
            .map_or(defaults.max_retries, |value| {
                u32::try_from(value).unwrap_or(u32::MAX)
            });
        let replay_timeout = parse_u64(&lookup, "WARD_REPLAY_TIMEOUT_MS", 100, 300_000)?
            .map_or(defaults.replay_timeout, Duration::from_millis);
        let backoff_base = parse_u64(&lookup, "WARD_BACKOFF_BASE_MS", 10, 600_000)?
            .map_or(defaults.backoff_base, Duration::from_millis);
        let backoff_max = parse_u64(&lookup, "WARD_BACKOFF_MAX_MS", 10, 3_600_000)?
            .map_or(defaults.backoff_max, Duration::from_millis);
        if backoff_max < backoff_base {
            return Err(ConfigError::Invalid(
                "WARD_BACKOFF_MAX_MS must be >= WARD_BACKOFF_BASE_MS".to_string(),
            ));
        }
        let offline_tick = parse_u64(&lookup, "WARD_OFFLINE_TICK_MS", 50, 60_000)?
            .map_or(defaults.offline_tick, Duration::from_millis);
        let probe_interval = parse_u64(&lookup, "WARD_PROBE_INTERVAL_SECS", 1, 3_600)?
            .map_or(defaults.probe_interval, Duration::from_secs);
        let channel_capacity = parse_u64(&lookup, "WARD_CHANNEL_CAPACITY", 16, 65_536)?
            .map_or(defaults.channel_capacity, |value| {
                usize::try_from(value).unwrap_or(defaults.channel_capacity)
            });

        Ok(Self {
            max_retries,
            replay_timeout,
            backoff_base,
            backoff_max,
            offline_tick,
            probe_interval,
            channel_capacity,
        })
    }

    /// Exponential backoff for the given number of failed attempts
    pub fn backoff_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(31);
        self.backoff_base
            .saturating_mul(1_u32 << exponent)
            .min(self.backoff_max)
    }
}

fn parse_u64(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    min: u64,
    max: u64,
) -> Result<Option<u64>, ConfigError> {
    let Some(raw) = lookup(name)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
    else {
        return Ok(None);
    };

    let value = raw.parse::<u64>().map_err(|_| {
        ConfigError::Invalid(format!("{name} must be an integer in [{min}, {max}]"))
    })?;
    if !(min..=max).contains(&value) {
        return Err(ConfigError::Invalid(format!(
            "{name} must be in [{min}, {max}]"
        )));
    }
    Ok(Some(value))
}

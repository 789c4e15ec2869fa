use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Engine tuning knobs.
///
/// Defaults are production-safe; hosts may deserialize this from their own
/// configuration source or call [`EngineConfig::from_env`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Delivery records retained per hook.
    pub history_count: usize,
    pub filter_max_length: usize,
    /// Interpreter steps one filter evaluation may take.
    pub filter_max_steps: usize,
    pub filter_timeout_ms: u64,
    pub max_headers: usize,
    pub confirm_timeout_ms: u64,
    pub delivery_timeout_ms: u64,
    /// Upper bound on in-flight deliveries across all events.
    pub max_concurrent_deliveries: usize,
    pub topics_refresh_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            history_count: 10,
            filter_max_length: 1_000,
            filter_max_steps: 10_000,
            filter_timeout_ms: 100,
            max_headers: 20,
            confirm_timeout_ms: 10_000,
            delivery_timeout_ms: 10_000,
            max_concurrent_deliveries: 32,
            topics_refresh_interval_ms: 60_000,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: &'static str, value: String },
    #[error("{key} must be greater than zero")]
    Zero { key: &'static str },
}

impl EngineConfig {
    /// Defaults overlaid with `HOOK_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        overlay(&lookup, "HOOK_HISTORY_COUNT", &mut config.history_count)?;
        overlay(&lookup, "HOOK_FILTER_MAX_LENGTH", &mut config.filter_max_length)?;
        overlay(&lookup, "HOOK_FILTER_MAX_STEPS", &mut config.filter_max_steps)?;
        overlay(&lookup, "HOOK_FILTER_TIMEOUT_MS", &mut config.filter_timeout_ms)?;
        overlay(&lookup, "HOOK_MAX_HEADERS", &mut config.max_headers)?;
        overlay(&lookup, "HOOK_CONFIRM_TIMEOUT_MS", &mut config.confirm_timeout_ms)?;
        overlay(&lookup, "HOOK_DELIVERY_TIMEOUT_MS", &mut config.delivery_timeout_ms)?;
        overlay(&lookup, "HOOK_MAX_CONCURRENT_DELIVERIES", &mut config.max_concurrent_deliveries)?;
        overlay(&lookup, "HOOK_TOPICS_REFRESH_INTERVAL_MS", &mut config.topics_refresh_interval_ms)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects knobs that would disable a subsystem outright: a zero timeout
    /// fails every attempt, a zero interval cannot be scheduled.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let knobs = [
            ("HOOK_FILTER_MAX_STEPS", self.filter_max_steps as u64),
            ("HOOK_FILTER_TIMEOUT_MS", self.filter_timeout_ms),
            ("HOOK_CONFIRM_TIMEOUT_MS", self.confirm_timeout_ms),
            ("HOOK_DELIVERY_TIMEOUT_MS", self.delivery_timeout_ms),
            ("HOOK_MAX_CONCURRENT_DELIVERIES", self.max_concurrent_deliveries as u64),
            ("HOOK_TOPICS_REFRESH_INTERVAL_MS", self.topics_refresh_interval_ms),
        ];
        match knobs.into_iter().find(|(_, value)| *value == 0) {
            Some((key, _)) => Err(ConfigError::Zero { key }),
            None => Ok(()),
        }
    }

    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_millis(self.confirm_timeout_ms)
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }

    pub fn filter_timeout(&self) -> Duration {
        Duration::from_millis(self.filter_timeout_ms)
    }

    pub fn topics_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.topics_refresh_interval_ms)
    }
}

fn overlay<F, T>(lookup: &F, key: &'static str, slot: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    let Some(raw) = lookup(key) else {
        return Ok(());
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(());
    }
    *slot = trimmed.parse().map_err(|_| ConfigError::InvalidValue {
        key,
        value: raw.clone(),
    })?;
    Ok(())
}

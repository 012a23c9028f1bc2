//! TOML-based reconciler configuration.
//!
//! Stores tuning for:
//! - Checkpoint cadence (how often today's total is written)
//! - Tracking behaviour (storage key prefix, manual override, tick period)
//!
//! Configuration is stored at `~/.config/stepgarden/config.toml`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::data_dir;
use crate::error::ConfigError;

/// Longest accepted checkpoint interval (one day).
pub const MAX_INTERVAL_SECS: u64 = 86_400;
/// Longest accepted service tick (one hour).
pub const MAX_TICK_SECS: u64 = 3_600;

/// When today's total is written to storage while readings stream in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Write once the total has grown by this many steps since the last write.
    #[serde(default = "default_every_steps")]
    pub every_steps: u64,
    /// Write once this many seconds have passed since the last write.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Write on every accepted reading (ignores the two limits above).
    #[serde(default)]
    pub every_accepted_reading: bool,
}

/// Tracking behaviour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackingConfig {
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Allow manual additions while a sensor backend is active.
    #[serde(default = "default_true")]
    pub manual_override: bool,
    /// Period of the rollover / checkpoint tick in the service loop.
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
}

/// Application configuration.
///
/// Serialized to/from TOML at `~/.config/stepgarden/config.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub tracking: TrackingConfig,
}

fn default_every_steps() -> u64 {
    20
}
fn default_interval_secs() -> u64 {
    30
}
fn default_key_prefix() -> String {
    "daily_steps_".into()
}
fn default_true() -> bool {
    true
}
fn default_tick_secs() -> u64 {
    60
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            every_steps: default_every_steps(),
            interval_secs: default_interval_secs(),
            every_accepted_reading: false,
        }
    }
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            manual_override: true,
            tick_secs: default_tick_secs(),
        }
    }
}

impl CheckpointConfig {
    /// Interval between time-based writes, capped at [`MAX_INTERVAL_SECS`].
    pub fn interval(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.interval_secs.min(MAX_INTERVAL_SECS) as i64)
    }
}

impl TrackingConfig {
    /// Service tick, kept within 1..=[`MAX_TICK_SECS`] seconds.
    pub fn tick_period(&self) -> Duration {
        Duration::from_secs(self.tick_secs.clamp(1, MAX_TICK_SECS))
    }
}

impl Config {
    /// Check numeric settings are in range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let out_of_range = |key: &str, value: u64, min: u64, max: u64| {
            if (min..=max).contains(&value) {
                Ok(())
            } else {
                Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: format!("{value} is outside {min}..={max}"),
                })
            }
        };
        out_of_range(
            "checkpoint.interval_secs",
            self.checkpoint.interval_secs,
            0,
            MAX_INTERVAL_SECS,
        )?;
        out_of_range("tracking.tick_secs", self.tracking.tick_secs, 1, MAX_TICK_SECS)
    }

    fn get_json_value_by_path<'a>(
        root: &'a serde_json::Value,
        key: &str,
    ) -> Option<&'a serde_json::Value> {
        if key.is_empty() {
            return None;
        }

        let mut current = root;
        for part in key.split('.') {
            current = current.get(part)?;
        }
        Some(current)
    }

    fn set_json_value_by_path(
        root: &mut serde_json::Value,
        key: &str,
        value: &str,
    ) -> Result<(), ConfigError> {
        let unknown = || ConfigError::UnknownKey(key.to_string());
        let invalid = |message: String| ConfigError::InvalidValue {
            key: key.to_string(),
            message,
        };

        let mut parts = key.split('.').peekable();
        if parts.peek().map_or(true, |p| p.is_empty()) {
            return Err(unknown());
        }

        let mut current = root;
        while let Some(part) = parts.next() {
            if parts.peek().is_none() {
                let obj = current.as_object_mut().ok_or_else(unknown)?;
                let existing = obj.get(part).ok_or_else(unknown)?;

                let new_value = match existing {
                    serde_json::Value::Bool(_) => value
                        .parse::<bool>()
                        .map(serde_json::Value::Bool)
                        .map_err(|e| invalid(e.to_string()))?,
                    serde_json::Value::Number(_) => value
                        .parse::<u64>()
                        .map(|n| serde_json::Value::Number(n.into()))
                        .map_err(|_| invalid(format!("cannot parse '{value}' as number")))?,
                    serde_json::Value::Object(_) | serde_json::Value::Array(_) => {
                        serde_json::from_str(value).map_err(|e| invalid(e.to_string()))?
                    }
                    _ => serde_json::Value::String(value.into()),
                };

                obj.insert(part.to_string(), new_value);
                return Ok(());
            }

            current = current.get_mut(part).ok_or_else(unknown)?;
        }

        Err(unknown())
    }

    fn path() -> Result<PathBuf, ConfigError> {
        data_dir()
            .map(|dir| dir.join("config.toml"))
            .map_err(|e| ConfigError::LoadFailed {
                path: PathBuf::from("~/.config/stepgarden/config.toml"),
                message: e.to_string(),
            })
    }

    /// Load from the data directory or write and return the default.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed,
    /// or if the default config cannot be written to disk.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::path()?)
    }

    /// Load from `path` or write and return the default.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let cfg: Config = toml::from_str(&content)?;
                cfg.validate()?;
                Ok(cfg)
            }
            Err(_) => {
                let cfg = Self::default();
                cfg.save_to(path)?;
                Ok(cfg)
            }
        }
    }

    /// Persist to the data directory.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::path()?)
    }

    /// Persist to `path`.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let save_err = |message: String| ConfigError::SaveFailed {
            path: path.to_path_buf(),
            message,
        };
        let content = toml::to_string_pretty(self).map_err(|e| save_err(e.to_string()))?;
        std::fs::write(path, content).map_err(|e| save_err(e.to_string()))
    }

    /// Get a config value as string by dot-separated key.
    pub fn get(&self, key: &str) -> Option<String> {
        let json = serde_json::to_value(self).ok()?;
        let val = Self::get_json_value_by_path(&json, key)?;
        match val {
            serde_json::Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    /// Set a config value by dot-separated key without saving.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is unknown, the value cannot be parsed,
    /// or the result is out of range.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let mut json = serde_json::to_value(&*self)
            .map_err(|e| ConfigError::ParseFailed(e.to_string()))?;
        Self::set_json_value_by_path(&mut json, key, value)?;
        let updated: Config =
            serde_json::from_value(json).map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            })?;
        updated.validate()?;
        *self = updated;
        Ok(())
    }

    /// Load from disk, returning default on error.
    /// This is a convenience method that never fails.
    pub fn load_or_default() -> Self {
        Self::load().unwrap_or_default()
    }
}

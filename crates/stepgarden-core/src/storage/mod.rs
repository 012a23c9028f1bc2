mod checkpoint;
mod config;
pub mod database;
mod memory;

pub use checkpoint::CheckpointWriter;
pub use config::{CheckpointConfig, Config, TrackingConfig};
pub use database::Database;
pub use memory::MemoryStore;

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::error::StorageError;

/// Passive string key-value store holding one record per calendar day.
///
/// Implementations do no locking of their own beyond what their backing
/// store needs; the reconciler is the only writer of step keys.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
}

/// Storage key of the record for `date`, e.g. `daily_steps_2024-03-09`.
pub fn day_key(prefix: &str, date: NaiveDate) -> String {
    format!("{prefix}{}", date.format("%Y-%m-%d"))
}

/// Parse a stored step total. `None` for anything that is not a
/// non-negative decimal integer.
pub fn parse_total(value: &str) -> Option<u64> {
    value.trim().parse::<u64>().ok()
}

/// Returns `~/.config/stepgarden[-dev]/` based on STEPGARDEN_ENV.
///
/// Set STEPGARDEN_ENV=dev to use development data directory.
///
/// # Errors
/// Returns an error if creating the config directory fails.
pub fn data_dir() -> Result<PathBuf, std::io::Error> {
    let base_dir = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config");

    let env = std::env::var("STEPGARDEN_ENV").unwrap_or_else(|_| "production".to_string());

    let dir = if env == "dev" {
        base_dir.join("stepgarden-dev")
    } else {
        base_dir.join("stepgarden")
    };

    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

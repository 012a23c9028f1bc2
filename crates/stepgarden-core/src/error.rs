//! Core error types for stepgarden-core.
//!
//! Errors are grouped by the collaborator that produced them. Sensor and
//! reading errors never escape the reconciler: it turns them into tracking
//! mode or permission changes, or logs them and carries on. [`CoreError`]
//! covers what the service surface can fail with: opening storage and
//! configuration, and talking to a task that has shut down.

use std::path::PathBuf;
use thiserror::Error;

/// Core error type for stepgarden-core.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Persistence errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The reconciler task has shut down
    #[error("Step tracking service has stopped")]
    ServiceStopped,
}

/// Persistence collaborator failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Failed to open the backing store
    #[error("Failed to open store at {path}: {message}")]
    Open { path: PathBuf, message: String },

    /// A read for `key` failed
    #[error("Failed to read '{key}': {message}")]
    Read { key: String, message: String },

    /// A write for `key` failed
    #[error("Failed to write '{key}': {message}")]
    Write { key: String, message: String },

    /// The checkpoint writer task is gone
    #[error("Checkpoint writer is no longer running")]
    WriterClosed,
}

/// Step sensor backend failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SensorError {
    /// Backend not present on this device/platform
    #[error("Step sensor '{backend}' is unavailable")]
    Unavailable { backend: String },

    /// User or OS refused access
    #[error("Permission denied for step sensor '{backend}'")]
    PermissionDenied { backend: String },

    /// Subscribing or receiving readings failed
    #[error("Step sensor subscription failed: {0}")]
    Subscription(String),

    /// An absolute step-count query failed
    #[error("Step count query failed: {0}")]
    Query(String),
}

/// Raw readings the reconciler refuses to apply.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReadingError {
    #[error("raw reading {0} is negative")]
    Negative(i64),
}

/// Configuration-specific errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to load configuration
    #[error("Failed to load configuration from {path}: {message}")]
    LoadFailed { path: PathBuf, message: String },

    /// Failed to save configuration
    #[error("Failed to save configuration to {path}: {message}")]
    SaveFailed { path: PathBuf, message: String },

    /// Invalid configuration value
    #[error("Invalid configuration value for '{key}': {message}")]
    InvalidValue { key: String, message: String },

    /// Unknown configuration key
    #[error("Unknown configuration key: {0}")]
    UnknownKey(String),

    /// Failed to parse configuration
    #[error("Failed to parse configuration: {0}")]
    ParseFailed(String),
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        ConfigError::ParseFailed(err.to_string())
    }
}

/// Result type alias for CoreError
pub type Result<T, E = CoreError> = std::result::Result<T, E>;

//! # Stepgarden Core Library
//!
//! This library provides the step-counting core of Stepgarden, a walking
//! companion where the day's steps grow a small garden. It reconciles
//! readings from whichever step sensor the device offers into one
//! trustworthy daily total, and falls back to manual entry when no sensor
//! can be used.
//!
//! ## Architecture
//!
//! - **Tracker**: Reconciles cumulative sensor readings, absolute platform
//!   counts and manual entries into a non-decreasing per-day total, with
//!   backend failover (native, then generic, then manual)
//! - **Storage**: Key-value persistence of one record per local day (SQLite
//!   or in-memory), a single-writer checkpoint queue, and TOML configuration
//! - **Growth**: Maps the day's total to a garden stage
//!
//! ## Key Components
//!
//! - [`StepReconciler`]: Core reconciliation state machine
//! - [`ReconcilerService`]: Runs a reconciler on a tokio task and publishes snapshots
//! - [`StepBackend`]: Trait implemented by platform sensor glue
//! - [`Database`]: SQLite-backed daily step storage
//! - [`Config`]: Checkpoint and tracking configuration

pub mod clock;
pub mod error;
pub mod events;
pub mod growth;
pub mod logging;
pub mod storage;
pub mod tracker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{ConfigError, CoreError, ReadingError, SensorError, StorageError};
pub use events::Event;
pub use growth::GrowthStage;
pub use storage::{CheckpointWriter, Config, Database, KeyValueStore, MemoryStore};
pub use tracker::{
    BackendKind, DailyStepRecord, PermissionState, ReconcilerHandle, ReconcilerService,
    StepBackend, StepReconciler, StepSnapshot, TrackingMode,
};

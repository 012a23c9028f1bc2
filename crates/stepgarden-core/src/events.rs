use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::tracker::{BackendKind, PermissionState, TrackingMode};

/// Every state change in the reconciler produces an Event.
/// The UI layer renders snapshots; events are for whoever wants the history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    TrackingStarted {
        mode: TrackingMode,
        permission: PermissionState,
        backend: Option<BackendKind>,
        baseline_steps: u64,
        at: NaiveDateTime,
    },
    TrackingStopped {
        steps: u64,
        at: NaiveDateTime,
    },
    PermissionChanged {
        permission: PermissionState,
        at: NaiveDateTime,
    },
    /// A backend could not be used and the next one (or manual) took over.
    BackendDemoted {
        backend: BackendKind,
        reason: String,
        at: NaiveDateTime,
    },
    ModeChanged {
        from: TrackingMode,
        to: TrackingMode,
        at: NaiveDateTime,
    },
    StepsUpdated {
        steps: u64,
        at: NaiveDateTime,
    },
    /// The sensor epoch reset; counting re-anchored at `raw`.
    RebootDetected {
        previous_reference: u64,
        raw: u64,
        steps: u64,
        at: NaiveDateTime,
    },
    ManualStepsAdded {
        amount: u64,
        steps: u64,
        at: NaiveDateTime,
    },
    ManualStepsRejected {
        amount: u64,
        at: NaiveDateTime,
    },
    /// An absolute platform count replaced the reconciled one.
    AbsoluteRefresh {
        backend: BackendKind,
        steps: u64,
        at: NaiveDateTime,
    },
    DayRolledOver {
        finalized: NaiveDate,
        final_steps: u64,
        today: NaiveDate,
        at: NaiveDateTime,
    },
    CheckpointSubmitted {
        date: NaiveDate,
        steps: u64,
        at: NaiveDateTime,
    },
}

mod backend;
mod policy;
mod reconciler;
mod record;
mod service;
mod session;
mod state;

#[cfg(test)]
pub(crate) mod fakes;

pub use backend::{
    BackendCapabilities, BackendKind, DayRange, PermissionGrant, ReadingSink, SensorEvent,
    SensorSignal, StepBackend, SubscriptionHandle,
};
pub use policy::CheckpointPolicy;
pub use reconciler::StepReconciler;
pub use record::DailyStepRecord;
pub use service::{ReconcilerHandle, ReconcilerService};
pub use session::{ReadingOutcome, SensorSession};
pub use state::{PermissionState, StepSnapshot, TrackingMode};

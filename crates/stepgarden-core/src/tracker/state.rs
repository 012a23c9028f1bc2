use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::BackendKind;
use crate::growth::GrowthStage;

/// Step sensor permission as last observed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionState {
    #[default]
    Undetermined,
    Granted,
    Denied,
}

/// Where today's step count comes from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackingMode {
    /// A sensor backend is subscribed.
    Sensor,
    /// The user enters steps by hand.
    Manual,
    /// Not probed yet, or stopped.
    #[default]
    Unavailable,
}

/// The reactive value exposed to the UI layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepSnapshot {
    pub date: NaiveDate,
    pub steps: u64,
    pub mode: TrackingMode,
    pub permission: PermissionState,
    pub backend: Option<BackendKind>,
    pub stage: GrowthStage,
    pub steps_to_next_stage: Option<u64>,
}

impl StepSnapshot {
    pub fn new(
        date: NaiveDate,
        steps: u64,
        mode: TrackingMode,
        permission: PermissionState,
        backend: Option<BackendKind>,
    ) -> Self {
        Self {
            date,
            steps,
            mode,
            permission,
            backend,
            stage: GrowthStage::for_steps(steps),
            steps_to_next_stage: GrowthStage::steps_to_next(steps),
        }
    }

    /// Manual entry is offered whenever no sensor is feeding the count.
    pub fn manual_entry_offered(&self) -> bool {
        self.mode != TrackingMode::Sensor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_before_tracking_starts() {
        assert_eq!(PermissionState::default(), PermissionState::Undetermined);
        assert_eq!(TrackingMode::default(), TrackingMode::Unavailable);
    }

    #[test]
    fn snapshot_offers_manual_entry_without_sensor() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
        let snapshot = StepSnapshot::new(
            date,
            2_600,
            TrackingMode::default(),
            PermissionState::default(),
            None,
        );
        assert!(snapshot.manual_entry_offered());
        assert_eq!(snapshot.stage, GrowthStage::Sprout);
        assert_eq!(snapshot.steps_to_next_stage, Some(2_400));
    }
}

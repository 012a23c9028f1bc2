//! Delta accumulation for one sensor tracking session.
//!
//! A raw reading is a cumulative count since an arbitrary, device-chosen
//! epoch. The session remembers the first raw value it saw (the reference)
//! and the day total that was already accounted for (the baseline); the
//! day total is `baseline + (raw - reference)`.
//!
//! Invariants:
//! - `raw - reference` is never negative: a raw value below the reference
//!   means the sensor epoch reset (reboot) and the reference is re-anchored.
//! - A reboot folds the displayed total into the baseline, so steps counted
//!   before the reset stay counted.
//! - A candidate total below the displayed total is never applied.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadingOutcome {
    /// First reading of the session; it became the reference.
    Anchored,
    /// The sensor epoch went backwards and the reference was re-anchored.
    Rebooted { previous_reference: u64 },
    /// The displayed total moved up.
    Advanced { total: u64 },
    /// The candidate equals the displayed total.
    Unchanged,
    /// The candidate was below the displayed total and was dropped.
    Suppressed { candidate: u64 },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorSession {
    reference_raw_count: Option<u64>,
    baseline_steps: u64,
}

impl SensorSession {
    pub fn new(baseline_steps: u64) -> Self {
        Self {
            reference_raw_count: None,
            baseline_steps,
        }
    }

    pub fn reference_raw_count(&self) -> Option<u64> {
        self.reference_raw_count
    }

    pub fn baseline_steps(&self) -> u64 {
        self.baseline_steps
    }

    /// Start counting from `total`; the next reading re-anchors.
    pub fn rebaseline(&mut self, total: u64) {
        self.baseline_steps = total;
        self.reference_raw_count = None;
    }

    /// Forget everything (new day).
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Fold `raw` into the session given the currently displayed total.
    pub fn observe(&mut self, raw: u64, displayed: u64) -> ReadingOutcome {
        let reference = match self.reference_raw_count {
            None => {
                self.reference_raw_count = Some(raw);
                return ReadingOutcome::Anchored;
            }
            Some(reference) if raw < reference => {
                self.reference_raw_count = Some(raw);
                self.baseline_steps = self.baseline_steps.max(displayed);
                return ReadingOutcome::Rebooted {
                    previous_reference: reference,
                };
            }
            Some(reference) => reference,
        };

        let candidate = self.baseline_steps.saturating_add(raw - reference);
        match candidate.cmp(&displayed) {
            std::cmp::Ordering::Greater => ReadingOutcome::Advanced { total: candidate },
            std::cmp::Ordering::Equal => ReadingOutcome::Unchanged,
            std::cmp::Ordering::Less => ReadingOutcome::Suppressed { candidate },
        }
    }
}

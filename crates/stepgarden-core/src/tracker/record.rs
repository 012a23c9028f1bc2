use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::storage::{day_key, parse_total};

/// The reconciled step total for one local calendar day.
///
/// While `date` is today the total only grows; after rollover it is history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyStepRecord {
    pub date: NaiveDate,
    pub total_steps: u64,
}

impl DailyStepRecord {
    pub fn empty(date: NaiveDate) -> Self {
        Self {
            date,
            total_steps: 0,
        }
    }

    pub fn key(&self, prefix: &str) -> String {
        day_key(prefix, self.date)
    }

    /// Build from a stored value; `None` if the value is not a step total.
    pub fn from_stored(date: NaiveDate, value: &str) -> Option<Self> {
        parse_total(value).map(|total_steps| Self { date, total_steps })
    }

    /// Raise the total to `candidate` if it is higher. Returns whether it moved.
    pub fn raise_to(&mut self, candidate: u64) -> bool {
        if candidate > self.total_steps {
            self.total_steps = candidate;
            true
        } else {
            false
        }
    }
}

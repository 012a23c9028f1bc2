use chrono::NaiveDateTime;

use crate::storage::CheckpointConfig;

/// Decides when a streaming total is worth writing.
///
/// Lifecycle checkpoints (background, manual entry, reboot, rollover, stop)
/// bypass the policy and call [`CheckpointPolicy::record`] directly.
#[derive(Debug, Clone)]
pub struct CheckpointPolicy {
    config: CheckpointConfig,
    last_total: Option<u64>,
    last_at: Option<NaiveDateTime>,
}

impl CheckpointPolicy {
    pub fn new(config: CheckpointConfig) -> Self {
        Self {
            config,
            last_total: None,
            last_at: None,
        }
    }

    /// Whether `total` at `now` should be written.
    pub fn due(&self, total: u64, now: NaiveDateTime) -> bool {
        if self.config.every_accepted_reading {
            return true;
        }
        let (Some(last_total), Some(last_at)) = (self.last_total, self.last_at) else {
            return true;
        };
        if total <= last_total {
            return false;
        }
        total - last_total >= self.config.every_steps.max(1)
            || now - last_at >= self.config.interval()
    }

    /// A write of `total` was submitted at `now`.
    pub fn record(&mut self, total: u64, now: NaiveDateTime) {
        self.last_total = Some(total);
        self.last_at = Some(now);
    }

    /// A total that grew since the last write, if it is time to write it.
    pub fn stale_total(&self, total: u64, now: NaiveDateTime) -> Option<u64> {
        let changed = self.last_total.map_or(true, |last| total > last);
        let waited = self
            .last_at
            .map_or(true, |at| now - at >= self.config.interval());
        (changed && waited).then_some(total)
    }

    /// Forget the last write (new day).
    pub fn reset(&mut self) {
        self.last_total = None;
        self.last_at = None;
    }
}

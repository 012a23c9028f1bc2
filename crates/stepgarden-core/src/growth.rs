//! Garden growth stages derived from today's step count.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GrowthStage {
    #[default]
    Seed,
    Sprout,
    Flower,
    Forest,
    Summit,
}

impl GrowthStage {
    /// Lower step bound (inclusive) of each stage, in ascending order.
    const THRESHOLDS: [(u64, GrowthStage); 5] = [
        (0, GrowthStage::Seed),
        (2_500, GrowthStage::Sprout),
        (5_000, GrowthStage::Flower),
        (7_500, GrowthStage::Forest),
        (10_000, GrowthStage::Summit),
    ];

    pub fn for_steps(steps: u64) -> Self {
        Self::THRESHOLDS
            .iter()
            .rev()
            .find(|(min, _)| steps >= *min)
            .map(|(_, stage)| *stage)
            .unwrap_or(GrowthStage::Seed)
    }

    pub fn label(&self) -> &'static str {
        match self {
            GrowthStage::Seed => "Seed",
            GrowthStage::Sprout => "Sprout",
            GrowthStage::Flower => "Flower",
            GrowthStage::Forest => "Forest",
            GrowthStage::Summit => "Summit",
        }
    }

    /// Steps still needed to reach the next stage, `None` at the top.
    pub fn steps_to_next(steps: u64) -> Option<u64> {
        Self::THRESHOLDS
            .iter()
            .find(|(min, _)| *min > steps)
            .map(|(min, _)| min - steps)
    }
}

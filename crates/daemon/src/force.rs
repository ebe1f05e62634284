use serde::{Deserialize, Serialize};

/// What the orchestrator should do with an interval once peers have answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForceDecision {
    /// At least one peer corroborated; commit and reset.
    Corroborated,
    /// Threshold reached without corroboration; commit anyway.
    Forced { after_intervals: u32 },
    /// No corroboration yet; wait for a later interval.
    Skip { remaining: u32 },
}

/// Counts consecutive intervals without a peer-corroborated commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForceCounter {
    threshold: u32,
    elapsed: u32,
}

impl ForceCounter {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            elapsed: 0,
        }
    }

    /// Resume from a persisted count. Values at or beyond the threshold are
    /// clamped so the next uncorroborated interval forces.
    pub fn resume(threshold: u32, elapsed: u32) -> Self {
        let mut counter = Self::new(threshold);
        counter.elapsed = elapsed.min(counter.threshold - 1);
        counter
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn elapsed(&self) -> u32 {
        self.elapsed
    }

    /// What to do with the interval that just ended. Leaves the count
    /// alone: apply the outcome with [`Self::committed`] or
    /// [`Self::missed`] once it is known.
    pub fn decide(&self, corroborated: bool) -> ForceDecision {
        if corroborated {
            return ForceDecision::Corroborated;
        }
        let elapsed = self.elapsed + 1;
        if elapsed >= self.threshold {
            ForceDecision::Forced {
                after_intervals: elapsed,
            }
        } else {
            ForceDecision::Skip {
                remaining: self.threshold - elapsed,
            }
        }
    }

    /// A commit landed; start counting afresh.
    pub fn committed(&mut self) {
        self.elapsed = 0;
    }

    /// The interval ended without a commit, skipped or failed. Saturates
    /// one short of the threshold so the next uncorroborated interval
    /// forces again.
    pub fn missed(&mut self) {
        self.elapsed = (self.elapsed + 1).min(self.threshold - 1);
    }

    /// Decide and apply at once, for callers whose commits cannot fail.
    pub fn record(&mut self, corroborated: bool) -> ForceDecision {
        let decision = self.decide(corroborated);
        match decision {
            ForceDecision::Skip { .. } => self.missed(),
            _ => self.committed(),
        }
        decision
    }
}

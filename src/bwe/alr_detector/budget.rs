use std::time::Duration;

use crate::rtp::{Bitrate, DataSize};

const WINDOW: Duration = Duration::from_millis(500);

/// Leaky bucket of bytes over a 500ms window.
///
/// Refilled at the target rate and drained by what is sent. The level is bounded to
/// plus/minus the bytes the target rate produces over the window, so a negative level is
/// debt from sending above the target.
#[derive(Debug, Clone)]
pub(crate) struct IntervalBudget {
    target_rate: Bitrate,
    max_bytes: i64,
    remaining: i64,
    can_build_up_underuse: bool,
}

impl IntervalBudget {
    pub fn new(target_rate: Bitrate, can_build_up_underuse: bool) -> Self {
        Self {
            target_rate,
            max_bytes: max_bytes(target_rate),
            remaining: 0,
            can_build_up_underuse,
        }
    }

    pub fn set_target_rate(&mut self, target_rate: Bitrate) {
        self.target_rate = target_rate;
        self.max_bytes = max_bytes(target_rate);
        self.remaining = self.remaining.clamp(-self.max_bytes, self.max_bytes);
    }

    pub fn increase_budget(&mut self, elapsed: Duration) {
        let bytes = (self.target_rate * elapsed).as_bytes_usize() as i64;

        if self.remaining < 0 || self.can_build_up_underuse {
            self.remaining = (self.remaining + bytes).min(self.max_bytes);
        } else {
            // Unused budget from the last interval does not carry over.
            self.remaining = bytes.min(self.max_bytes);
        }
    }

    pub fn use_budget(&mut self, size: DataSize) {
        let bytes = size.as_bytes_usize() as i64;
        self.remaining = (self.remaining - bytes).max(-self.max_bytes);
    }

    /// Level between -1.0 (full debt) and 1.0 (fully unused).
    pub fn budget_ratio(&self) -> f64 {
        if self.max_bytes == 0 {
            return 0.0;
        }
        self.remaining as f64 / self.max_bytes as f64
    }

    #[cfg(test)]
    pub fn remaining(&self) -> i64 {
        self.remaining
    }
}

fn max_bytes(target_rate: Bitrate) -> i64 {
    (target_rate * WINDOW).as_bytes_usize() as i64
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn accumulates_underuse() {
        let mut budget = IntervalBudget::new(Bitrate::kbps(300), true);
        assert_eq!(budget.budget_ratio(), 0.0);

        // 300kbit/s for 100ms is 3750 bytes.
        budget.increase_budget(Duration::from_millis(100));
        budget.increase_budget(Duration::from_millis(100));
        assert_eq!(budget.remaining(), 7500);

        budget.increase_budget(Duration::from_secs(1));
        assert_eq!(budget.budget_ratio(), 1.0);
    }

    #[test]
    fn without_build_up_only_last_interval_counts() {
        let mut budget = IntervalBudget::new(Bitrate::kbps(300), false);
        budget.increase_budget(Duration::from_millis(100));
        budget.increase_budget(Duration::from_millis(100));
        assert_eq!(budget.remaining(), 3750);
    }

    #[test]
    fn debt_is_bounded_and_recovers() {
        let mut budget = IntervalBudget::new(Bitrate::kbps(300), true);

        budget.use_budget(DataSize::bytes(5000));
        assert_eq!(budget.remaining(), -5000);

        budget.increase_budget(Duration::from_millis(200));
        assert_eq!(budget.remaining(), 2500);

        budget.use_budget(DataSize::bytes(100_000));
        assert_eq!(budget.budget_ratio(), -1.0);
    }

    #[test]
    fn lower_target_clamps_level() {
        let mut budget = IntervalBudget::new(Bitrate::kbps(300), true);
        budget.increase_budget(Duration::from_millis(500));
        assert_eq!(budget.remaining(), 18750);

        budget.set_target_rate(Bitrate::kbps(150));
        assert_eq!(budget.remaining(), 9375);
    }
}

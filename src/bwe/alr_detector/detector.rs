use std::time::Instant;

use super::budget::IntervalBudget;
use crate::rtp::{Bitrate, DataSize};

/// Share of the estimate the budget is refilled with.
const BANDWIDTH_USAGE_RATIO: f64 = 0.65;
/// Budget level above which we enter ALR.
const START_BUDGET_LEVEL_RATIO: f64 = 0.80;
/// Budget level below which we leave ALR.
const STOP_BUDGET_LEVEL_RATIO: f64 = 0.50;

/// Detects when sending is limited by the application rather than the network.
#[derive(Debug)]
pub(crate) struct AlrDetector {
    budget: IntervalBudget,
    alr_start: Option<Instant>,
    last_send_time: Option<Instant>,
}

impl AlrDetector {
    pub fn new(estimate: Bitrate) -> Self {
        Self {
            budget: IntervalBudget::new(estimate * BANDWIDTH_USAGE_RATIO, true),
            alr_start: None,
            last_send_time: None,
        }
    }

    /// Media sent. Padding and probes should not be counted.
    pub fn on_bytes_sent(&mut self, size: DataSize, now: Instant) {
        let Some(last) = self.last_send_time.replace(now) else {
            return;
        };

        self.budget.use_budget(size);
        self.budget.increase_budget(now.saturating_duration_since(last));

        let ratio = self.budget.budget_ratio();

        match self.alr_start {
            None if ratio > START_BUDGET_LEVEL_RATIO => {
                debug!("Enter ALR, budget level {:.3}", ratio);
                self.alr_start = Some(now);
            }
            Some(_) if ratio < STOP_BUDGET_LEVEL_RATIO => {
                debug!("Leave ALR, budget level {:.3}", ratio);
                self.alr_start = None;
            }
            _ => {}
        }
    }

    pub fn set_estimated_bitrate(&mut self, estimate: Bitrate) {
        self.budget.set_target_rate(estimate * BANDWIDTH_USAGE_RATIO);
    }

    /// When the current ALR period started, if we are in one.
    pub fn alr_start_time(&self) -> Option<Instant> {
        self.alr_start
    }

    pub fn in_alr(&self) -> bool {
        self.alr_start.is_some()
    }
}

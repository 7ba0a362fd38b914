use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::rtp::Bitrate;

/// Fewer expected packets than this are carried over to the next loss update.
const MIN_PACKETS_FOR_LOSS: u64 = 20;
/// Below this loss the estimate is raised.
const LOW_LOSS_THRESHOLD: f64 = 0.02;
/// Above this loss the estimate is lowered.
const HIGH_LOSS_THRESHOLD: f64 = 0.1;
const INCREASE_INTERVAL: Duration = Duration::from_millis(1000);
const DECREASE_INTERVAL: Duration = Duration::from_millis(300);
/// While starting, with no loss seen, follow the delay based estimate directly.
const START_PHASE: Duration = Duration::from_secs(2);

/// Loss based rate control.
///
/// The estimate grows by 8% per second while loss stays under 2%, holds between 2% and
/// 10%, and is cut in proportion to the loss above 10%. It never exceeds the delay
/// based estimate.
#[derive(Debug)]
pub(crate) struct LossController {
    estimate: Bitrate,
    min_bitrate: Bitrate,
    max_bitrate: Bitrate,
    delay_limit: Option<Bitrate>,
    first_update: Option<Instant>,

    lost_since_update: u64,
    expected_since_update: u64,
    /// Loss as a fraction of 256, like the RTCP fraction lost field.
    fraction_lost: u8,
    has_loss_report: bool,
    has_decreased_since_report: bool,
    last_decrease: Option<Instant>,
    rtt: Duration,

    /// Estimates over the last increase interval, ascending.
    min_history: VecDeque<(Instant, Bitrate)>,
}

impl LossController {
    pub fn new(start: Bitrate, min_bitrate: Bitrate, max_bitrate: Bitrate) -> Self {
        Self {
            estimate: start.clamp(min_bitrate, max_bitrate),
            min_bitrate,
            max_bitrate,
            delay_limit: None,
            first_update: None,
            lost_since_update: 0,
            expected_since_update: 0,
            fraction_lost: 0,
            has_loss_report: false,
            has_decreased_since_report: false,
            last_decrease: None,
            rtt: Duration::ZERO,
            min_history: VecDeque::new(),
        }
    }

    pub fn estimate(&self) -> Bitrate {
        self.estimate
    }

    /// The last computed loss, 0.0 to 1.0.
    pub fn loss_fraction(&self) -> f64 {
        self.fraction_lost as f64 / 256.0
    }

    pub fn set_rtt(&mut self, rtt: Duration) {
        self.rtt = rtt;
    }

    /// Take a probe result or other authoritative rate as the estimate.
    pub fn set_estimate(&mut self, bitrate: Bitrate, now: Instant) {
        self.set(bitrate);
        self.min_history.clear();
        self.push_history(now);
    }

    /// Cap from the delay based estimate.
    pub fn set_delay_limit(&mut self, limit: Bitrate, now: Instant) {
        self.delay_limit = Some(limit);
        self.update_estimate(now);
    }

    /// Counters for one loss update interval.
    pub fn update_packets_lost(&mut self, lost: u64, expected: u64, now: Instant) {
        self.lost_since_update += lost.min(expected);
        self.expected_since_update += expected;

        if self.expected_since_update < MIN_PACKETS_FOR_LOSS {
            return;
        }

        let fraction = (self.lost_since_update * 256) / self.expected_since_update;
        self.fraction_lost = fraction.min(255) as u8;
        crate::log_stat!("LOSS", self.loss_fraction());

        self.has_loss_report = true;
        self.has_decreased_since_report = false;
        self.lost_since_update = 0;
        self.expected_since_update = 0;

        self.update_estimate(now);
    }

    fn update_estimate(&mut self, now: Instant) {
        let first = *self.first_update.get_or_insert(now);

        let starting = now.saturating_duration_since(first) < START_PHASE;
        if starting && self.fraction_lost == 0 {
            if let Some(limit) = self.delay_limit.filter(|l| *l > self.estimate) {
                self.set(limit);
                self.min_history.clear();
                self.push_history(now);
                return;
            }
        }

        self.push_history(now);

        if !self.has_loss_report {
            self.set(self.estimate);
            return;
        }

        let loss = self.loss_fraction();

        if loss <= LOW_LOSS_THRESHOLD {
            // 8% over the lowest estimate of the last second, so the growth rate does
            // not depend on how often we update.
            let base = self.min_history.front().map(|(_, b)| *b).unwrap_or(self.estimate);
            let increased = base * 1.08 + Bitrate::kbps(1);
            self.set(increased);
        } else if loss > HIGH_LOSS_THRESHOLD {
            let may_decrease = !self.has_decreased_since_report
                && self
                    .last_decrease
                    .map(|t| now.saturating_duration_since(t) >= DECREASE_INTERVAL + self.rtt)
                    .unwrap_or(true);

            if may_decrease {
                self.last_decrease = Some(now);
                self.has_decreased_since_report = true;

                let factor = (512.0 - self.fraction_lost as f64) / 512.0;
                let decreased = self.estimate * factor;
                debug!(
                    "Loss {:.3}, decreasing {} -> {}",
                    loss, self.estimate, decreased
                );
                self.set(decreased);
            }
        } else {
            self.set(self.estimate);
        }
    }

    fn set(&mut self, bitrate: Bitrate) {
        let mut bitrate = bitrate;
        if let Some(limit) = self.delay_limit {
            bitrate = bitrate.min(limit);
        }
        self.estimate = bitrate.clamp(self.min_bitrate, self.max_bitrate);
        crate::log_stat!("LOSS_BITRATE_ESTIMATE", self.estimate.as_f64());
    }

    fn push_history(&mut self, now: Instant) {
        while self
            .min_history
            .front()
            .is_some_and(|(t, _)| now.saturating_duration_since(*t) > INCREASE_INTERVAL)
        {
            self.min_history.pop_front();
        }

        // Entries that can never be the minimum again.
        while self
            .min_history
            .back()
            .is_some_and(|(_, b)| *b >= self.estimate)
        {
            self.min_history.pop_back();
        }

        self.min_history.push_back((now, self.estimate));
    }
}

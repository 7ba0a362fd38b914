use std::collections::VecDeque;
use std::time::{Duration, Instant};

use super::super::{AckedPacket, BandwidthUsage};
use super::arrival_group::ArrivalGroupAccumulator;
use super::rate_control::RateControl;
use super::trendline::TrendlineEstimator;
use crate::rtp::Bitrate;
use crate::util::already_happened;

const TRENDLINE_WINDOW: usize = 20;
const RTT_HISTORY: usize = 32;
const UPDATE_INTERVAL: Duration = Duration::from_millis(25);
/// Longest time we keep acting on a hypothesis without new feedback.
const MAX_FEEDBACK_GAP: Duration = Duration::from_millis(500);

/// Outcome of feeding a feedback report to the [`DelayController`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct DelayResult {
    pub estimate: Bitrate,
    /// The detector just went from underuse back to normal.
    pub recovered_from_overuse: bool,
}

/// Delay based bandwidth estimation.
///
/// Looks at how the one way delay between groups of packets varies. Growing delay
/// means a queue is building somewhere on the path.
#[derive(Debug)]
pub(crate) struct DelayController {
    arrival_groups: ArrivalGroupAccumulator,
    trendline: TrendlineEstimator,
    rate_control: RateControl,
    /// Send to feedback time of the slowest packet per report.
    max_rtt_history: VecDeque<Duration>,
    next_timeout: Instant,
    last_report: Instant,
}

impl DelayController {
    pub fn new(start: Bitrate, min: Bitrate, max: Bitrate) -> Self {
        Self {
            arrival_groups: ArrivalGroupAccumulator::default(),
            trendline: TrendlineEstimator::new(TRENDLINE_WINDOW),
            rate_control: RateControl::new(start, min, max),
            max_rtt_history: VecDeque::with_capacity(RTT_HISTORY),
            next_timeout: already_happened(),
            last_report: already_happened(),
        }
    }

    /// Feed the received packets of one report, ordered by receive time.
    pub fn update(
        &mut self,
        acked: &[AckedPacket],
        acked_bitrate: Option<Bitrate>,
        probe_bitrate: Option<Bitrate>,
        in_alr: bool,
        now: Instant,
    ) -> DelayResult {
        let previous = self.trendline.hypothesis();
        let mut max_rtt = None;

        for packet in acked {
            max_rtt = max_rtt.max(Some(packet.rtt()));

            if let Some(delta) = self.arrival_groups.accumulate_packet(packet) {
                crate::log_stat!("DELAY_VARIATION", delta.delay());
                self.trendline.add_delay_observation(delta);
            }
        }

        if let Some(rtt) = max_rtt {
            if self.max_rtt_history.len() >= RTT_HISTORY {
                self.max_rtt_history.pop_front();
            }
            self.max_rtt_history.push_back(rtt);
        }

        let hypothesis = self.trendline.hypothesis();
        self.update_estimate(hypothesis, acked_bitrate, probe_bitrate, in_alr, now);
        self.last_report = now;

        DelayResult {
            estimate: self.rate_control.estimate(),
            recovered_from_overuse: previous == BandwidthUsage::Underuse
                && hypothesis == BandwidthUsage::Normal,
        }
    }

    pub fn poll_timeout(&self) -> Instant {
        self.next_timeout
    }

    /// Keep applying the current hypothesis between reports.
    pub fn handle_timeout(&mut self, acked_bitrate: Option<Bitrate>, in_alr: bool, now: Instant) {
        if now < self.next_timeout {
            return;
        }

        if !self.hypothesis_valid(now) {
            // Without fresh feedback, wait for the next report.
            self.next_timeout = now + UPDATE_INTERVAL;
            return;
        }

        let hypothesis = self.trendline.hypothesis();
        self.update_estimate(hypothesis, acked_bitrate, None, in_alr, now);
    }

    pub fn estimate(&self) -> Bitrate {
        self.rate_control.estimate()
    }

    pub fn is_overusing(&self) -> bool {
        self.trendline.hypothesis() == BandwidthUsage::Overuse
    }

    /// Mean of the recent per report max RTTs.
    pub fn mean_max_rtt(&self) -> Option<Duration> {
        if self.max_rtt_history.is_empty() {
            return None;
        }
        let sum: Duration = self.max_rtt_history.iter().sum();
        Some(sum / self.max_rtt_history.len() as u32)
    }

    fn update_estimate(
        &mut self,
        hypothesis: BandwidthUsage,
        acked_bitrate: Option<Bitrate>,
        probe_bitrate: Option<Bitrate>,
        in_alr: bool,
        now: Instant,
    ) {
        // A probe result replaces the delay based update, since the probe itself
        // builds queues that would otherwise read as overuse.
        if let Some(probe) = probe_bitrate {
            self.rate_control.set_estimate(probe, now);
        } else if let Some(acked) = acked_bitrate {
            let rtt = self.mean_max_rtt();
            self.rate_control
                .update(hypothesis.into(), acked, rtt, in_alr, now);
        } else if hypothesis == BandwidthUsage::Overuse {
            // No throughput measured yet, back off from the current estimate.
            let current = self.rate_control.estimate();
            self.rate_control
                .update(hypothesis.into(), current, self.mean_max_rtt(), in_alr, now);
        }

        crate::log_stat!("DELAY_BITRATE_ESTIMATE", self.rate_control.estimate().as_f64());
        self.next_timeout = now + UPDATE_INTERVAL;
    }

    fn hypothesis_valid(&self, now: Instant) -> bool {
        let gap = self
            .mean_max_rtt()
            .map(|rtt| rtt * 2)
            .unwrap_or(MAX_FEEDBACK_GAP)
            .min(UPDATE_INTERVAL * 2);

        now.saturating_duration_since(self.last_report) <= gap
    }
}

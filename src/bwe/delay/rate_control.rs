use std::fmt;
use std::time::{Duration, Instant};

use super::super::BandwidthUsage;
use crate::rtp::Bitrate;
use crate::util::MovingAverage;

/// Smoothing of the throughput observed while decreasing.
const OBSERVED_BITRATE_SMOOTHING: f64 = 0.95;
/// Share of the observed throughput to back off to on overuse.
const BETA: f64 = 0.85;
const MULTIPLICATIVE_INCREASE_COEF: f64 = 1.08;
/// Largest allowed estimate relative to the observed throughput.
const MAX_ESTIMATE_RATIO: f64 = 1.5;
const DEFAULT_BACKOFF_TIME: Duration = Duration::from_millis(100);
/// Standard deviations outside which the throughput average is restarted.
const RESET_THRESHOLD_STD: f64 = 3.0;
const MIN_INCREASE: f64 = 1000.0;

/// Additive increase, multiplicative decrease rate controller.
///
/// Driven by the delay based usage signal and the acknowledged throughput. Increases
/// multiplicatively far from the last congestion point and additively, about one packet
/// per response time, close to it.
#[derive(Debug)]
pub(crate) struct RateControl {
    state: State,
    estimate: Bitrate,
    min_bitrate: Bitrate,
    max_bitrate: Bitrate,
    last_observed: Option<Bitrate>,
    /// Throughput around the last congestion point.
    averaged_observed: MovingAverage,
    last_change: Option<Instant>,
    rtt: Option<Duration>,
}

impl RateControl {
    pub fn new(start: Bitrate, min_bitrate: Bitrate, max_bitrate: Bitrate) -> Self {
        crate::log_stat!("RATE_CONTROL_STATE", State::Increase as i8);

        Self {
            state: State::Increase,
            estimate: start.clamp(min_bitrate, max_bitrate),
            min_bitrate,
            max_bitrate,
            last_observed: None,
            averaged_observed: MovingAverage::new(OBSERVED_BITRATE_SMOOTHING),
            last_change: None,
            rtt: None,
        }
    }

    pub fn estimate(&self) -> Bitrate {
        self.estimate
    }

    /// Apply a usage signal.
    ///
    /// In the application limited region the estimate is not raised above what it was
    /// when the sender started being limited, since the link is not actually tested.
    pub fn update(
        &mut self,
        signal: Signal,
        observed: Bitrate,
        rtt: Option<Duration>,
        in_alr: bool,
        now: Instant,
    ) {
        self.last_observed = Some(observed);
        if let Some(rtt) = rtt {
            self.rtt = Some(rtt);
        }

        self.state = self.state.transition(signal);
        crate::log_stat!("RATE_CONTROL_OBSERVED_BITRATE", observed.as_f64());

        match self.state {
            State::Increase => {
                if in_alr && observed < self.estimate {
                    trace!("Application limited, holding estimate {}", self.estimate);
                    self.last_change = Some(now);
                } else {
                    self.increase(observed, now);
                }
            }
            State::Decrease => {
                self.update_observed(observed);
                if self.time_to_reduce_further(observed, now) {
                    self.decrease(observed, now);
                }
            }
            State::Hold => {}
        }
    }

    /// Take a probe result as the new estimate without changing state.
    pub fn set_estimate(&mut self, bitrate: Bitrate, now: Instant) {
        self.set(bitrate, now);
    }

    fn update_observed(&mut self, observed: Bitrate) {
        let below = self
            .averaged_observed
            .lower_range(RESET_THRESHOLD_STD)
            .is_some_and(|lower| observed.as_f64() < lower);
        if below {
            self.averaged_observed.reset();
        }
        self.averaged_observed.update(observed.as_f64());
    }

    /// Reduce at most once per RTT unless throughput collapsed.
    fn time_to_reduce_further(&self, observed: Bitrate, now: Instant) -> bool {
        let Some(last_change) = self.last_change else {
            return true;
        };

        let interval = self
            .rtt
            .unwrap_or(DEFAULT_BACKOFF_TIME)
            .clamp(Duration::from_millis(10), Duration::from_millis(200));

        now.saturating_duration_since(last_change) >= interval || observed < self.estimate * 0.5
    }

    fn increase(&mut self, observed: Bitrate, now: Instant) {
        let limit = observed * MAX_ESTIMATE_RATIO + Bitrate::kbps(10);

        if self.estimate >= limit {
            self.last_change = Some(now);
            return;
        }

        let last_change = *self.last_change.get_or_insert(now);

        let above = self
            .averaged_observed
            .upper_range(RESET_THRESHOLD_STD)
            .is_some_and(|upper| observed.as_f64() > upper);
        if above {
            self.averaged_observed.reset();
        }

        let elapsed = now.saturating_duration_since(last_change);
        let current = self.estimate.as_f64();

        let new_estimate = if self.is_near_convergence() {
            crate::log_stat!("RATE_CONTROL_APPLIED_CHANGE", "increase_additive");
            let response_time = self.rtt.unwrap_or(Duration::ZERO) + DEFAULT_BACKOFF_TIME;
            let alpha = 0.5 * (elapsed.as_secs_f64() / response_time.as_secs_f64()).min(1.0);
            current + (alpha * self.expected_packet_size_bits()).max(MIN_INCREASE)
        } else {
            crate::log_stat!("RATE_CONTROL_APPLIED_CHANGE", "increase_multiplicative");
            let eta = MULTIPLICATIVE_INCREASE_COEF.powf(elapsed.as_secs_f64().min(1.0));
            current + ((eta - 1.0) * current).max(MIN_INCREASE)
        };

        let capped = new_estimate.min(limit.as_f64());
        self.set(capped.into(), now);
    }

    fn decrease(&mut self, observed: Bitrate, now: Instant) {
        crate::log_stat!("RATE_CONTROL_APPLIED_CHANGE", "decrease");

        // Never increase on overuse.
        let new_estimate = (observed * BETA).min(self.estimate);

        self.state = State::Hold;
        crate::log_stat!("RATE_CONTROL_STATE", self.state as i8);
        debug!(
            "Overuse, decreasing {} -> {} (observed {})",
            self.estimate, new_estimate, observed
        );
        self.set(new_estimate, now);
    }

    fn is_near_convergence(&self) -> bool {
        let Some(observed) = self.last_observed else {
            return false;
        };
        self.averaged_observed
            .within_std(observed.as_f64(), RESET_THRESHOLD_STD)
    }

    fn set(&mut self, bitrate: Bitrate, now: Instant) {
        self.estimate = bitrate.clamp(self.min_bitrate, self.max_bitrate);
        self.last_change = Some(now);
    }

    /// Bits per packet assuming 30fps video in packets of up to 1200 bytes.
    fn expected_packet_size_bits(&self) -> f64 {
        let bits_per_frame = self.estimate.as_f64() / 30.0;
        let packets_per_frame = (bits_per_frame / (1200.0 * 8.0)).ceil().max(1.0);

        bits_per_frame / packets_per_frame
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Signal {
    Overuse,
    Underuse,
    Normal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Increase = 1,
    Hold = 0,
    Decrease = -1,
}

impl State {
    fn transition(self, signal: Signal) -> Self {
        let next = match (self, signal) {
            (_, Signal::Overuse) => State::Decrease,
            (_, Signal::Underuse) => State::Hold,
            (State::Decrease, Signal::Normal) => State::Hold,
            (State::Hold | State::Increase, Signal::Normal) => State::Increase,
        };

        if next != self {
            debug!("Rate control {} -> {} on {}", self, next, signal);
            crate::log_stat!("RATE_CONTROL_STATE", next as i8);
        }

        next
    }
}

impl From<BandwidthUsage> for Signal {
    fn from(value: BandwidthUsage) -> Self {
        match value {
            BandwidthUsage::Overuse => Signal::Overuse,
            BandwidthUsage::Normal => Signal::Normal,
            BandwidthUsage::Underuse => Signal::Underuse,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Hold => write!(f, "hold"),
            State::Increase => write!(f, "increase"),
            State::Decrease => write!(f, "decrease"),
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signal::Overuse => write!(f, "overuse"),
            Signal::Underuse => write!(f, "underuse"),
            Signal::Normal => write!(f, "normal"),
        }
    }
}

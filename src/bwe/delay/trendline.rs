use std::collections::VecDeque;
use std::ops::RangeInclusive;
use std::time::Instant;

use super::super::BandwidthUsage;
use super::arrival_group::InterGroupDelayDelta;

const SMOOTHING_COEF: f64 = 0.9;
const OVERUSE_THRESHOLD_DEFAULT_MS: f64 = 12.5;
const OVERUSE_TIME_THRESHOLD_MS: f64 = 10.0;
const MAX_ADAPT_OFFSET_MS: f64 = 15.0;
const THRESHOLD_GAIN: f64 = 4.0;
const THRESHOLD_RANGE: RangeInclusive<f64> = 6.0..=600.0;

const K_UP: f64 = 0.0087;
const K_DOWN: f64 = 0.039;

const DELAY_COUNT_RANGE: RangeInclusive<usize> = 60..=1000;

/// Detects over- and underuse from the slope of the accumulated queuing delay.
///
/// A least squares line is fitted through the smoothed accumulated delay of the last
/// `window_size` group deltas. A positive slope means queues are building. The slope is
/// compared to an adaptive threshold that follows the modified trend, slowly when the
/// trend is within it and faster when outside, so that a competing TCP flow does not
/// starve us.
#[derive(Debug)]
pub(crate) struct TrendlineEstimator {
    window_size: usize,
    zero_time: Option<Instant>,
    history: VecDeque<Timing>,
    num_delay_variations: usize,
    accumulated_delay: f64,
    smoothed_delay: f64,
    threshold: f64,
    previous_trend: f64,
    overuse: Option<Overuse>,
    last_threshold_update: Option<Instant>,
    hypothesis: BandwidthUsage,
}

#[derive(Debug)]
struct Timing {
    /// Receive time in ms since the first observation.
    recv_ms: f64,
    smoothed_delay: f64,
}

#[derive(Debug)]
struct Overuse {
    count: usize,
    time_overusing: f64,
}

impl TrendlineEstimator {
    pub fn new(window_size: usize) -> Self {
        Self {
            window_size: window_size.max(2),
            zero_time: None,
            history: VecDeque::with_capacity(window_size + 1),
            num_delay_variations: 0,
            accumulated_delay: 0.0,
            smoothed_delay: 0.0,
            threshold: OVERUSE_THRESHOLD_DEFAULT_MS,
            previous_trend: 0.0,
            overuse: None,
            last_threshold_update: None,
            hypothesis: BandwidthUsage::Normal,
        }
    }

    pub fn hypothesis(&self) -> BandwidthUsage {
        self.hypothesis
    }

    /// Add the delay delta between two groups. Time is the receive time of the later
    /// group, which keeps threshold adaptation independent of feedback batching.
    pub fn add_delay_observation(&mut self, delta: InterGroupDelayDelta) {
        let now = delta.last_remote_recv_time;
        let zero = *self.zero_time.get_or_insert(now);

        let recv_ms = now.saturating_duration_since(zero).as_secs_f64() * 1000.0;
        if self.history.back().is_some_and(|t| t.recv_ms > recv_ms) {
            trace!("Out of order delay observation, ignoring");
            return;
        }

        self.num_delay_variations = (self.num_delay_variations + 1).min(*DELAY_COUNT_RANGE.end());
        self.accumulated_delay += delta.delay();
        self.smoothed_delay =
            self.smoothed_delay * SMOOTHING_COEF + (1.0 - SMOOTHING_COEF) * self.accumulated_delay;

        self.history.push_back(Timing {
            recv_ms,
            smoothed_delay: self.smoothed_delay,
        });
        while self.history.len() > self.window_size {
            self.history.pop_front();
        }

        if self.history.len() == self.window_size {
            let trend = self.linear_fit().unwrap_or(self.previous_trend);
            crate::log_stat!("TRENDLINE_ESTIMATE", trend);
            self.detect(trend, delta.send_delta, now);
        }
    }

    fn linear_fit(&self) -> Option<f64> {
        let n = self.history.len() as f64;
        if n < 2.0 {
            return None;
        }

        let (sum_x, sum_y) = self
            .history
            .iter()
            .fold((0.0, 0.0), |(x, y), t| (x + t.recv_ms, y + t.smoothed_delay));
        let avg_x = sum_x / n;
        let avg_y = sum_y / n;

        let (num, den) = self.history.iter().fold((0.0, 0.0), |(num, den), t| {
            let dx = t.recv_ms - avg_x;
            (num + dx * (t.smoothed_delay - avg_y), den + dx * dx)
        });

        if den == 0.0 {
            return None;
        }

        Some(num / den)
    }

    fn detect(&mut self, trend: f64, send_delta: f64, now: Instant) {
        if self.num_delay_variations < 2 {
            self.update_hypothesis(BandwidthUsage::Normal);
            return;
        }

        let modified_trend = self.num_delay_variations.min(*DELAY_COUNT_RANGE.start()) as f64
            * trend
            * THRESHOLD_GAIN;
        crate::log_stat!("TRENDLINE_MODIFIED_TREND", modified_trend, self.threshold);

        if modified_trend > self.threshold {
            let overuse = self.overuse.get_or_insert(Overuse {
                count: 0,
                // Assume we've been overusing half the time since the last sample.
                time_overusing: -send_delta / 2.0,
            });
            overuse.time_overusing += send_delta;
            overuse.count += 1;

            trace!(
                time_overusing = overuse.time_overusing,
                trend,
                previous_trend = self.previous_trend,
                "Maybe overusing"
            );

            if overuse.time_overusing > OVERUSE_TIME_THRESHOLD_MS
                && overuse.count > 1
                && trend >= self.previous_trend
            {
                self.overuse = None;
                self.update_hypothesis(BandwidthUsage::Overuse);
            }
        } else if modified_trend < -self.threshold {
            self.overuse = None;
            self.update_hypothesis(BandwidthUsage::Underuse);
        } else {
            self.overuse = None;
            self.update_hypothesis(BandwidthUsage::Normal);
        }

        self.previous_trend = trend;
        self.update_threshold(modified_trend, now);
    }

    fn update_threshold(&mut self, modified_trend: f64, now: Instant) {
        let last = *self.last_threshold_update.get_or_insert(now);
        self.last_threshold_update = Some(now);

        if modified_trend.abs() > self.threshold + MAX_ADAPT_OFFSET_MS {
            // Don't adapt to latency spikes such as a sudden capacity drop.
            return;
        }

        let k = if modified_trend.abs() < self.threshold {
            K_DOWN
        } else {
            K_UP
        };
        let elapsed_ms = (now.saturating_duration_since(last).as_secs_f64() * 1000.0).min(100.0);

        self.threshold += k * (modified_trend.abs() - self.threshold) * elapsed_ms;
        self.threshold = self
            .threshold
            .clamp(*THRESHOLD_RANGE.start(), *THRESHOLD_RANGE.end());
    }

    fn update_hypothesis(&mut self, hypothesis: BandwidthUsage) {
        if self.hypothesis == hypothesis {
            return;
        }

        debug!("Delay hypothesis {} -> {}", self.hypothesis, hypothesis);
        self.hypothesis = hypothesis;
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;

    fn feed(estimator: &mut TrendlineEstimator, start: Instant, deltas: &[(f64, f64)]) {
        for (i, (send, arrival)) in deltas.iter().enumerate() {
            estimator.add_delay_observation(InterGroupDelayDelta {
                send_delta: *send,
                arrival_delta: *arrival,
                last_remote_recv_time: start + Duration::from_millis(i as u64 * 20),
            });
        }
    }

    #[test]
    fn steady_delay_is_normal() {
        let mut e = TrendlineEstimator::new(20);
        feed(&mut e, Instant::now(), &[(20.0, 20.0); 100]);
        assert_eq!(e.hypothesis(), BandwidthUsage::Normal);
    }

    #[test]
    fn growing_delay_is_overuse() {
        let mut e = TrendlineEstimator::new(20);
        // Every group arrives 5ms later than it was sent relative to the previous.
        feed(&mut e, Instant::now(), &[(20.0, 25.0); 60]);
        assert_eq!(e.hypothesis(), BandwidthUsage::Overuse);
    }

    #[test]
    fn draining_queue_is_underuse() {
        let mut e = TrendlineEstimator::new(20);
        let now = Instant::now();
        feed(&mut e, now, &[(20.0, 25.0); 40]);
        feed(
            &mut e,
            now + Duration::from_millis(800),
            &[(20.0, 10.0); 40],
        );
        assert_eq!(e.hypothesis(), BandwidthUsage::Underuse);
    }

    #[test]
    fn no_hypothesis_before_window_is_full() {
        let mut e = TrendlineEstimator::new(20);
        feed(&mut e, Instant::now(), &[(20.0, 40.0); 19]);
        assert_eq!(e.hypothesis(), BandwidthUsage::Normal);
    }
}

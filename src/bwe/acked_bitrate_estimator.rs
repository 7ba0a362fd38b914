use std::time::{Duration, Instant};

use crate::rtp::{Bitrate, DataSize};

const SMALL_SAMPLE_THRESHOLD: DataSize = DataSize::bytes(2000);
const SMALL_SAMPLE_UNCERTAINTY: f64 = 25.0;
const UNCERTAINTY: f64 = 10.0;
const ESTIMATE_FLOOR: Bitrate = Bitrate::kbps(40);
const INITIAL_VARIANCE: f64 = 50.0;
/// Variance added per update to model that the rate drifts over time.
const VARIANCE_GROWTH: f64 = 5.0;

/// Estimates the throughput the remote acknowledges receiving.
///
/// Received bytes are summed over fixed windows of receive time, and each window sample
/// is folded into a bayesian estimate where samples far from the current estimate
/// weigh less.
#[derive(Debug)]
pub(crate) struct AckedBitrateEstimator {
    /// Window used until there is a first estimate.
    initial_window: Duration,
    window: Duration,
    estimate: Option<Bitrate>,
    estimate_var: f64,
    sum: DataSize,
    current_window: Duration,
    last_update: Option<Instant>,
}

impl AckedBitrateEstimator {
    pub fn new(initial_window: Duration, window: Duration) -> Self {
        Self {
            initial_window,
            window,
            estimate: None,
            estimate_var: INITIAL_VARIANCE,
            sum: DataSize::ZERO,
            current_window: Duration::ZERO,
            last_update: None,
        }
    }

    /// Add a received packet. Packets must be fed in receive time order.
    pub fn update(&mut self, receive_time: Instant, size: DataSize) {
        let window = if self.estimate.is_none() {
            self.initial_window
        } else {
            self.window
        };

        let Some((sample, is_small)) = self.update_window(receive_time, size, window) else {
            return;
        };

        let Some(estimate) = self.estimate else {
            self.estimate = Some(sample);
            return;
        };

        let scale = if is_small && sample < estimate {
            SMALL_SAMPLE_UNCERTAINTY
        } else {
            UNCERTAINTY
        };

        let sample_bps = sample.as_f64();
        let estimate_bps = estimate.as_f64();

        let sample_uncertainty = scale * (estimate_bps - sample_bps).abs() / estimate_bps;
        let sample_var = sample_uncertainty.powi(2);

        let pred_var = self.estimate_var + VARIANCE_GROWTH;
        let new_estimate =
            (sample_var * estimate_bps + pred_var * sample_bps) / (sample_var + pred_var);

        let new_estimate = new_estimate.max(ESTIMATE_FLOOR.as_f64()).ceil();
        self.estimate = Some(new_estimate.into());
        self.estimate_var = (sample_var * pred_var) / (sample_var + pred_var);
    }

    pub fn current_estimate(&self) -> Option<Bitrate> {
        self.estimate
    }

    fn update_window(
        &mut self,
        receive_time: Instant,
        size: DataSize,
        window: Duration,
    ) -> Option<(Bitrate, bool)> {
        if Some(receive_time) < self.last_update {
            // Time moved backwards.
            self.sum = DataSize::ZERO;
            self.current_window = Duration::ZERO;
            self.last_update = Some(receive_time);
            return None;
        }

        if let Some(last) = self.last_update {
            let elapsed = receive_time - last;
            self.current_window += elapsed;

            if elapsed >= window {
                // Silent for a whole window, nothing to carry over.
                self.sum = DataSize::ZERO;
                let rem = self.current_window.as_micros() % window.as_micros().max(1);
                self.current_window = Duration::from_micros(rem as u64);
            }
        }
        self.last_update = Some(receive_time);

        let mut sample = None;

        if self.current_window >= window {
            let is_small = self.sum < SMALL_SAMPLE_THRESHOLD;
            sample = Some((self.sum / window, is_small));
            self.sum = DataSize::ZERO;
            self.current_window -= window;
        }

        self.sum += size;

        sample
    }
}

/// Exponentially weighted moving average that also tracks the variance.
///
/// Used for smoothing observed throughput and round trip times.
#[derive(Debug, Clone)]
pub(crate) struct MovingAverage {
    alpha: f64,
    mean: Option<f64>,
    variance: f64,
}

impl MovingAverage {
    /// `alpha` is the weight of a new sample, in `0.0..=1.0`.
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha: alpha.clamp(0.0, 1.0),
            mean: None,
            variance: 0.0,
        }
    }

    pub fn update(&mut self, sample: f64) {
        let Some(mean) = self.mean else {
            self.mean = Some(sample);
            return;
        };

        let delta = sample - mean;
        self.mean = Some(mean + self.alpha * delta);
        self.variance = (1.0 - self.alpha) * (self.variance + self.alpha * delta * delta);
    }

    pub fn get(&self) -> Option<f64> {
        self.mean
    }

    pub fn is_valid(&self) -> bool {
        self.mean.is_some()
    }

    fn std_dev(&self) -> f64 {
        self.variance.sqrt()
    }

    /// Whether `value` lies within `n` standard deviations of the mean.
    pub fn within_std(&self, value: f64, n: f64) -> bool {
        let Some(mean) = self.mean else {
            return false;
        };
        let spread = self.std_dev() * n;

        (mean - spread..=mean + spread).contains(&value)
    }

    /// Mean plus `n` standard deviations. `None` until there is some spread.
    pub fn upper_range(&self, n: f64) -> Option<f64> {
        let std = self.std_dev();
        if std == 0.0 {
            return None;
        }
        self.mean.map(|m| m + n * std)
    }

    /// Mean minus `n` standard deviations. `None` until there is some spread.
    pub fn lower_range(&self, n: f64) -> Option<f64> {
        let std = self.std_dev();
        if std == 0.0 {
            return None;
        }
        self.mean.map(|m| m - n * std)
    }

    pub fn reset(&mut self) {
        self.mean = None;
        self.variance = 0.0;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn first_sample_is_the_mean() {
        let mut avg = MovingAverage::new(0.5);
        assert!(!avg.is_valid());

        avg.update(10.0);
        assert_eq!(avg.get(), Some(10.0));
        assert_eq!(avg.upper_range(3.0), None);
    }

    #[test]
    fn converges_and_tracks_spread() {
        let mut avg = MovingAverage::new(0.5);
        avg.update(10.0);
        avg.update(20.0);

        assert_eq!(avg.get(), Some(15.0));
        // (1 - 0.5) * (0 + 0.5 * 100)
        assert_eq!(avg.variance, 25.0);
        assert!(avg.within_std(19.0, 1.0));
        assert!(!avg.within_std(21.0, 1.0));
        assert_eq!(avg.lower_range(1.0), Some(10.0));

        avg.reset();
        assert!(!avg.is_valid());
    }
}

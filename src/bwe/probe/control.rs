use std::time::{Duration, Instant};

use super::ProbeClusterConfig;
use crate::feedback::ClusterId;
use crate::rtp::Bitrate;
use crate::util::already_happened;

/// No probe goes above this multiple of the current estimate.
const PROBE_LIMIT_SCALE: f64 = 2.0;
/// Never probe above this multiple of what the application wants to send.
const DESIRED_PROBE_CAP_SCALE: f64 = 1.1;
const FIRST_PROBE_SCALE: f64 = 3.0;
const FIRST_PROBE_DURATION: Duration = Duration::from_millis(100);
const PROBE_SCALE: f64 = 1.5;
const MIN_PROBE_INTERVAL: Duration = Duration::from_secs(5);
/// The estimate must grow this much since the last probe to probe again.
const PROBE_INCREASE_THRESHOLD: f64 = 1.2;

/// Decides when to send probe clusters and at what bitrate.
///
/// Congestion is not looked at directly. The delay and loss controllers lower the
/// estimate when the network is stressed, and a probe is only made when the estimate
/// has grown since the last one.
#[derive(Debug)]
pub(crate) struct ProbeControl {
    next_cluster: ClusterId,
    next_probe_time: Instant,
    last_probed_bitrate: Option<Bitrate>,
    /// A probe requested outside the regular schedule, like after overuse recovery.
    requested: Option<Bitrate>,
}

impl ProbeControl {
    pub fn new() -> Self {
        Self {
            next_cluster: ClusterId::default(),
            next_probe_time: already_happened(),
            last_probed_bitrate: None,
            requested: None,
        }
    }

    pub fn poll_timeout(&self) -> Instant {
        if self.requested.is_some() {
            return already_happened();
        }
        self.next_probe_time
    }

    /// Ask for a probe at `bitrate` as soon as possible.
    pub fn request_probe(&mut self, bitrate: Bitrate) {
        debug!("Probe requested at {}", bitrate);
        self.requested = Some(bitrate);
    }

    /// A cluster to send now, if any.
    ///
    /// `desired` is what the application would like to send, `Bitrate::ZERO` when unknown.
    pub fn maybe_create_probe(
        &mut self,
        estimate: Bitrate,
        desired: Bitrate,
        now: Instant,
    ) -> Option<ProbeClusterConfig> {
        if let Some(requested) = self.requested.take() {
            let target = requested.min(estimate * PROBE_LIMIT_SCALE);
            return Some(self.create(target, estimate, None, now));
        }

        let Some(last) = self.last_probed_bitrate else {
            let target = (estimate * FIRST_PROBE_SCALE).min(estimate * PROBE_LIMIT_SCALE);
            let target = cap_desired(target, desired);
            return Some(self.create(target, estimate, Some(FIRST_PROBE_DURATION), now));
        };

        if now < self.next_probe_time {
            return None;
        }

        let has_desired = desired > Bitrate::ZERO;

        if has_desired && estimate >= desired * DESIRED_PROBE_CAP_SCALE {
            return None;
        }

        let towards_desired = has_desired && desired >= estimate * PROBE_SCALE;
        let grown = estimate >= last * PROBE_INCREASE_THRESHOLD;

        if !grown && !towards_desired {
            return None;
        }

        let target = if towards_desired {
            estimate * PROBE_LIMIT_SCALE
        } else {
            estimate * PROBE_SCALE
        };

        Some(self.create(cap_desired(target, desired), estimate, None, now))
    }

    fn create(
        &mut self,
        target: Bitrate,
        estimate: Bitrate,
        duration: Option<Duration>,
        now: Instant,
    ) -> ProbeClusterConfig {
        let cluster = self.next_cluster.inc();

        self.next_probe_time = now + MIN_PROBE_INTERVAL;
        self.last_probed_bitrate = Some(estimate);

        debug!("Probe cluster {} at {} (estimate {})", cluster, target, estimate);

        let config = ProbeClusterConfig::new(cluster, target);
        match duration {
            Some(d) => config.with_duration(d),
            None => config,
        }
    }
}

fn cap_desired(target: Bitrate, desired: Bitrate) -> Bitrate {
    if desired > Bitrate::ZERO {
        target.min(desired * DESIRED_PROBE_CAP_SCALE)
    } else {
        target
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn first_probe_is_immediate_and_capped() {
        let now = Instant::now();
        let mut control = ProbeControl::new();
        assert_eq!(control.poll_timeout(), already_happened());

        let config = control
            .maybe_create_probe(Bitrate::kbps(500), Bitrate::ZERO, now)
            .unwrap();

        // 3x capped at 2x.
        assert_eq!(config.target_bitrate(), Bitrate::kbps(1000));
        assert_eq!(config.target_duration(), FIRST_PROBE_DURATION);
        assert_eq!(config.cluster(), 0.into());
        assert_eq!(control.poll_timeout(), now + MIN_PROBE_INTERVAL);
    }

    #[test]
    fn no_probe_too_soon_or_without_growth() {
        let now = Instant::now();
        let mut control = ProbeControl::new();
        control.maybe_create_probe(Bitrate::kbps(500), Bitrate::ZERO, now);

        let soon = now + Duration::from_secs(1);
        assert!(control
            .maybe_create_probe(Bitrate::kbps(900), Bitrate::ZERO, soon)
            .is_none());

        let later = now + Duration::from_secs(6);
        assert!(control
            .maybe_create_probe(Bitrate::kbps(550), Bitrate::ZERO, later)
            .is_none());

        let config = control
            .maybe_create_probe(Bitrate::kbps(650), Bitrate::ZERO, later)
            .unwrap();
        assert_eq!(config.target_bitrate(), Bitrate::kbps(975));
        assert_eq!(config.cluster(), 1.into());
    }

    #[test]
    fn desired_caps_probe() {
        let now = Instant::now();
        let mut control = ProbeControl::new();

        let config = control
            .maybe_create_probe(Bitrate::kbps(500), Bitrate::kbps(600), now)
            .unwrap();
        assert!((config.target_bitrate().as_f64() - 660_000.0).abs() < 1.0);

        // Estimate already above desired cap.
        let later = now + Duration::from_secs(6);
        assert!(control
            .maybe_create_probe(Bitrate::kbps(700), Bitrate::kbps(600), later)
            .is_none());
    }

    #[test]
    fn requested_probe_ignores_schedule() {
        let now = Instant::now();
        let mut control = ProbeControl::new();
        control.maybe_create_probe(Bitrate::kbps(500), Bitrate::ZERO, now);

        control.request_probe(Bitrate::kbps(800));
        assert_eq!(control.poll_timeout(), already_happened());

        let soon = now + Duration::from_millis(100);
        let config = control
            .maybe_create_probe(Bitrate::kbps(500), Bitrate::ZERO, soon)
            .unwrap();
        assert_eq!(config.target_bitrate(), Bitrate::kbps(800));
        assert!(control
            .maybe_create_probe(Bitrate::kbps(500), Bitrate::ZERO, soon)
            .is_none());
    }
}

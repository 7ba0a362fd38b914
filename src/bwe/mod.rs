//! Send side bandwidth estimation.
//!
//! Combines a delay based controller (trendline over inter group delay variation
//! with AIMD rate control), a loss based controller, the acknowledged throughput and
//! probe results into a target bitrate.
//!
//! The estimator is fed [`TransportPacketsFeedback`] and driven by [`process()`][BandwidthEstimator::process]
//! for its timers. It never reads the clock itself.

use std::fmt;
use std::time::{Duration, Instant};

use crate::config::BweConfig;
use crate::feedback::{ClusterId, PacketResult, TransportPacketsFeedback};
use crate::rtp::{Bitrate, DataSize, SeqNo};
use crate::util::not_happening;

mod acked_bitrate_estimator;
mod alr_detector;
mod delay;
mod loss_controller;
mod probe;

use acked_bitrate_estimator::AckedBitrateEstimator;
use alr_detector::AlrDetector;
use delay::DelayController;
use loss_controller::LossController;
use probe::ProbeControl;

pub use probe::{ProbeClusterConfig, ProbeClusterState, ProbeEstimator};

const INITIAL_BITRATE_WINDOW: Duration = Duration::from_millis(500);
const BITRATE_WINDOW: Duration = Duration::from_millis(150);
/// A target falling below this share of the previous one is a large drop.
const LARGE_DROP_THRESHOLD: f64 = 0.66;
/// A large drop older than this does not cause a recovery probe.
const LARGE_DROP_TIMEOUT: Duration = Duration::from_secs(5);
/// Recovery probes go to this share of the bitrate before the drop.
const PROBE_FRACTION_AFTER_DROP: f64 = 0.85;

/// Phase of the estimator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BweState {
    /// No feedback received yet.
    Initial,
    /// Following the feedback.
    Tracking,
    /// A probe cluster is being sent.
    Probing,
}

impl fmt::Display for BweState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BweState::Initial => write!(f, "initial"),
            BweState::Tracking => write!(f, "tracking"),
            BweState::Probing => write!(f, "probing"),
        }
    }
}

/// Snapshot of the estimator output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BandwidthEstimate {
    /// The bitrate the application should target.
    pub target: Bitrate,
    /// Throughput acknowledged by the remote, once known.
    pub acked: Option<Bitrate>,
    /// Loss over the last loss update interval, 0.0 to 1.0.
    pub loss_fraction: f64,
    /// Last round trip time sample.
    pub rtt: Option<Duration>,
}

/// Send side bandwidth estimator.
///
/// ```
/// # use std::time::Instant;
/// # use medialink::{BandwidthEstimator, BweConfig, Bitrate};
/// let mut bwe = BandwidthEstimator::new(BweConfig::default());
/// let now = Instant::now();
///
/// // Without feedback the target stays at the start bitrate.
/// bwe.process(now);
/// assert_eq!(bwe.target_bitrate(), Bitrate::kbps(300));
/// ```
#[derive(Debug)]
pub struct BandwidthEstimator {
    config: BweConfig,
    state: BweState,

    delay_controller: DelayController,
    loss_controller: LossController,
    acked_bitrate_estimator: AckedBitrateEstimator,
    probe_control: ProbeControl,
    probe_estimator: ProbeEstimator,
    alr_detector: AlrDetector,

    target: Bitrate,
    /// Last target handed out by `poll_estimate`.
    polled: Option<Bitrate>,
    desired: Bitrate,
    rtt: Option<Duration>,

    lost_since_flush: u64,
    expected_since_flush: u64,
    last_loss_flush: Option<Instant>,

    /// Bitrate before the last large drop, and when it happened.
    last_large_drop: Option<(Bitrate, Instant)>,
}

impl BandwidthEstimator {
    pub fn new(config: BweConfig) -> Self {
        let start = config
            .start_bitrate()
            .clamp(config.min_bitrate(), config.max_bitrate());
        let (min, max) = (config.min_bitrate(), config.max_bitrate());

        Self {
            config,
            state: BweState::Initial,
            delay_controller: DelayController::new(start, min, max),
            loss_controller: LossController::new(start, min, max),
            acked_bitrate_estimator: AckedBitrateEstimator::new(
                INITIAL_BITRATE_WINDOW,
                BITRATE_WINDOW,
            ),
            probe_control: ProbeControl::new(),
            probe_estimator: ProbeEstimator::new(),
            alr_detector: AlrDetector::new(start),
            target: start,
            polled: None,
            desired: Bitrate::ZERO,
            rtt: None,
            lost_since_flush: 0,
            expected_since_flush: 0,
            last_loss_flush: None,
            last_large_drop: None,
        }
    }

    /// Handle feedback for sent packets.
    pub fn on_feedback(&mut self, feedback: &TransportPacketsFeedback) {
        let now = feedback.feedback_time;

        if self.state == BweState::Initial {
            self.set_state(BweState::Tracking);
        }

        if let Some(rtt) = feedback.rtt {
            self.rtt = Some(rtt);
            self.loss_controller.set_rtt(rtt);
        }

        self.lost_since_flush += feedback.lost_count() as u64;
        self.expected_since_flush += feedback.packets.len() as u64;
        self.maybe_flush_loss(now);

        let acked: Vec<AckedPacket> = feedback
            .received()
            .filter_map(|p| AckedPacket::from_result(p, now))
            .collect();

        for packet in &acked {
            self.acked_bitrate_estimator
                .update(packet.remote_recv_time, packet.size);
        }
        let acked_bitrate = self.acked_bitrate_estimator.current_estimate();
        if let Some(b) = acked_bitrate {
            crate::log_stat!("ACKED_BITRATE", b.as_f64());
        }

        let probe_bitrate = self
            .probe_estimator
            .update(&feedback.packets)
            .map(|(_, bitrate)| {
                floor_probe_result(
                    bitrate,
                    self.delay_controller.estimate(),
                    acked_bitrate,
                    self.config.probe_floor_fraction(),
                )
            });

        let in_alr = self.alr_detector.in_alr();
        let result =
            self.delay_controller
                .update(&acked, acked_bitrate, probe_bitrate, in_alr, now);

        if probe_bitrate.is_some() {
            self.loss_controller.set_estimate(result.estimate, now);
        }

        if result.recovered_from_overuse {
            self.request_recovery_probe(now);
        }

        self.update_target(now);
    }

    /// Media sent, for detecting when sending is application limited.
    ///
    /// Padding and probes should not be counted.
    pub fn on_media_sent(&mut self, size: DataSize, now: Instant) {
        self.alr_detector.on_bytes_sent(size, now);
    }

    /// What the application would like to send. Caps probing.
    pub fn set_desired_bitrate(&mut self, desired: Bitrate) {
        self.desired = desired;
    }

    /// Drive timers. Returns when this should be called next.
    pub fn process(&mut self, now: Instant) -> Instant {
        let acked = self.acked_bitrate_estimator.current_estimate();
        let in_alr = self.alr_detector.in_alr();

        self.delay_controller.handle_timeout(acked, in_alr, now);
        self.probe_estimator.handle_timeout(now);

        if self.state != BweState::Initial {
            self.update_target(now);
        }

        self.poll_timeout()
    }

    pub fn poll_timeout(&self) -> Instant {
        let probe = if self.state == BweState::Probing {
            not_happening()
        } else {
            self.probe_control.poll_timeout()
        };

        self.delay_controller
            .poll_timeout()
            .min(probe)
            .min(self.probe_estimator.poll_timeout())
    }

    /// A probe cluster to send, if it is time for one.
    ///
    /// The cluster is registered for estimation right away. Call [`end_probe()`][Self::end_probe]
    /// once it has been sent.
    pub fn poll_probe(&mut self, now: Instant) -> Option<ProbeClusterConfig> {
        if self.state == BweState::Probing || self.delay_controller.is_overusing() {
            return None;
        }

        let config = self
            .probe_control
            .maybe_create_probe(self.target, self.desired, now)?;

        self.start_probe(config);
        Some(config)
    }

    /// Start estimating from a probe cluster created elsewhere.
    pub fn start_probe(&mut self, config: ProbeClusterConfig) {
        self.probe_estimator.probe_start(config);
        self.set_state(BweState::Probing);
    }

    /// All packets of the cluster have been sent.
    pub fn end_probe(&mut self, cluster: ClusterId, now: Instant) {
        self.probe_estimator.end_probe(cluster, now);
        if self.state == BweState::Probing {
            self.set_state(BweState::Tracking);
        }
    }

    pub fn state(&self) -> BweState {
        self.state
    }

    pub fn target_bitrate(&self) -> Bitrate {
        self.target
    }

    /// The target bitrate, if it changed since the last call.
    pub fn poll_estimate(&mut self) -> Option<Bitrate> {
        if self.polled == Some(self.target) {
            return None;
        }
        self.polled = Some(self.target);
        Some(self.target)
    }

    pub fn estimate(&self) -> BandwidthEstimate {
        BandwidthEstimate {
            target: self.target,
            acked: self.acked_bitrate_estimator.current_estimate(),
            loss_fraction: self.loss_controller.loss_fraction(),
            rtt: self.rtt,
        }
    }

    /// Whether the delay based detector currently sees queues building.
    pub fn is_overusing(&self) -> bool {
        self.delay_controller.is_overusing()
    }

    fn maybe_flush_loss(&mut self, now: Instant) {
        let last = *self.last_loss_flush.get_or_insert(now);
        if now.saturating_duration_since(last) < self.config.loss_update_interval() {
            return;
        }

        self.loss_controller
            .update_packets_lost(self.lost_since_flush, self.expected_since_flush, now);

        self.lost_since_flush = 0;
        self.expected_since_flush = 0;
        self.last_loss_flush = Some(now);
    }

    fn update_target(&mut self, now: Instant) {
        let delay = self.delay_controller.estimate();
        self.loss_controller.set_delay_limit(delay, now);

        let target = if self.config.loss_controller_enabled() {
            self.loss_controller.estimate().min(delay)
        } else {
            delay
        };

        self.apply_target(target, now);
    }

    fn apply_target(&mut self, target: Bitrate, now: Instant) {
        let target = target.clamp(self.config.min_bitrate(), self.config.max_bitrate());
        if target == self.target {
            return;
        }

        if target < self.target * LARGE_DROP_THRESHOLD {
            self.last_large_drop = Some((self.target, now));
        }

        info!("Target bitrate {} -> {}", self.target, target);
        self.target = target;
        self.alr_detector.set_estimated_bitrate(target);
    }

    fn request_recovery_probe(&mut self, now: Instant) {
        let Some((before, at)) = self.last_large_drop else {
            return;
        };

        if now.saturating_duration_since(at) > LARGE_DROP_TIMEOUT {
            self.last_large_drop = None;
            return;
        }

        let bitrate = before * PROBE_FRACTION_AFTER_DROP;
        if self.target < bitrate {
            self.probe_control.request_probe(bitrate);
            self.last_large_drop = None;
        }
    }

    fn set_state(&mut self, state: BweState) {
        if self.state != state {
            debug!("Bandwidth estimator {} -> {}", self.state, state);
            self.state = state;
        }
    }
}

/// A probe can be disturbed by cross traffic. Don't let a poor result pull the estimate
/// far below what is already acknowledged.
fn floor_probe_result(
    probe: Bitrate,
    delay_estimate: Bitrate,
    acked: Option<Bitrate>,
    floor_fraction: f64,
) -> Bitrate {
    match acked {
        Some(acked) => probe.max(delay_estimate.min(acked * floor_fraction)),
        None => probe,
    }
}

/// A packet the remote acknowledged receiving.
#[derive(Debug, Clone, Copy)]
pub(crate) struct AckedPacket {
    pub seq_no: SeqNo,
    pub size: DataSize,
    pub send_time: Instant,
    /// When the remote received it, offset into our clock domain. Only comparable with
    /// other remote receive times.
    pub remote_recv_time: Instant,
    /// When we got the feedback for it.
    pub local_recv_time: Instant,
}

impl AckedPacket {
    fn from_result(result: &PacketResult, feedback_time: Instant) -> Option<Self> {
        Some(Self {
            seq_no: result.sent.transport_seq,
            size: result.sent.size,
            send_time: result.sent.send_time,
            remote_recv_time: result.receive_time?,
            local_recv_time: feedback_time,
        })
    }

    pub fn rtt(&self) -> Duration {
        self.local_recv_time
            .saturating_duration_since(self.send_time)
    }
}

/// `later - earlier` in milliseconds, negative if `later` is before `earlier`.
pub(crate) fn signed_ms(later: Instant, earlier: Instant) -> f64 {
    if later >= earlier {
        (later - earlier).as_nanos() as f64 / 1e6
    } else {
        -((earlier - later).as_nanos() as f64 / 1e6)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BandwidthUsage {
    Overuse,
    Normal,
    Underuse,
}

impl fmt::Display for BandwidthUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BandwidthUsage::Overuse => write!(f, "overuse"),
            BandwidthUsage::Normal => write!(f, "normal"),
            BandwidthUsage::Underuse => write!(f, "underuse"),
        }
    }
}

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use super::ProbeClusterConfig;
use crate::feedback::{ClusterId, PacketResult};
use crate::rtp::{Bitrate, DataSize};
use crate::util::not_happening;

const MIN_RECEIVED_PACKETS_RATIO: f64 = 0.80;
const MIN_RECEIVED_BYTES_RATIO: f64 = 0.80;
const MIN_CLUSTER_SIZE: usize = 4;
/// Longest valid time between the first and last packet, on either side.
const MAX_PROBE_INTERVAL: Duration = Duration::from_secs(1);
/// Receive rates much higher than the send rate are measurement errors.
const MAX_VALID_RATIO: f64 = 2.0;
/// Receiving slower than this share of the send rate means the link saturated.
const MIN_RATIO_FOR_UNSATURATED_LINK: f64 = 0.9;
/// Share of a saturated receive rate to use as the result.
const TARGET_UTILIZATION_FRACTION: f64 = 0.95;
/// How long feedback for an ended cluster is still accepted.
const CLUSTER_HISTORY: Duration = Duration::from_secs(1);

/// Computes the bitrate achieved by probe clusters from their feedback.
///
/// Only packets the remote reported as received count. Lost probe packets are ignored.
#[derive(Debug, Default)]
pub struct ProbeEstimator {
    states: VecDeque<ClusterEstimate>,
}

#[derive(Debug)]
struct ClusterEstimate {
    config: ProbeClusterConfig,
    finalize_at: Instant,
    first_send: Option<Instant>,
    last_send: Option<Instant>,
    /// Size of the last sent packet, not part of the send rate.
    size_last_send: DataSize,
    first_recv: Option<Instant>,
    last_recv: Option<Instant>,
    /// Size of the first received packet, not part of the receive rate.
    size_first_recv: DataSize,
    total: DataSize,
    count: usize,
}

impl ProbeEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start collecting feedback for a cluster.
    pub fn probe_start(&mut self, config: ProbeClusterConfig) {
        if self.states.iter().any(|s| s.config.cluster() == config.cluster()) {
            return;
        }
        self.states.push_back(ClusterEstimate::new(config));
    }

    /// The cluster was sent. Feedback is still accepted for a while.
    pub fn end_probe(&mut self, cluster: ClusterId, now: Instant) {
        if let Some(state) = self.states.iter_mut().find(|s| s.config.cluster() == cluster) {
            state.finalize_at = now + CLUSTER_HISTORY;
        }
    }

    /// Add feedback. Returns the result of the last cluster that got a valid estimate.
    pub fn update(&mut self, packets: &[PacketResult]) -> Option<(ClusterId, Bitrate)> {
        let mut updated: Option<ClusterId> = None;

        for packet in packets {
            let Some(cluster) = packet.sent.cluster else {
                continue;
            };
            let Some(state) = self.states.iter_mut().find(|s| s.config.cluster() == cluster)
            else {
                continue;
            };

            if state.update(packet) {
                updated = Some(cluster);
            }
        }

        let cluster = updated?;
        let state = self.states.iter().find(|s| s.config.cluster() == cluster)?;

        match state.calculate() {
            ProbeResult::Estimate(bitrate) => {
                debug!("Probe cluster {} result {}", cluster, bitrate);
                crate::log_stat!("PROBE_BITRATE_ESTIMATE", bitrate.as_f64());
                Some((cluster, bitrate))
            }
            result => {
                trace!("Probe cluster {} not usable yet: {}", cluster, result);
                None
            }
        }
    }

    pub fn poll_timeout(&self) -> Instant {
        self.states
            .iter()
            .map(|s| s.finalize_at)
            .min()
            .unwrap_or_else(not_happening)
    }

    /// Drop clusters whose feedback window has passed.
    pub fn handle_timeout(&mut self, now: Instant) {
        self.states.retain(|s| {
            let keep = now < s.finalize_at;
            if !keep {
                debug!(
                    "Probe cluster {} finalized: {}",
                    s.config.cluster(),
                    s.calculate()
                );
            }
            keep
        });
    }

    pub fn active(&self) -> usize {
        self.states.len()
    }
}

impl ClusterEstimate {
    fn new(config: ProbeClusterConfig) -> Self {
        Self {
            config,
            finalize_at: not_happening(),
            first_send: None,
            last_send: None,
            size_last_send: DataSize::ZERO,
            first_recv: None,
            last_recv: None,
            size_first_recv: DataSize::ZERO,
            total: DataSize::ZERO,
            count: 0,
        }
    }

    fn update(&mut self, packet: &PacketResult) -> bool {
        let Some(recv) = packet.receive_time else {
            return false;
        };
        let send = packet.sent.send_time;
        let size = packet.sent.size;

        let first = self.first_send.get_or_insert(send);
        *first = (*first).min(send);

        let last = self.last_send.get_or_insert(send);
        if send >= *last {
            *last = send;
            self.size_last_send = size;
        }

        let first_recv = self.first_recv.get_or_insert(recv);
        if recv <= *first_recv {
            *first_recv = recv;
            self.size_first_recv = size;
        }

        let last_recv = self.last_recv.get_or_insert(recv);
        *last_recv = (*last_recv).max(recv);

        self.total += size;
        self.count += 1;

        true
    }

    fn calculate(&self) -> ProbeResult {
        if self.count < MIN_CLUSTER_SIZE {
            return ProbeResult::TooFewPackets(self.count);
        }

        let min_packets = (self.config.min_packet_count() as f64 * MIN_RECEIVED_PACKETS_RATIO) as usize;
        let min_bytes = self.config.target_bytes().as_bytes_f64() * MIN_RECEIVED_BYTES_RATIO;
        if self.count < min_packets {
            return ProbeResult::TooFewPackets(self.count);
        }
        if self.total.as_bytes_f64() < min_bytes {
            return ProbeResult::TooFewBytes(self.total);
        }

        let (Some(first_send), Some(last_send), Some(first_recv), Some(last_recv)) =
            (self.first_send, self.last_send, self.first_recv, self.last_recv)
        else {
            return ProbeResult::TooFewPackets(self.count);
        };

        let send_interval = last_send.saturating_duration_since(first_send);
        let recv_interval = last_recv.saturating_duration_since(first_recv);

        if send_interval.is_zero() || send_interval > MAX_PROBE_INTERVAL {
            return ProbeResult::BadSendInterval(send_interval);
        }
        if recv_interval.is_zero() || recv_interval > MAX_PROBE_INTERVAL {
            return ProbeResult::BadRecvInterval(recv_interval);
        }

        let send_size = self.total.saturating_sub(self.size_last_send);
        let recv_size = self.total.saturating_sub(self.size_first_recv);
        let send_rate = send_size / send_interval;
        let recv_rate = recv_size / recv_interval;

        if send_rate == Bitrate::ZERO || recv_rate == Bitrate::ZERO {
            return ProbeResult::TooFewBytes(self.total);
        }

        let ratio = recv_rate.as_f64() / send_rate.as_f64();
        if ratio > MAX_VALID_RATIO {
            return ProbeResult::BadRatio(ratio);
        }

        let estimate = if recv_rate < send_rate * MIN_RATIO_FOR_UNSATURATED_LINK {
            recv_rate * TARGET_UTILIZATION_FRACTION
        } else {
            send_rate.min(recv_rate)
        };

        ProbeResult::Estimate(estimate)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ProbeResult {
    Estimate(Bitrate),
    TooFewPackets(usize),
    TooFewBytes(DataSize),
    BadSendInterval(Duration),
    BadRecvInterval(Duration),
    BadRatio(f64),
}

impl fmt::Display for ProbeResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeResult::Estimate(b) => write!(f, "estimate {}", b),
            ProbeResult::TooFewPackets(n) => write!(f, "too few packets received ({})", n),
            ProbeResult::TooFewBytes(n) => write!(f, "too few bytes received ({})", n),
            ProbeResult::BadSendInterval(d) => write!(f, "invalid send interval {:?}", d),
            ProbeResult::BadRecvInterval(d) => write!(f, "invalid receive interval {:?}", d),
            ProbeResult::BadRatio(r) => write!(f, "receive/send ratio {:.2} too high", r),
        }
    }
}

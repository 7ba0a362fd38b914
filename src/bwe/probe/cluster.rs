//! Probe clusters: short bursts sent above the current estimate to test the link.

use std::time::{Duration, Instant};

use crate::feedback::ClusterId;
use crate::rtp::{Bitrate, DataSize};

/// Largest padding packet a probe asks for.
const MAX_PROBE_PACKET: DataSize = DataSize::bytes(1200);

/// What a probe cluster should send.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeClusterConfig {
    cluster: ClusterId,
    target_bitrate: Bitrate,
    target_duration: Duration,
    min_packet_count: usize,
}

impl ProbeClusterConfig {
    /// A cluster sustaining `target_bitrate` for 15ms over at least 5 packets.
    pub fn new(cluster: ClusterId, target_bitrate: Bitrate) -> Self {
        Self {
            cluster,
            target_bitrate,
            target_duration: Duration::from_millis(15),
            min_packet_count: 5,
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.target_duration = duration;
        self
    }

    pub fn cluster(&self) -> ClusterId {
        self.cluster
    }

    pub fn target_bitrate(&self) -> Bitrate {
        self.target_bitrate
    }

    pub fn target_duration(&self) -> Duration {
        self.target_duration
    }

    pub fn min_packet_count(&self) -> usize {
        self.min_packet_count
    }

    /// Bytes sent at the target bitrate over the target duration.
    pub fn target_bytes(&self) -> DataSize {
        self.target_bitrate * self.target_duration
    }
}

/// Progress of a cluster being sent.
#[derive(Debug)]
pub struct ProbeClusterState {
    config: ProbeClusterConfig,
    bytes_sent: DataSize,
    packets_sent: usize,
    started_at: Option<Instant>,
}

impl ProbeClusterState {
    pub fn new(config: ProbeClusterConfig) -> Self {
        Self {
            config,
            bytes_sent: DataSize::ZERO,
            packets_sent: 0,
            started_at: None,
        }
    }

    pub fn config(&self) -> &ProbeClusterConfig {
        &self.config
    }

    /// Done when both the byte and packet targets are met.
    pub fn is_complete(&self) -> bool {
        self.started_at.is_some()
            && self.bytes_sent >= self.config.target_bytes()
            && self.packets_sent >= self.config.min_packet_count
    }

    /// Size of the next padding packet to send, if it is time for one.
    ///
    /// Packets are paced so the cluster goes out at the target bitrate.
    pub fn next_padding(&mut self, now: Instant) -> Option<DataSize> {
        if self.is_complete() {
            return None;
        }

        let started = *self.started_at.get_or_insert(now);
        let due = self.bytes_sent / self.config.target_bitrate;
        let not_yet = started.checked_add(due).map_or(true, |at| now < at);
        if not_yet {
            return None;
        }

        let remaining_packets = self
            .config
            .min_packet_count
            .saturating_sub(self.packets_sent)
            .max(1) as u64;
        let remaining_bytes = self.config.target_bytes().saturating_sub(self.bytes_sent);
        let even_share =
            DataSize::bytes(remaining_bytes.as_bytes_usize() as u64 / remaining_packets);

        Some(even_share.clamp(DataSize::bytes(1), MAX_PROBE_PACKET))
    }

    /// When the next padding packet is due. `None` before the first packet and once complete.
    pub fn poll_timeout(&self) -> Option<Instant> {
        if self.is_complete() {
            return None;
        }
        let started = self.started_at?;
        started.checked_add(self.bytes_sent / self.config.target_bitrate)
    }

    /// Count a packet sent as part of the cluster, media or padding.
    pub fn record_packet(&mut self, size: DataSize, now: Instant) {
        self.started_at.get_or_insert(now);
        self.bytes_sent += size;
        self.packets_sent += 1;
    }
}

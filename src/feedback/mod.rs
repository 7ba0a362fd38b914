//! Congestion control feedback (RFC 8888) on both ends of a stream.
//!
//! The receive side [`FeedbackGenerator`] records arrivals and emits rate limited
//! [`CongestionControlFeedback`][crate::rtp::CongestionControlFeedback]. The send side
//! [`TransportFeedbackAdapter`] matches that feedback against a log of sent packets and
//! produces [`TransportPacketsFeedback`] for the bandwidth estimator.

use std::cmp::Ordering;
use std::time::{Duration, Instant};

use crate::rtp::{DataSize, SeqNo, Ssrc};

mod adapter;
mod generator;

pub use adapter::TransportFeedbackAdapter;
pub use generator::FeedbackGenerator;

/// Identifies a probe cluster. Packets sent as part of a probe carry the id of their
/// cluster so the probe result can be computed from the feedback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ClusterId(u64);

impl ClusterId {
    /// The following cluster id.
    pub fn inc(&mut self) -> ClusterId {
        let current = *self;
        self.0 += 1;
        current
    }
}

impl From<u64> for ClusterId {
    fn from(v: u64) -> Self {
        ClusterId(v)
    }
}

impl std::fmt::Display for ClusterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A packet as recorded when it was sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentPacket {
    /// Transport wide sequence number. Increases by one per sent packet across all SSRCs.
    pub transport_seq: SeqNo,
    /// The RTP stream.
    pub ssrc: Ssrc,
    /// Unwrapped RTP sequence number within the stream.
    pub rtp_seq: SeqNo,
    /// When the packet was handed to the network.
    pub send_time: Instant,
    /// Size of the packet on the wire.
    pub size: DataSize,
    /// Probe cluster the packet was sent as part of.
    pub cluster: Option<ClusterId>,
}

/// Outcome of a sent packet as reported by the remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketResult {
    pub sent: SentPacket,
    /// Receive time in the local clock domain. `None` if the packet was lost.
    ///
    /// The absolute value is offset by the unknown one way delay. Only differences
    /// between receive times of the same feedback stream are meaningful.
    pub receive_time: Option<Instant>,
}

impl PacketResult {
    pub fn is_received(&self) -> bool {
        self.receive_time.is_some()
    }

    pub(crate) fn order_by_receive_time(lhs: &Self, rhs: &Self) -> Ordering {
        match (lhs.receive_time, rhs.receive_time) {
            (Some(l), Some(r)) if l != r => l.cmp(&r),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            _ => lhs
                .sent
                .send_time
                .cmp(&rhs.sent.send_time)
                .then(lhs.sent.transport_seq.cmp(&rhs.sent.transport_seq)),
        }
    }
}

/// Feedback for a batch of sent packets.
#[derive(Debug, Clone)]
pub struct TransportPacketsFeedback {
    /// When the feedback was received.
    pub feedback_time: Instant,
    /// Received packets ordered by receive time, followed by lost packets.
    pub packets: Vec<PacketResult>,
    /// Smallest round trip time of the received packets, excluding the time the packet
    /// waited at the receiver before the feedback was sent.
    pub rtt: Option<Duration>,
}

impl TransportPacketsFeedback {
    /// Packets that were received.
    pub fn received(&self) -> impl Iterator<Item = &PacketResult> {
        self.packets.iter().filter(|p| p.is_received())
    }

    /// Number of lost packets.
    pub fn lost_count(&self) -> usize {
        self.packets.iter().filter(|p| !p.is_received()).count()
    }
}

//! Send and receive paths of one media stream.
//!
//! A [`SendStream`] turns frames into RTP packets, protects them with FEC and hands them
//! to a [`Transport`]. Congestion control feedback coming back is matched against what
//! was sent and drives the bandwidth estimate, which is reported to a [`BitrateObserver`].
//!
//! A [`RecvStream`] takes RTP packets off the network, recovers lost packets from
//! repair packets, assembles frames for a [`FrameSink`] and produces the RTCP feedback
//! the sender needs.
//!
//! Neither side does any I/O or owns a clock. Time is passed in as `now`, and each
//! `process()` returns when it wants to be called next.

use std::fmt;
use std::time::{Duration, Instant};

use crate::bwe::BandwidthEstimate;

mod receive;
pub use receive::RecvStream;

mod send;
pub use send::SendStream;

// Time between regular receiver reports.
// RFC 3550 suggests longer, but video is expected to report every second.
const RR_INTERVAL: Duration = Duration::from_millis(1000);

/// Outcome of handing a datagram to the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// The datagram was accepted.
    Sent,
    /// The socket is full. The datagram is dropped, not retried.
    WouldBlock,
    /// The datagram could not be sent.
    Failed,
}

impl fmt::Display for SendStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendStatus::Sent => write!(f, "sent"),
            SendStatus::WouldBlock => write!(f, "would block"),
            SendStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Where a [`SendStream`] writes its packets.
pub trait Transport {
    /// Send one serialized RTP or RTCP packet.
    fn send(&mut self, buf: &[u8]) -> SendStatus;
}

impl<F> Transport for F
where
    F: FnMut(&[u8]) -> SendStatus,
{
    fn send(&mut self, buf: &[u8]) -> SendStatus {
        (self)(buf)
    }
}

/// Told about changes to the send bitrate.
pub trait BitrateObserver {
    /// The target bitrate changed. The encoder should adapt to `estimate.target`.
    fn on_target_bitrate(&mut self, estimate: &BandwidthEstimate);
}

impl<F> BitrateObserver for F
where
    F: FnMut(&BandwidthEstimate),
{
    fn on_target_bitrate(&mut self, estimate: &BandwidthEstimate) {
        (self)(estimate)
    }
}

/// A frame put back together by a [`RecvStream`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFrame {
    /// The depacketized frame.
    pub data: Vec<u8>,
    /// Capture time in the media clock, the RTP timestamp of the frame.
    pub rtp_time: u32,
    /// When the packet completing the frame arrived.
    pub receive_time: Instant,
    /// Frame decodable on its own.
    pub is_keyframe: bool,
    /// Some packets of the frame were recovered with FEC.
    pub recovered: bool,
}

/// Receives the frames of a [`RecvStream`].
pub trait FrameSink {
    fn on_frame(&mut self, frame: ReceivedFrame);
}

impl<F> FrameSink for F
where
    F: FnMut(ReceivedFrame),
{
    fn on_frame(&mut self, frame: ReceivedFrame) {
        (self)(frame)
    }
}

use std::mem;
use std::time::{Duration, Instant};

use super::super::{signed_ms, AckedPacket};
use crate::rtp::SeqNo;

const BURST_TIME_INTERVAL_MS: f64 = 5.0;
const SEND_TIME_GROUP_LENGTH: Duration = Duration::from_millis(5);
const MAX_BURST_DURATION: Duration = Duration::from_millis(100);

/// Packets sent within a short interval of each other.
///
/// Comparing whole groups rather than single packets evens out the jitter introduced
/// by the sender's pacing and the receiver's interrupt coalescing.
#[derive(Debug, Default)]
struct ArrivalGroup {
    /// Send and receive time of the first packet.
    first: Option<(Instant, Instant)>,
    last_seq_no: Option<SeqNo>,
    last_send_time: Option<Instant>,
    last_recv_time: Option<Instant>,
    size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Belongs {
    Yes,
    NewGroup,
    /// Sent before the group started, ignore it.
    Skipped,
}

impl ArrivalGroup {
    /// Add the packet unless it starts a new group. Returns `true` if it does.
    fn add_packet(&mut self, packet: &AckedPacket) -> bool {
        match self.belongs_to_group(packet) {
            Belongs::NewGroup => return true,
            Belongs::Skipped => return false,
            Belongs::Yes => {}
        }

        if self.first.is_none() {
            self.first = Some((packet.send_time, packet.remote_recv_time));
        }

        self.last_recv_time = self.last_recv_time.max(Some(packet.remote_recv_time));
        self.last_send_time = self.last_send_time.max(Some(packet.send_time));
        self.last_seq_no = self.last_seq_no.max(Some(packet.seq_no));
        self.size += 1;

        false
    }

    fn belongs_to_group(&self, packet: &AckedPacket) -> Belongs {
        let (Some((first_send, first_recv)), Some(last_send), Some(last_recv)) =
            (self.first, self.last_send_time, self.last_recv_time)
        else {
            return Belongs::Yes;
        };

        let Some(first_send_delta) = packet.send_time.checked_duration_since(first_send) else {
            return Belongs::Skipped;
        };

        let send_delta = signed_ms(packet.send_time, last_send);
        if send_delta == 0.0 {
            return Belongs::Yes;
        }
        let arrival_delta = signed_ms(packet.remote_recv_time, last_recv);
        let propagation_delta = arrival_delta - send_delta;

        let in_burst = propagation_delta < 0.0
            && arrival_delta <= BURST_TIME_INTERVAL_MS
            && packet.remote_recv_time.saturating_duration_since(first_recv) < MAX_BURST_DURATION;

        if in_burst {
            Belongs::Yes
        } else if first_send_delta > SEND_TIME_GROUP_LENGTH {
            Belongs::NewGroup
        } else {
            Belongs::Yes
        }
    }
}

/// Splits acknowledged packets into arrival groups and produces the delay variation
/// between consecutive groups.
#[derive(Debug, Default)]
pub(crate) struct ArrivalGroupAccumulator {
    previous: Option<ArrivalGroup>,
    current: ArrivalGroup,
}

impl ArrivalGroupAccumulator {
    /// Returns a delay delta when the packet closes the current group and there was a
    /// group before it.
    pub fn accumulate_packet(&mut self, packet: &AckedPacket) -> Option<InterGroupDelayDelta> {
        if !self.current.add_packet(packet) {
            return None;
        }

        let delta = match (&self.previous, &self.current) {
            (
                Some(ArrivalGroup {
                    last_send_time: Some(prev_send),
                    last_recv_time: Some(prev_recv),
                    ..
                }),
                ArrivalGroup {
                    last_send_time: Some(cur_send),
                    last_recv_time: Some(cur_recv),
                    ..
                },
            ) => Some(InterGroupDelayDelta {
                send_delta: signed_ms(*cur_send, *prev_send),
                arrival_delta: signed_ms(*cur_recv, *prev_recv),
                last_remote_recv_time: *cur_recv,
            }),
            _ => None,
        };

        self.previous = Some(mem::take(&mut self.current));
        self.current.add_packet(packet);

        delta
    }
}

/// Timing difference between two consecutive arrival groups, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct InterGroupDelayDelta {
    pub send_delta: f64,
    pub arrival_delta: f64,
    /// Receive time of the last packet in the later group.
    pub last_remote_recv_time: Instant,
}

impl InterGroupDelayDelta {
    /// How much longer the later group took to cross the network.
    pub fn delay(&self) -> f64 {
        self.arrival_delta - self.send_delta
    }
}

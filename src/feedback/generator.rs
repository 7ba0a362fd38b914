use std::collections::{BTreeMap, VecDeque};
use std::time::Instant;

use crate::config::FeedbackConfig;
use crate::rtp::{extend_recv_u16, Bitrate, CongestionControlFeedback, DataSize};
use crate::rtp::{FeedbackBlock, PacketReport, RtcpPacket, Ssrc, MAX_REPORTS_PER_BLOCK};
use crate::util::{already_happened, InstantExt};

/// Feedback rate used until the first send bitrate is known.
const INITIAL_MAX_FEEDBACK_RATE: Bitrate = Bitrate::kbps(1000);

/// How far behind the last reported sequence number a late packet is still reported.
const REORDER_WINDOW: u64 = 64;

/// Accumulates packet arrivals and emits congestion control feedback (RFC 8888).
///
/// Feedback is sent when a frame has been completed (marker bit) or after a bounded wait,
/// and the bytes spent on feedback are kept to a fraction of the send bitrate with a
/// leaky bucket.
#[derive(Debug)]
pub struct FeedbackGenerator {
    config: FeedbackConfig,
    sender_ssrc: Ssrc,
    trackers: BTreeMap<Ssrc, FeedbackTracker>,
    /// A marker bit has been seen since the last feedback.
    marker_seen: bool,
    /// First arrival since the last feedback.
    first_arrival: Option<Instant>,
    max_feedback_rate: Bitrate,
    send_rate_debt: DataSize,
    last_feedback_sent: Option<Instant>,
    next_possible_send: Instant,
    queued: VecDeque<CongestionControlFeedback>,
}

impl FeedbackGenerator {
    pub fn new(sender_ssrc: Ssrc, config: FeedbackConfig) -> Self {
        FeedbackGenerator {
            config,
            sender_ssrc,
            trackers: BTreeMap::new(),
            marker_seen: false,
            first_arrival: None,
            max_feedback_rate: INITIAL_MAX_FEEDBACK_RATE,
            send_rate_debt: DataSize::ZERO,
            last_feedback_sent: None,
            next_possible_send: already_happened(),
            queued: VecDeque::new(),
        }
    }

    /// Record an arriving RTP packet.
    pub fn on_received(&mut self, ssrc: Ssrc, seq: u16, marker: bool, ecn: u8, now: Instant) {
        self.first_arrival.get_or_insert(now);
        self.marker_seen |= marker;

        self.trackers
            .entry(ssrc)
            .or_default()
            .on_received(seq, ecn, now);

        if self.next_feedback_time(now) < now {
            self.send_feedback(now);
        }
    }

    /// Drive the timer. Returns when this should be called next.
    pub fn process(&mut self, now: Instant) -> Instant {
        if self.next_feedback_time(now) <= now {
            self.send_feedback(now);
        }
        self.next_feedback_time(now)
    }

    /// Feedback ready to be sent.
    pub fn poll_feedback(&mut self) -> Option<CongestionControlFeedback> {
        self.queued.pop_front()
    }

    /// The bitrate of the media we send changed. Feedback is limited to a fraction of it.
    pub fn on_send_bitrate_changed(&mut self, estimate: Bitrate) {
        self.max_feedback_rate = estimate * self.config.feedback_fraction();
        trace!("Max feedback rate: {}", self.max_feedback_rate);
    }

    /// Per packet overhead (IP, UDP etc.) counted on top of each report.
    pub fn set_packet_overhead(&mut self, overhead: DataSize) {
        self.config.set_packet_overhead(overhead);
    }

    /// Current limit on the feedback bitrate.
    pub fn max_feedback_rate(&self) -> Bitrate {
        self.max_feedback_rate
    }

    /// When feedback should be sent.
    pub fn next_feedback_time(&self, now: Instant) -> Instant {
        let Some(first_arrival) = self.first_arrival else {
            return (now + self.config.min_interval()).max(self.next_possible_send);
        };

        if !self.marker_seen {
            return self
                .next_possible_send
                .max(first_arrival + self.config.max_marker_wait());
        }

        self.next_possible_send
    }

    fn send_feedback(&mut self, now: Instant) {
        let report_timestamp = now.to_compact_ntp();

        let blocks: Vec<_> = self
            .trackers
            .iter_mut()
            .filter_map(|(ssrc, t)| t.build_block(*ssrc, now))
            .collect();

        self.marker_seen = false;
        self.first_arrival = None;

        if blocks.is_empty() {
            return;
        }

        let feedback = CongestionControlFeedback {
            sender_ssrc: self.sender_ssrc,
            blocks,
            report_timestamp,
        };

        let size = DataSize::from(feedback.length_words() * 4);
        self.calculate_next_possible_send(size, now);

        trace!(
            "Send feedback of {} bytes, next possible in {:?}",
            size,
            self.next_possible_send.saturating_duration_since(now)
        );

        self.queued.push_back(feedback);
    }

    fn calculate_next_possible_send(&mut self, size: DataSize, now: Instant) {
        if let Some(last) = self.last_feedback_sent {
            let payed = self.max_feedback_rate * now.saturating_duration_since(last);
            self.send_rate_debt = self.send_rate_debt.saturating_sub(payed);
        } else {
            self.send_rate_debt = DataSize::ZERO;
        }
        self.send_rate_debt += size + self.config.packet_overhead();
        self.last_feedback_sent = Some(now);

        // Division by a zero rate is Duration::MAX, which clamps to the max interval.
        let wait = (self.send_rate_debt / self.max_feedback_rate)
            .clamp(self.config.min_interval(), self.config.max_interval());

        self.next_possible_send = now + wait;
    }
}

/// Arrivals of one SSRC since the last feedback.
#[derive(Debug, Default)]
struct FeedbackTracker {
    /// Last unwrapped sequence number seen.
    max_seq: Option<u64>,
    /// Last unwrapped sequence number included in feedback.
    last_in_feedback: Option<u64>,
    packets: Vec<Arrival>,
    /// Arrivals already in feedback, within [`REORDER_WINDOW`] of `last_in_feedback`.
    reported: VecDeque<Arrival>,
}

#[derive(Debug, Clone, Copy)]
struct Arrival {
    seq: u64,
    ecn: u8,
    time: Instant,
}

impl FeedbackTracker {
    fn on_received(&mut self, seq: u16, ecn: u8, now: Instant) {
        let seq = extend_recv_u16(self.max_seq, seq);
        self.max_seq = Some(self.max_seq.map_or(seq, |m| m.max(seq)));

        if let Some(last) = self.last_in_feedback {
            if seq <= last {
                if last - seq >= REORDER_WINDOW || self.reported.iter().any(|p| p.seq == seq) {
                    trace!("Packet {} already reported in feedback", seq);
                    return;
                }
                // Reported lost before. The next feedback goes back to include it.
                trace!("Late packet {} reported again", seq);
            }
        }

        self.packets.push(Arrival { seq, ecn, time: now });
    }

    fn build_block(&mut self, ssrc: Ssrc, now: Instant) -> Option<FeedbackBlock> {
        if self.packets.is_empty() {
            return None;
        }

        self.packets.sort_by_key(|p| p.seq);
        self.packets.dedup_by_key(|p| p.seq);

        let first = self.packets[0].seq;

        // Late packets pull the start back. Arrivals reported before are repeated
        // rather than reported lost.
        let mut begin = self.last_in_feedback.map_or(first, |l| first.min(l + 1));
        let mut arrivals: Vec<Arrival> = self
            .reported
            .iter()
            .filter(|p| p.seq >= begin)
            .chain(self.packets.iter())
            .copied()
            .collect();
        arrivals.sort_by_key(|p| p.seq);

        let last = arrivals[arrivals.len() - 1].seq;
        if last - begin >= MAX_REPORTS_PER_BLOCK as u64 {
            begin = last + 1 - MAX_REPORTS_PER_BLOCK as u64;
        }

        let mut reports = Vec::with_capacity((last - begin + 1) as usize);
        let mut iter = arrivals.iter().peekable();

        for seq in begin..=last {
            while iter.peek().map(|p| p.seq < seq).unwrap_or(false) {
                iter.next();
            }

            let report = match iter.peek() {
                Some(p) if p.seq == seq => PacketReport {
                    received: true,
                    ecn: p.ecn,
                    arrival_time_offset: Some(now.saturating_duration_since(p.time)),
                },
                _ => PacketReport::lost(),
            };
            reports.push(report);
        }

        let last = self.last_in_feedback.map_or(last, |l| l.max(last));
        self.last_in_feedback = Some(last);

        self.reported.extend(self.packets.drain(..));
        self.reported.retain(|p| p.seq + REORDER_WINDOW > last);

        Some(FeedbackBlock {
            ssrc,
            begin_seq: begin as u16,
            reports,
        })
    }
}

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use super::{ClusterId, PacketResult, SentPacket, TransportPacketsFeedback};
use crate::rtp::{extend_u16, CongestionControlFeedback, DataSize, SeqNo, Ssrc};

/// Default for how long sent packets are kept waiting for feedback.
const SEND_TIME_HISTORY_WINDOW: Duration = Duration::from_secs(60);

/// Keeps a log of sent packets and turns incoming congestion control feedback into
/// per packet results.
///
/// Received packets are removed from the log when matched. Lost packets stay until they
/// age out, since a later report can still mark them received.
#[derive(Debug)]
pub struct TransportFeedbackAdapter {
    /// Next transport wide sequence number.
    next_seq: SeqNo,
    /// Sent packets by transport sequence number.
    history: BTreeMap<SeqNo, SentPacket>,
    /// Lookup from the RTP sequence number seen in feedback to the transport sequence number.
    by_rtp_seq: HashMap<(Ssrc, u16), SeqNo>,
    /// Last unwrapped RTP sequence number per stream, for unwrapping feedback.
    last_rtp_seq: HashMap<Ssrc, u64>,
    /// Compact NTP timestamp of the previous feedback.
    last_report_timestamp: Option<u32>,
    /// Receive time base in the local clock domain.
    current_offset: Option<Instant>,
    /// Bytes sent but not yet reported.
    in_flight: DataSize,
    /// Sent packets older than this are forgotten.
    history_window: Duration,
}

impl TransportFeedbackAdapter {
    pub fn new() -> Self {
        TransportFeedbackAdapter {
            next_seq: 0.into(),
            history: BTreeMap::new(),
            by_rtp_seq: HashMap::new(),
            last_rtp_seq: HashMap::new(),
            last_report_timestamp: None,
            current_offset: None,
            in_flight: DataSize::ZERO,
            history_window: SEND_TIME_HISTORY_WINDOW,
        }
    }

    /// Set how long sent packets wait for feedback before they are forgotten.
    pub fn with_history_window(mut self, window: Duration) -> Self {
        self.history_window = window;
        self
    }

    /// Record a packet handed to the network.
    ///
    /// Returns the transport wide sequence number assigned to it.
    pub fn on_sent(
        &mut self,
        ssrc: Ssrc,
        rtp_seq: SeqNo,
        size: DataSize,
        cluster: Option<ClusterId>,
        now: Instant,
    ) -> SeqNo {
        self.prune(now);

        let transport_seq = self.next_seq;
        self.next_seq = self.next_seq.next();

        let key = (ssrc, rtp_seq.as_u16());
        if let Some(prev) = self.by_rtp_seq.insert(key, transport_seq) {
            // The 16 bit sequence space wrapped within the history window.
            if let Some(p) = self.history.remove(&prev) {
                self.in_flight = self.in_flight.saturating_sub(p.size);
            }
        }

        let last = self.last_rtp_seq.entry(ssrc).or_insert(*rtp_seq);
        *last = (*last).max(*rtp_seq);

        self.history.insert(
            transport_seq,
            SentPacket {
                transport_seq,
                ssrc,
                rtp_seq,
                send_time: now,
                size,
                cluster,
            },
        );
        self.in_flight += size;

        transport_seq
    }

    /// Match incoming feedback against the sent packets.
    ///
    /// Returns `None` if no reported packet could be matched.
    pub fn on_feedback(
        &mut self,
        feedback: &CongestionControlFeedback,
        now: Instant,
    ) -> Option<TransportPacketsFeedback> {
        self.prune(now);

        let offset = self.update_offset(feedback.report_timestamp, now);

        let mut packets = vec![];
        let mut rtt: Option<Duration> = None;

        for block in &feedback.blocks {
            let Some(last) = self.last_rtp_seq.get(&block.ssrc).copied() else {
                trace!("Feedback for unknown SSRC: {}", block.ssrc);
                continue;
            };

            let begin = extend_u16(Some(last), block.begin_seq);

            for (i, report) in block.reports.iter().enumerate() {
                let wire_seq = (begin + i as u64) as u16;

                let Some(transport_seq) = self.by_rtp_seq.get(&(block.ssrc, wire_seq)).copied()
                else {
                    continue;
                };

                if !report.received {
                    if let Some(sent) = self.history.get(&transport_seq) {
                        packets.push(PacketResult {
                            sent: *sent,
                            receive_time: None,
                        });
                    }
                    continue;
                }

                // A received packet without an offset can't be placed in time.
                let Some(ato) = report.arrival_time_offset else {
                    continue;
                };

                let Some(sent) = self.history.remove(&transport_seq) else {
                    continue;
                };
                self.by_rtp_seq.remove(&(block.ssrc, wire_seq));
                self.in_flight = self.in_flight.saturating_sub(sent.size);

                let receive_time = offset.checked_sub(ato).unwrap_or(offset);

                // Round trip less the time the packet waited at the receiver.
                let sample = now
                    .saturating_duration_since(sent.send_time)
                    .saturating_sub(ato);
                rtt = Some(rtt.map_or(sample, |r| r.min(sample)));

                packets.push(PacketResult {
                    sent,
                    receive_time: Some(receive_time),
                });
            }
        }

        if packets.is_empty() {
            trace!("No sent packets matched feedback");
            return None;
        }

        packets.sort_by(PacketResult::order_by_receive_time);

        Some(TransportPacketsFeedback {
            feedback_time: now,
            packets,
            rtt,
        })
    }

    /// Bytes sent that have not been reported received.
    pub fn in_flight(&self) -> DataSize {
        self.in_flight
    }

    /// Number of packets waiting for feedback.
    pub fn pending(&self) -> usize {
        self.history.len()
    }

    fn update_offset(&mut self, report_timestamp: u32, now: Instant) -> Instant {
        let prev = self.last_report_timestamp.replace(report_timestamp);

        let offset = match (self.current_offset, prev) {
            (Some(offset), Some(prev)) => {
                // Compact NTP is 16.16 fixed point seconds.
                let delta = report_timestamp.wrapping_sub(prev) as i32;
                if delta < 0 {
                    warn!("Unexpected feedback report timestamp delta: {}", delta);
                    now
                } else {
                    let delta = Duration::from_micros(delta as u64 * 1_000_000 / 65_536);
                    offset + delta
                }
            }
            _ => now,
        };

        self.current_offset = Some(offset);
        offset
    }

    fn prune(&mut self, now: Instant) {
        let Some(limit) = now.checked_sub(self.history_window) else {
            return;
        };

        while let Some(entry) = self.history.first_entry() {
            if entry.get().send_time >= limit {
                break;
            }
            let p = entry.remove();
            let key = (p.ssrc, p.rtp_seq.as_u16());
            if self.by_rtp_seq.get(&key) == Some(&p.transport_seq) {
                self.by_rtp_seq.remove(&key);
            }
            self.in_flight = self.in_flight.saturating_sub(p.size);
        }
    }
}

impl Default for TransportFeedbackAdapter {
    fn default() -> Self {
        Self::new()
    }
}

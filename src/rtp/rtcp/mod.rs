#![allow(clippy::unusual_byte_groupings)]

use std::collections::VecDeque;

use crate::Error;

mod header;
pub use header::{RtcpHeader, RtcpType};
use header::{FMT_CCFB, LEN_HEADER};

mod list;
use list::WordSized;
pub use list::{ReportList, MAX_REPORTS};

mod sr;
pub use sr::{SenderInfo, SenderReport};

mod rr;
pub use rr::{ReceiverReport, ReceptionReport};

mod ccfb;
pub use ccfb::{CongestionControlFeedback, FeedbackBlock, PacketReport, MAX_REPORTS_PER_BLOCK};

use super::Ssrc;

/// Common behavior of all RTCP packets.
pub trait RtcpPacket {
    /// The header this packet serializes with.
    fn header(&self) -> RtcpHeader;

    /// Length of entire RTCP packet (including header) in words (4 bytes).
    fn length_words(&self) -> usize;

    /// Write this packet to the buffer.
    ///
    /// Panics if the buffer doesn't have capacity to hold length_words * 4 bytes.
    fn write_to(&self, buf: &mut [u8]) -> usize;
}

/// RTCP packets handled by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rtcp {
    /// Sender report. Also known as SR.
    SenderReport(SenderReport),
    /// Receiver report. Also known as RR.
    ReceiverReport(ReceiverReport),
    /// Per packet arrival feedback for congestion control (RFC 8888).
    CongestionControlFeedback(CongestionControlFeedback),
}

impl Rtcp {
    /// Parse a compound RTCP packet.
    ///
    /// Fails on the first packet that does not parse. Use [`Rtcp::read_packet`] to keep
    /// whatever parses before a broken packet.
    pub fn parse(buf: &[u8]) -> Result<Vec<Rtcp>, Error> {
        let mut buf = buf;
        let mut ret = vec![];

        if buf.len() < LEN_HEADER {
            return Err(Error::Malformed("Less than 4 bytes for RTCP header"));
        }

        while !buf.is_empty() {
            let header: RtcpHeader = buf.try_into()?;
            let full_length = header.length_bytes();

            if full_length > buf.len() {
                return Err(Error::Truncated {
                    needed: full_length,
                    available: buf.len(),
                });
            }

            let unpadded_length = if header.has_padding() {
                let pad = buf[full_length - 1] as usize;
                if pad == 0 || full_length < LEN_HEADER + pad {
                    return Err(Error::Malformed("RTCP padding exceeds packet"));
                }
                full_length - pad
            } else {
                full_length
            };

            ret.push((&buf[..unpadded_length]).try_into()?);

            buf = &buf[full_length..];
        }

        Ok(ret)
    }

    /// Parse a compound RTCP packet into `feedback`. Broken packets are logged and dropped.
    pub fn read_packet(buf: &[u8], feedback: &mut VecDeque<Rtcp>) {
        let mut buf = buf;
        loop {
            if buf.is_empty() {
                break;
            }

            if buf.len() < LEN_HEADER {
                warn!("Drop RTCP: {} trailing bytes", buf.len());
                break;
            }

            // Only the length is needed to skip a packet we can't parse.
            let full_length = (u16::from_be_bytes([buf[2], buf[3]]) as usize + 1) * 4;

            if full_length > buf.len() {
                warn!(
                    "Drop RTCP: length exceeds buffer {} > {}",
                    full_length,
                    buf.len()
                );
                break;
            }

            match Rtcp::parse(&buf[..full_length]) {
                Ok(v) => feedback.extend(v),
                Err(e) => warn!("Drop RTCP packet type {}: {}", buf[1], e),
            }

            buf = &buf[full_length..];
        }
    }

    /// Serialize as many of `feedback` as fit into `buf`. SR and RR blocks are merged
    /// to save headers.
    pub fn write_packet(feedback: &mut VecDeque<Rtcp>, buf: &mut [u8]) -> usize {
        if feedback.is_empty() {
            return 0;
        }

        let total_len = buf.len();
        let word_capacity = total_len / 4;

        Rtcp::pack(feedback, word_capacity);

        let mut offset = 0;
        while let Some(fb) = feedback.front() {
            let item_len = fb.length_words() * 4;

            let capacity = total_len - offset;
            if capacity < item_len {
                break;
            }

            let Some(fb) = feedback.pop_front() else {
                break;
            };
            let written = fb.write_to(&mut buf[offset..]);

            debug_assert_eq!(written, item_len, "length_words equals write_to length");

            offset += item_len;
        }

        offset
    }

    /// Serialize a single packet into a new buffer.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut buf = vec![0; self.length_words() * 4];
        self.write_to(&mut buf);
        buf
    }

    fn merge(&mut self, other: &mut Rtcp, words_left: usize) -> bool {
        match (self, other) {
            // Stack receiver reports into sender reports.
            (Rtcp::SenderReport(sr), Rtcp::ReceiverReport(rr)) => {
                let n = sr.reports.append_all_possible(&mut rr.reports, words_left);
                n > 0
            }

            // Stack receiver reports.
            (Rtcp::ReceiverReport(r1), Rtcp::ReceiverReport(r2)) => {
                let n = r1.reports.append_all_possible(&mut r2.reports, words_left);
                n > 0
            }

            _ => false,
        }
    }

    fn is_full(&self) -> bool {
        match self {
            Rtcp::SenderReport(v) => v.reports.is_full(),
            Rtcp::ReceiverReport(v) => v.reports.is_full(),
            Rtcp::CongestionControlFeedback(_) => true,
        }
    }

    /// After merging, a receiver report can end up without blocks.
    fn is_empty(&self) -> bool {
        match self {
            Rtcp::SenderReport(_) => false,
            Rtcp::ReceiverReport(v) => v.reports.is_empty(),
            Rtcp::CongestionControlFeedback(_) => false,
        }
    }

    fn pack(feedback: &mut VecDeque<Self>, mut word_capacity: usize) {
        let len = feedback.len();
        if len < 2 {
            return;
        }

        feedback.make_contiguous().sort_by_key(Self::order_no);

        // Index of the item we are packing into.
        let mut i = 0;

        'outer: while i < len - 1 {
            let (pack_into, pack_from) = feedback.make_contiguous().split_at_mut(i + 1);
            let Some(fb_a) = pack_into.last_mut() else {
                break;
            };

            if word_capacity < fb_a.length_words() {
                break 'outer;
            }

            let mut any_change = false;

            for fb_b in pack_from {
                if fb_a.is_full() || fb_a.is_empty() {
                    break;
                }

                if word_capacity < fb_a.length_words() {
                    break 'outer;
                }

                let capacity = word_capacity - fb_a.length_words();
                any_change |= fb_a.merge(fb_b, capacity);
            }

            if !any_change {
                word_capacity -= fb_a.length_words();
                i += 1;
            }
        }

        feedback.retain(|f| !f.is_empty());
    }

    fn order_no(&self) -> u8 {
        match self {
            Rtcp::SenderReport(_) => 0,
            Rtcp::ReceiverReport(_) => 1,
            Rtcp::CongestionControlFeedback(_) => 2,
        }
    }
}

impl RtcpPacket for Rtcp {
    fn header(&self) -> RtcpHeader {
        match self {
            Rtcp::SenderReport(v) => v.header(),
            Rtcp::ReceiverReport(v) => v.header(),
            Rtcp::CongestionControlFeedback(v) => v.header(),
        }
    }

    fn length_words(&self) -> usize {
        match self {
            Rtcp::SenderReport(v) => v.length_words(),
            Rtcp::ReceiverReport(v) => v.length_words(),
            Rtcp::CongestionControlFeedback(v) => v.length_words(),
        }
    }

    fn write_to(&self, buf: &mut [u8]) -> usize {
        match self {
            Rtcp::SenderReport(v) => v.write_to(buf),
            Rtcp::ReceiverReport(v) => v.write_to(buf),
            Rtcp::CongestionControlFeedback(v) => v.write_to(buf),
        }
    }
}

impl<'a> TryFrom<&'a [u8]> for Rtcp {
    type Error = &'static str;

    /// Parse a single RTCP packet with padding already removed.
    fn try_from(buf: &'a [u8]) -> Result<Self, Self::Error> {
        let header: RtcpHeader = buf.try_into()?;

        // All sub parsers go until they exhaust the buffer, which must be
        // exactly the declared body.
        let buf = &buf[LEN_HEADER..];
        let count = header.count_or_format() as usize;

        Ok(match header.rtcp_type() {
            RtcpType::SenderReport => Rtcp::SenderReport(SenderReport::parse(buf, count)?),
            RtcpType::ReceiverReport => Rtcp::ReceiverReport(ReceiverReport::parse(buf, count)?),
            RtcpType::TransportLayerFeedback => {
                if header.count_or_format() != FMT_CCFB {
                    return Err("Unsupported transport layer feedback FMT");
                }
                Rtcp::CongestionControlFeedback(buf.try_into()?)
            }
        })
    }
}

impl WordSized for Ssrc {
    fn word_size(&self) -> usize {
        1
    }
}

/// Big endian word at byte offset `at`. Callers check the length first.
fn word(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn put_word(buf: &mut [u8], at: usize, v: u32) {
    buf[at..at + 4].copy_from_slice(&v.to_be_bytes());
}

#[cfg(test)]
mod test {
    use std::time::{Duration, Instant};

    use super::*;

    fn sr(ssrc: u32, ntp_time: Instant) -> Rtcp {
        Rtcp::SenderReport(SenderReport {
            sender_info: SenderInfo {
                ssrc: ssrc.into(),
                ntp_time,
                rtp_time: 4,
                sender_packet_count: 5,
                sender_octet_count: 6,
            },
            reports: report(ssrc + 100).into(),
        })
    }

    fn rr(ssrc: u32) -> Rtcp {
        Rtcp::ReceiverReport(ReceiverReport {
            sender_ssrc: 0.into(),
            reports: report(ssrc).into(),
        })
    }

    fn report(ssrc: u32) -> ReceptionReport {
        ReceptionReport {
            ssrc: ssrc.into(),
            fraction_lost: 3,
            packets_lost: 1234,
            max_seq: 4000,
            jitter: 5,
            last_sr_time: 12,
            last_sr_delay: 1,
        }
    }

    fn ccfb() -> Rtcp {
        Rtcp::CongestionControlFeedback(CongestionControlFeedback {
            sender_ssrc: 7.into(),
            blocks: vec![FeedbackBlock {
                ssrc: 8.into(),
                begin_seq: 100,
                reports: vec![
                    // Multiples of 1/64 s survive the 1/1024 s resolution exactly.
                    PacketReport::received(Duration::from_micros(31_250)),
                    PacketReport::received(Duration::from_micros(15_625)),
                ],
            }],
            report_timestamp: 42,
        })
    }

    #[test]
    fn pack_sr_4_rr() {
        let now = Instant::now();
        let mut queue = VecDeque::new();
        queue.push_back(rr(3));
        queue.push_back(rr(4));
        queue.push_back(rr(5));
        queue.push_back(sr(1, now));

        Rtcp::pack(&mut queue, 350);

        assert_eq!(queue.len(), 1);

        let Some(Rtcp::SenderReport(sr)) = queue.pop_front() else {
            panic!("Expected SenderReport");
        };

        assert_eq!(sr.reports.len(), 4);
        assert_eq!(*sr.reports[0].ssrc, 101);
        assert_eq!(*sr.reports[3].ssrc, 5);
    }

    #[test]
    fn pack_limited_by_capacity() {
        let mut queue = VecDeque::new();
        queue.push_back(rr(3));
        queue.push_back(rr(4));
        queue.push_back(rr(5));

        // One RR with 2 blocks is 14 words.
        Rtcp::pack(&mut queue, 14);

        assert_eq!(queue.len(), 2);
        assert_eq!(queue[0].length_words(), 14);
    }

    #[test]
    fn compound_round_trip() {
        let now = Instant::now();
        let mut queue = VecDeque::new();
        queue.push_back(ccfb());
        queue.push_back(rr(3));
        queue.push_back(sr(1, now));

        let mut buf = vec![0; 1200];
        let n = Rtcp::write_packet(&mut queue, &mut buf);
        buf.truncate(n);
        assert!(queue.is_empty());

        let parsed = Rtcp::parse(&buf).unwrap();
        assert_eq!(parsed.len(), 2);

        let Rtcp::SenderReport(sr) = &parsed[0] else {
            panic!("Expected SenderReport");
        };
        assert_eq!(sr.reports.len(), 2);
        assert_eq!(sr.reports[1], report(3));
        assert_eq!(parsed[1], ccfb());
    }

    #[test]
    fn parse_short_header_is_malformed() {
        assert_eq!(
            Rtcp::parse(&[0x80, 200, 0]),
            Err(Error::Malformed("Less than 4 bytes for RTCP header"))
        );
    }

    #[test]
    fn parse_count_mismatch_is_malformed() {
        // RR saying 1 report block, but only the sender SSRC present.
        let buf = [0x81, 201, 0, 1, 0, 0, 0, 1];
        assert!(matches!(Rtcp::parse(&buf), Err(Error::Malformed(_))));

        // RR with trailing bytes after its single block.
        let mut rr = rr(9).to_vec();
        rr[3] += 1;
        rr.extend_from_slice(&[0, 0, 0, 0]);
        assert!(matches!(Rtcp::parse(&rr), Err(Error::Malformed(_))));
    }

    #[test]
    fn parse_declared_length_exceeds_buffer() {
        let mut buf = rr(9).to_vec();
        buf.truncate(20);
        assert!(matches!(Rtcp::parse(&buf), Err(Error::Truncated { .. })));
    }

    #[test]
    fn parse_unknown_type_is_malformed() {
        let buf = [0x80, 204, 0, 1, 0, 0, 0, 1];
        assert!(matches!(Rtcp::parse(&buf), Err(Error::Malformed(_))));
    }

    #[test]
    fn read_packet_keeps_good_packets() {
        let mut buf = rr(3).to_vec();
        // An APP packet we don't understand.
        buf.extend_from_slice(&[0x80, 204, 0, 1, 0, 0, 0, 1]);
        buf.extend_from_slice(&ccfb().to_vec());

        let mut queue = VecDeque::new();
        Rtcp::read_packet(&buf, &mut queue);

        assert_eq!(queue.len(), 2);
        assert_eq!(queue[0], rr(3));
        assert_eq!(queue[1], ccfb());
    }

    #[test]
    fn parse_with_padding() {
        let mut buf = rr(3).to_vec();
        // set padding bit, add 4 bytes padding and bump length.
        buf[0] |= 0b00_1_00000;
        buf[3] += 1;
        buf.extend_from_slice(&[0, 0, 0, 4]);

        let parsed = Rtcp::parse(&buf).unwrap();
        assert_eq!(parsed, vec![rr(3)]);
    }

    #[test]
    fn sr_ntp_time_survives() {
        let now = Instant::now();
        let buf = sr(1, now).to_vec();
        let parsed = Rtcp::parse(&buf).unwrap();
        let Rtcp::SenderReport(sr) = &parsed[0] else {
            panic!("Expected SenderReport");
        };
        let diff = if sr.sender_info.ntp_time > now {
            sr.sender_info.ntp_time - now
        } else {
            now - sr.sender_info.ntp_time
        };
        assert!(diff < Duration::from_millis(1));
    }
}

use std::time::Duration;

use super::header::FMT_CCFB;
use super::{RtcpHeader, RtcpPacket, RtcpType, Ssrc};

/// Max reports in a single block. Sequence ranges longer than this are split.
pub const MAX_REPORTS_PER_BLOCK: usize = 16384;

// Arrival time offsets are 13 bit in 1/1024 s.
const ATO_OVERRANGE: u16 = 0x1FFE;
const ATO_UNAVAILABLE: u16 = 0x1FFF;

/// RTP Control Protocol (RTCP) Feedback for Congestion Control.
///
/// See [RFC 8888](https://www.rfc-editor.org/rfc/rfc8888)
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P| FMT=11  |   PT = 205    |          length               |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                 SSRC of RTCP packet sender                    |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                   SSRC of 1st RTP Stream                      |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |          begin_seq            |          num_reports          |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |R|ECN|  Arrival time offset    | ...                           .
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// .                                                               .
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                 Report Timestamp (32 bits)                    |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CongestionControlFeedback {
    /// Sender of the feedback.
    pub sender_ssrc: Ssrc,
    /// One block per reported media stream.
    pub blocks: Vec<FeedbackBlock>,
    /// Compact NTP (middle 32 bits) of when the report was created.
    pub report_timestamp: u32,
}

/// Reports for a consecutive sequence number range of one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedbackBlock {
    /// The media stream.
    pub ssrc: Ssrc,
    /// Sequence number of the first report.
    pub begin_seq: u16,
    /// One report per sequence number starting at `begin_seq`.
    pub reports: Vec<PacketReport>,
}

/// Report for a single RTP packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketReport {
    /// Whether the packet was received.
    pub received: bool,
    /// ECN bits as received.
    pub ecn: u8,
    /// How long before the report timestamp the packet arrived.
    ///
    /// `None` for lost packets, and for received packets where the offset is
    /// unavailable or too large to be represented.
    pub arrival_time_offset: Option<Duration>,
}

impl PacketReport {
    /// Report for a packet that was not received.
    pub fn lost() -> Self {
        PacketReport {
            received: false,
            ecn: 0,
            arrival_time_offset: None,
        }
    }

    /// Report for a received packet.
    pub fn received(arrival_time_offset: Duration) -> Self {
        PacketReport {
            received: true,
            ecn: 0,
            arrival_time_offset: Some(arrival_time_offset),
        }
    }

    fn to_u16(self) -> u16 {
        if !self.received {
            return 0;
        }

        let ato = match self.arrival_time_offset {
            Some(d) => {
                let units = d.as_micros() * 1024 / 1_000_000;
                (units.min(ATO_OVERRANGE as u128)) as u16
            }
            None => ATO_UNAVAILABLE,
        };

        0x8000 | ((self.ecn as u16 & 0b11) << 13) | ato
    }

    fn from_u16(v: u16) -> Self {
        let received = v & 0x8000 > 0;
        if !received {
            return Self::lost();
        }

        let ecn = ((v >> 13) & 0b11) as u8;
        let ato = v & 0x1FFF;

        let arrival_time_offset = if ato >= ATO_OVERRANGE {
            None
        } else {
            Some(Duration::from_micros(ato as u64 * 1_000_000 / 1024))
        };

        PacketReport {
            received,
            ecn,
            arrival_time_offset,
        }
    }
}

impl FeedbackBlock {
    fn length_words(&self) -> usize {
        // ssrc, begin_seq/num_reports, reports padded to 32 bits.
        2 + (self.reports.len() + 1) / 2
    }
}

impl RtcpPacket for CongestionControlFeedback {
    fn header(&self) -> RtcpHeader {
        RtcpHeader {
            rtcp_type: RtcpType::TransportLayerFeedback,
            has_padding: false,
            count_or_format: FMT_CCFB,
            words_less_one: (self.length_words() - 1) as u16,
        }
    }

    fn length_words(&self) -> usize {
        // header, sender ssrc, blocks, report timestamp
        1 + 1 + self.blocks.iter().map(|b| b.length_words()).sum::<usize>() + 1
    }

    fn write_to(&self, buf: &mut [u8]) -> usize {
        self.header().write_to(buf);
        buf[4..8].copy_from_slice(&self.sender_ssrc.to_be_bytes());

        let mut pos = 8;
        for block in &self.blocks {
            buf[pos..pos + 4].copy_from_slice(&block.ssrc.to_be_bytes());
            buf[pos + 4..pos + 6].copy_from_slice(&block.begin_seq.to_be_bytes());
            buf[pos + 6..pos + 8].copy_from_slice(&(block.reports.len() as u16).to_be_bytes());
            pos += 8;

            for r in &block.reports {
                buf[pos..pos + 2].copy_from_slice(&r.to_u16().to_be_bytes());
                pos += 2;
            }

            if block.reports.len() % 2 == 1 {
                buf[pos..pos + 2].copy_from_slice(&[0, 0]);
                pos += 2;
            }
        }

        buf[pos..pos + 4].copy_from_slice(&self.report_timestamp.to_be_bytes());
        pos += 4;

        debug_assert_eq!(pos, self.length_words() * 4);

        pos
    }
}

impl<'a> TryFrom<&'a [u8]> for CongestionControlFeedback {
    type Error = &'static str;

    fn try_from(buf: &'a [u8]) -> Result<Self, Self::Error> {
        // sender ssrc + report timestamp
        if buf.len() < 8 {
            return Err("Less than 8 bytes for CongestionControlFeedback");
        }

        let sender_ssrc = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]).into();

        let ts_pos = buf.len() - 4;
        let report_timestamp = u32::from_be_bytes([
            buf[ts_pos],
            buf[ts_pos + 1],
            buf[ts_pos + 2],
            buf[ts_pos + 3],
        ]);

        let mut blocks = vec![];
        let mut b = &buf[4..ts_pos];

        while !b.is_empty() {
            if b.len() < 8 {
                return Err("Less than 8 bytes for CCFB block");
            }

            let ssrc = u32::from_be_bytes([b[0], b[1], b[2], b[3]]).into();
            let begin_seq = u16::from_be_bytes([b[4], b[5]]);
            let num_reports = u16::from_be_bytes([b[6], b[7]]) as usize;

            if num_reports > MAX_REPORTS_PER_BLOCK {
                return Err("Too many reports in CCFB block");
            }

            let report_len = num_reports * 2;
            let padded_len = (report_len + 3) / 4 * 4;
            if b.len() < 8 + padded_len {
                return Err("CCFB block exceeds packet length");
            }

            let reports = b[8..8 + report_len]
                .chunks_exact(2)
                .map(|c| PacketReport::from_u16(u16::from_be_bytes([c[0], c[1]])))
                .collect();

            blocks.push(FeedbackBlock {
                ssrc,
                begin_seq,
                reports,
            });

            b = &b[8 + padded_len..];
        }

        Ok(CongestionControlFeedback {
            sender_ssrc,
            blocks,
            report_timestamp,
        })
    }
}

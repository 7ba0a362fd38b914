use std::time::Instant;

use crate::util::InstantExt;

use super::{put_word, word};
use super::{ReceptionReport, ReportList, RtcpHeader, RtcpPacket, RtcpType, Ssrc};

/// A report of packets sent.
///
/// Carries the NTP to RTP time mapping of the sender. The receiver echoes the middle bits of
/// the NTP time back in its reports, which gives the sender a round trip time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderReport {
    /// The sender side of the report.
    pub sender_info: SenderInfo,
    /// Reception report blocks, same as in a receiver report.
    pub reports: ReportList<ReceptionReport>,
}

/// What the sender says about its own stream.
///
/// See [RFC 3550 6.4.1](https://www.rfc-editor.org/rfc/rfc3550#section-6.4.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenderInfo {
    /// Stream being reported.
    pub ssrc: Ssrc,
    /// Wallclock time of the report.
    pub ntp_time: Instant,
    /// RTP time at `ntp_time`.
    pub rtp_time: u32,
    /// Packets sent since the start of the stream. Wraps.
    pub sender_packet_count: u32,
    /// Payload bytes sent since the start of the stream. Wraps.
    pub sender_octet_count: u32,
}

impl SenderInfo {
    const WORDS: usize = 6;

    fn read(buf: &[u8]) -> Result<Self, &'static str> {
        if buf.len() < Self::WORDS * 4 {
            return Err("Sender info shorter than 24 bytes");
        }

        let ntp = (word(buf, 4) as u64) << 32 | word(buf, 8) as u64;

        Ok(SenderInfo {
            ssrc: word(buf, 0).into(),
            ntp_time: Instant::from_ntp_64(ntp),
            rtp_time: word(buf, 12),
            sender_packet_count: word(buf, 16),
            sender_octet_count: word(buf, 20),
        })
    }

    fn write(&self, buf: &mut [u8]) {
        let ntp = self.ntp_time.as_ntp_64();

        put_word(buf, 0, *self.ssrc);
        put_word(buf, 4, (ntp >> 32) as u32);
        put_word(buf, 8, ntp as u32);
        put_word(buf, 12, self.rtp_time);
        put_word(buf, 16, self.sender_packet_count);
        put_word(buf, 20, self.sender_octet_count);
    }
}

impl SenderReport {
    pub(crate) fn parse(buf: &[u8], count: usize) -> Result<Self, &'static str> {
        let sender_info = SenderInfo::read(buf)?;
        let reports = ReceptionReport::parse_blocks(&buf[SenderInfo::WORDS * 4..], count)?;

        Ok(SenderReport {
            sender_info,
            reports,
        })
    }
}

impl RtcpPacket for SenderReport {
    fn header(&self) -> RtcpHeader {
        RtcpHeader {
            rtcp_type: RtcpType::SenderReport,
            has_padding: false,
            count_or_format: self.reports.len() as u8,
            words_less_one: (self.length_words() - 1) as u16,
        }
    }

    fn length_words(&self) -> usize {
        1 + SenderInfo::WORDS + ReceptionReport::WORDS * self.reports.len()
    }

    fn write_to(&self, buf: &mut [u8]) -> usize {
        let mut at = self.header().write_to(buf);

        self.sender_info.write(&mut buf[at..]);
        at += SenderInfo::WORDS * 4;

        for r in self.reports.iter() {
            r.write_to(&mut buf[at..]);
            at += ReceptionReport::WORDS * 4;
        }

        at
    }
}

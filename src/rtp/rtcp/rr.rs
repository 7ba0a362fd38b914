use super::list::WordSized;
use super::{put_word, word};
use super::{ReportList, RtcpHeader, RtcpPacket, RtcpType, Ssrc};

/// A receiver report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverReport {
    /// Sender of this feedback.
    pub sender_ssrc: Ssrc,
    /// One block per received stream.
    pub reports: ReportList<ReceptionReport>,
}

/// Reception quality of one stream.
///
/// See [RFC 3550 6.4.1](https://www.rfc-editor.org/rfc/rfc3550#section-6.4.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceptionReport {
    /// The reported stream.
    pub ssrc: Ssrc,
    /// Fraction lost since the previous report, in 1/256.
    pub fraction_lost: u8,
    /// Cumulative number of packets lost. Only 24 bits go on the wire.
    pub packets_lost: u32,
    /// Extended highest sequence number received.
    pub max_seq: u32,
    /// Interarrival jitter in RTP timestamp units.
    pub jitter: u32,
    /// Middle 32 bits of the NTP time of the last SR received (LSR). 0 for none.
    pub last_sr_time: u32,
    /// Delay since the last SR in 1/65536 s (DLSR).
    pub last_sr_delay: u32,
}

impl ReceptionReport {
    pub(crate) const WORDS: usize = 6;

    pub(crate) fn write_to(&self, buf: &mut [u8]) {
        let lost = (self.fraction_lost as u32) << 24 | (self.packets_lost & 0x00ff_ffff);

        put_word(buf, 0, *self.ssrc);
        put_word(buf, 4, lost);
        put_word(buf, 8, self.max_seq);
        put_word(buf, 12, self.jitter);
        put_word(buf, 16, self.last_sr_time);
        put_word(buf, 20, self.last_sr_delay);
    }

    fn read(buf: &[u8]) -> Self {
        let lost = word(buf, 4);

        ReceptionReport {
            ssrc: word(buf, 0).into(),
            fraction_lost: (lost >> 24) as u8,
            packets_lost: lost & 0x00ff_ffff,
            max_seq: word(buf, 8),
            jitter: word(buf, 12),
            last_sr_time: word(buf, 16),
            last_sr_delay: word(buf, 20),
        }
    }

    /// Parse `count` report blocks that must exactly fill `buf`.
    pub(crate) fn parse_blocks(
        buf: &[u8],
        count: usize,
    ) -> Result<ReportList<ReceptionReport>, &'static str> {
        let block_len = Self::WORDS * 4;

        if buf.len() != count * block_len {
            return Err("Report block count does not match length");
        }

        let mut reports = ReportList::new();

        for block in buf.chunks_exact(block_len) {
            reports
                .push(Self::read(block))
                .map_err(|_| "More than 31 report blocks")?;
        }

        Ok(reports)
    }
}

impl WordSized for ReceptionReport {
    fn word_size(&self) -> usize {
        Self::WORDS
    }
}

impl ReceiverReport {
    pub(crate) fn parse(buf: &[u8], count: usize) -> Result<Self, &'static str> {
        if buf.len() < 4 {
            return Err("Receiver report without sender SSRC");
        }

        Ok(ReceiverReport {
            sender_ssrc: word(buf, 0).into(),
            reports: ReceptionReport::parse_blocks(&buf[4..], count)?,
        })
    }
}

impl RtcpPacket for ReceiverReport {
    fn header(&self) -> RtcpHeader {
        RtcpHeader {
            rtcp_type: RtcpType::ReceiverReport,
            has_padding: false,
            count_or_format: self.reports.len() as u8,
            words_less_one: (self.length_words() - 1) as u16,
        }
    }

    fn length_words(&self) -> usize {
        // header, sender SSRC and the blocks.
        2 + ReceptionReport::WORDS * self.reports.len()
    }

    fn write_to(&self, buf: &mut [u8]) -> usize {
        let mut at = self.header().write_to(buf);

        put_word(buf, at, *self.sender_ssrc);
        at += 4;

        for r in self.reports.iter() {
            r.write_to(&mut buf[at..]);
            at += ReceptionReport::WORDS * 4;
        }

        at
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn loss_word_packs_fraction_and_count() {
        let report = ReceptionReport {
            ssrc: 9.into(),
            fraction_lost: 0x40,
            // Above 24 bits, truncated on the wire.
            packets_lost: 0x0100_0005,
            max_seq: 70_000,
            jitter: 12,
            last_sr_time: 0,
            last_sr_delay: 0,
        };

        let mut buf = [0; 24];
        report.write_to(&mut buf);
        assert_eq!(&buf[4..8], &[0x40, 0, 0, 5]);

        let read = ReceptionReport::read(&buf);
        assert_eq!(read.fraction_lost, 0x40);
        assert_eq!(read.packets_lost, 5);
        assert_eq!(read.max_seq, 70_000);
    }

    #[test]
    fn partial_block_is_rejected() {
        assert!(ReceptionReport::parse_blocks(&[0; 30], 1).is_err());
        assert_eq!(ReceptionReport::parse_blocks(&[], 0).unwrap().len(), 0);
    }
}

pub(crate) const LEN_HEADER: usize = 4;

/// Feedback message type of RFC 8888 congestion control feedback.
pub(crate) const FMT_CCFB: u8 = 11;

/// The common 4 byte header of every RTCP packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtcpHeader {
    pub(crate) rtcp_type: RtcpType,
    pub(crate) has_padding: bool,
    pub(crate) count_or_format: u8,
    pub(crate) words_less_one: u16,
}

impl RtcpHeader {
    /// Type of RTCP packet.
    pub fn rtcp_type(&self) -> RtcpType {
        self.rtcp_type
    }

    /// Report count for SR/RR, feedback message type (FMT) for feedback packets.
    pub fn count_or_format(&self) -> u8 {
        self.count_or_format
    }

    /// Whether the packet ends with padding.
    pub fn has_padding(&self) -> bool {
        self.has_padding
    }

    /// Length of entire RTCP packet (including header) in words (4 bytes).
    pub fn length_words(&self) -> usize {
        self.words_less_one as usize + 1
    }

    /// Length of entire RTCP packet (including header) in bytes.
    pub fn length_bytes(&self) -> usize {
        self.length_words() * 4
    }

    pub(crate) fn write_to(&self, buf: &mut [u8]) -> usize {
        buf[0] = 0b10_0_00000
            | if self.has_padding { 0b00_1_00000 } else { 0 }
            | (self.count_or_format & 0b000_11111);
        buf[1] = self.rtcp_type as u8;
        buf[2..4].copy_from_slice(&self.words_less_one.to_be_bytes());
        LEN_HEADER
    }
}

/// Kind of RTCP packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtcpType {
    /// RTCP_PT_SR
    SenderReport = 200,

    /// RTCP_PT_RR
    ReceiverReport = 201,

    /// RTCP_PT_RTPFB
    // https://tools.ietf.org/html/rfc4585
    TransportLayerFeedback = 205,
}

impl TryFrom<u8> for RtcpType {
    type Error = &'static str;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        use RtcpType::*;
        match v {
            200 => Ok(SenderReport),
            201 => Ok(ReceiverReport),
            205 => Ok(TransportLayerFeedback),
            _ => {
                trace!("Unrecognized RTCP type: {}", v);
                Err("Unrecognized RTCP type")
            }
        }
    }
}

impl<'a> TryFrom<&'a [u8]> for RtcpHeader {
    type Error = &'static str;

    fn try_from(buf: &'a [u8]) -> Result<Self, Self::Error> {
        if buf.len() < LEN_HEADER {
            return Err("Less than 4 bytes for RTCP header");
        }

        let version = (buf[0] & 0b11_0_00000) >> 6;
        if version != 2 {
            return Err("RTCP version is not 2");
        }

        let has_padding = buf[0] & 0b00_1_00000 > 0;
        let count_or_format = buf[0] & 0b000_11111;
        let rtcp_type = buf[1].try_into()?;
        let words_less_one = u16::from_be_bytes([buf[2], buf[3]]);

        Ok(RtcpHeader {
            rtcp_type,
            has_padding,
            count_or_format,
            words_less_one,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn header_round_trip() {
        let header = RtcpHeader {
            rtcp_type: RtcpType::TransportLayerFeedback,
            has_padding: false,
            count_or_format: FMT_CCFB,
            words_less_one: 5,
        };
        let mut buf = [0_u8; 4];
        header.write_to(&mut buf);
        assert_eq!(buf, [0x8b, 205, 0, 5]);

        let parsed: RtcpHeader = buf.as_slice().try_into().unwrap();
        assert_eq!(parsed, header);
        assert_eq!(parsed.length_bytes(), 24);
    }

    #[test]
    fn header_errors() {
        assert!(RtcpHeader::try_from(&[0x80, 200, 0][..]).is_err());
        assert!(RtcpHeader::try_from(&[0x40, 200, 0, 1][..]).is_err());
        assert!(RtcpHeader::try_from(&[0x80, 202, 0, 1][..]).is_err());
    }
}

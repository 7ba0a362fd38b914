#![allow(clippy::unusual_byte_groupings)]

use crate::Error;

use super::ext::{ExtensionMap, ExtensionValues, ONE_BYTE_PROFILE};
use super::{Pt, SeqNo, Ssrc};

/// Largest padding that fits in a single packet. The pad length is one byte.
pub const MAX_PADDING_PER_PACKET: usize = 255;

/// Parsed header from an RTP packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpHeader {
    /// Always 2
    pub version: u8,
    /// Whether the payload is followed by padding.
    pub has_padding: bool,
    /// RTP packet has "RTP header extensions".
    pub has_extension: bool,
    /// For video, this marker signifies the end of a series of packets that
    /// together form a single video frame.
    pub marker: bool,
    /// Type of payload being carried.
    pub payload_type: Pt,
    /// Sequence number increasing by 1 for each RTP packet.
    pub sequence_number: u16,
    /// Timestamp in media time for the RTP packet.
    pub timestamp: u32,
    /// Sender source identifier.
    pub ssrc: Ssrc,
    /// Contributing sources, at most 15.
    pub csrc: Vec<u32>,
    /// The extension values parsed using the extension map.
    pub ext_vals: ExtensionValues,
    /// Length of header.
    pub header_len: usize,
}

impl RtpHeader {
    /// Number of bytes [`RtpHeader::write_to`] will produce.
    pub fn serialized_len(&self, exts: &ExtensionMap) -> usize {
        let base = 12 + 4 * self.csrc.len().min(15);
        let ext_len = exts.values_len(&self.ext_vals);
        if ext_len == 0 {
            base
        } else {
            base + 4 + (ext_len + 3) / 4 * 4
        }
    }

    /// Write the header to `buf`. The buffer must hold at least
    /// [`RtpHeader::serialized_len`] bytes.
    pub fn write_to(&self, buf: &mut [u8], exts: &ExtensionMap) -> usize {
        let csrc_count = self.csrc.len().min(15);
        let ext_len = exts.values_len(&self.ext_vals);
        let has_extension = ext_len > 0;

        buf[0] = 0b10_0_0_0000
            | if self.has_padding { 1 << 5 } else { 0 }
            | if has_extension { 1 << 4 } else { 0 }
            | csrc_count as u8;

        assert!(*self.payload_type <= 127);
        buf[1] = *self.payload_type & 0b0111_1111 | if self.marker { 1 << 7 } else { 0 };

        buf[2..4].copy_from_slice(&self.sequence_number.to_be_bytes());
        buf[4..8].copy_from_slice(&self.timestamp.to_be_bytes());
        buf[8..12].copy_from_slice(&self.ssrc.to_be_bytes());

        let mut pos = 12;
        for c in self.csrc.iter().take(csrc_count) {
            buf[pos..pos + 4].copy_from_slice(&c.to_be_bytes());
            pos += 4;
        }

        if !has_extension {
            return pos;
        }

        buf[pos..pos + 2].copy_from_slice(&ONE_BYTE_PROFILE.to_be_bytes());

        let ext_buf = &mut buf[pos + 4..];
        let mut ext_len = exts.write_to(ext_buf, &self.ext_vals);

        let pad = 4 - ext_len % 4;
        if pad < 4 {
            ext_len += pad;
            for i in 0..pad {
                ext_buf[ext_len - i - 1] = 0;
            }
        }

        let words = (ext_len / 4) as u16;
        buf[pos + 2..pos + 4].copy_from_slice(&words.to_be_bytes());

        pos + 4 + ext_len
    }

    /// Parse a header. Unknown extension profiles are skipped, not rejected.
    pub fn parse(buf: &[u8], exts: &ExtensionMap) -> Result<RtpHeader, Error> {
        let orig_len = buf.len();
        Error::check_len(buf, 12)?;

        let version = (buf[0] & 0b1100_0000) >> 6;
        if version != 2 {
            return Err(Error::Malformed("RTP version is not 2"));
        }
        let has_padding = buf[0] & 0b0010_0000 > 0;
        let has_extension = buf[0] & 0b0001_0000 > 0;
        let csrc_count = (buf[0] & 0b0000_1111) as usize;
        let marker = buf[1] & 0b1000_0000 > 0;
        let payload_type = (buf[1] & 0b0111_1111).into();
        let sequence_number = u16::from_be_bytes([buf[2], buf[3]]);

        let timestamp = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);

        let ssrc = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);

        let buf: &[u8] = &buf[12..];

        let csrc_len = 4 * csrc_count;
        if buf.len() < csrc_len {
            return Err(Error::Truncated {
                needed: 12 + csrc_len,
                available: orig_len,
            });
        }

        let csrc = buf[..csrc_len]
            .chunks_exact(4)
            .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        let buf: &[u8] = &buf[csrc_len..];

        let mut ext_vals = ExtensionValues::default();

        let rest = if !has_extension {
            buf
        } else {
            Error::check_len(buf, 4)
                .map_err(|_| Error::Malformed("RTP header extension exceeds packet"))?;

            let profile = u16::from_be_bytes([buf[0], buf[1]]);
            let ext_words = u16::from_be_bytes([buf[2], buf[3]]);
            let ext_len = ext_words as usize * 4;

            let buf: &[u8] = &buf[4..];

            if buf.len() < ext_len {
                return Err(Error::Malformed("RTP header extension exceeds packet"));
            }

            if profile == ONE_BYTE_PROFILE {
                exts.parse(&buf[..ext_len], &mut ext_vals);
            } else {
                trace!("Ignoring unknown RTP header extension profile: {:x}", profile);
            }

            &buf[ext_len..]
        };

        let header_len = orig_len - rest.len();

        Ok(RtpHeader {
            version,
            has_padding,
            has_extension,
            marker,
            payload_type,
            sequence_number,
            timestamp,
            ssrc: ssrc.into(),
            csrc,
            ext_vals,
            header_len,
        })
    }

    /// Sequence number of this RTP header given the previous extended number.
    pub fn sequence_number(&self, previous: Option<SeqNo>) -> SeqNo {
        extend_u16(previous.map(|v| *v), self.sequence_number).into()
    }
}

impl Default for RtpHeader {
    fn default() -> Self {
        Self {
            version: 2,
            has_padding: false,
            has_extension: false,
            marker: false,
            payload_type: 96.into(),
            sequence_number: 0,
            timestamp: 0,
            ssrc: 0.into(),
            csrc: vec![],
            ext_vals: ExtensionValues::default(),
            header_len: 12,
        }
    }
}

/// An RTP packet with the padding removed from its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    /// The header.
    pub header: RtpHeader,
    /// Payload without padding.
    pub payload: Vec<u8>,
    /// Number of padding bytes, including the trailing count byte.
    pub padding: u8,
}

impl RtpPacket {
    /// Parse a packet, stripping any padding.
    pub fn parse(buf: &[u8], exts: &ExtensionMap) -> Result<RtpPacket, Error> {
        let header = RtpHeader::parse(buf, exts)?;
        let mut payload = &buf[header.header_len..];
        let mut padding = 0;

        if header.has_padding {
            let Some(&pad_len) = payload.last() else {
                return Err(Error::Malformed("RTP padding bit without padding"));
            };
            if pad_len == 0 || pad_len as usize > payload.len() {
                return Err(Error::Malformed("RTP padding length exceeds payload"));
            }
            payload = &payload[..payload.len() - pad_len as usize];
            padding = pad_len;
        }

        Ok(RtpPacket {
            header,
            payload: payload.to_vec(),
            padding,
        })
    }

    /// Whether the packet carries nothing but padding.
    pub fn is_padding(&self) -> bool {
        self.payload.is_empty() && self.padding > 0
    }

    /// Serialize the packet including header, payload and padding.
    pub fn to_vec(&self, exts: &ExtensionMap) -> Vec<u8> {
        let mut header = self.header.clone();
        header.has_padding = self.padding > 0;

        let header_len = header.serialized_len(exts);
        let total = header_len + self.payload.len() + self.padding as usize;
        let mut buf = vec![0_u8; total];

        let n = header.write_to(&mut buf, exts);
        debug_assert_eq!(n, header_len);

        buf[n..n + self.payload.len()].copy_from_slice(&self.payload);

        if self.padding > 0 {
            buf[total - 1] = self.padding;
        }

        buf
    }
}

macro_rules! mk_extend {
    ($id:ident, $t:ty, $bits:expr) => {
        /// "extend" a less than 64 bit sequence number into a 64 bit by
        /// using the knowledge of the previous such sequence number.
        ///
        /// The result is the candidate nearest to `prev_ext_seq`, forward or backward up
        /// to half the number space. Going backwards past zero saturates at zero.
        pub fn $id(prev_ext_seq: Option<u64>, seq: $t) -> u64 {
            const MAX: u64 = 2_u64.pow($bits);
            const HALF: u64 = MAX / 2;
            const VAL_MASK: u64 = MAX - 1;

            let seq = seq as u64 & VAL_MASK;

            let Some(prev_index) = prev_ext_seq else {
                // No wrap-around so far.
                return seq;
            };

            let prev_seq = prev_index & VAL_MASK;
            let forward = seq.wrapping_sub(prev_seq) & VAL_MASK;

            if forward <= HALF {
                prev_index + forward
            } else {
                let backward = MAX - forward;
                prev_index.saturating_sub(backward)
            }
        }
    };
}

mk_extend!(extend_u16, u16, 16);
mk_extend!(extend_u32, u32, 32);

/// Where a receiver places the first sequence number it sees.
///
/// One cycle in, so that packets reordered ahead of the first one extend below it
/// instead of saturating at zero.
pub(crate) const RECV_SEQ_BASE: u64 = 1 << 16;

/// [`extend_u16`] for received sequence numbers, starting at [`RECV_SEQ_BASE`].
pub(crate) fn extend_recv_u16(prev_ext_seq: Option<u64>, seq: u16) -> u64 {
    match prev_ext_seq {
        None => RECV_SEQ_BASE + seq as u64,
        Some(_) => extend_u16(prev_ext_seq, seq),
    }
}

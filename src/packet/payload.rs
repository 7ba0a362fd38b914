use std::time::Instant;

use super::{Codec, CodecPacketizer, Packetizer};
use crate::rtp::{ExtensionValues, Pt, RtpHeader, RtpPacket, SeqNo, Ssrc};
use crate::rtp::MAX_PADDING_PER_PACKET;
use crate::Error;

/// Turns frames into RTP packets of one stream.
///
/// Sequence numbers are consecutive across frames and padding packets.
#[derive(Debug)]
pub struct RtpPacketizer {
    ssrc: Ssrc,
    pt: Pt,
    codec: Codec,
    pack: CodecPacketizer,
    max_payload_size: usize,
    seq_no: SeqNo,
    last_rtp_time: u32,
}

impl RtpPacketizer {
    /// Create a packetizer starting at a random sequence number.
    pub fn new(ssrc: Ssrc, pt: Pt, codec: Codec, max_payload_size: usize) -> Self {
        RtpPacketizer {
            ssrc,
            pt,
            codec,
            pack: codec.into(),
            max_payload_size,
            seq_no: (fastrand::u16(..) as u64).into(),
            last_rtp_time: 0,
        }
    }

    /// Set the sequence number of the next packet.
    pub fn with_start_seq(mut self, seq_no: SeqNo) -> Self {
        self.seq_no = seq_no;
        self
    }

    pub fn ssrc(&self) -> Ssrc {
        self.ssrc
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    /// Sequence number the next packet will get.
    pub fn next_seq(&self) -> SeqNo {
        self.seq_no
    }

    /// Packetize one frame.
    ///
    /// All packets share `rtp_time`, and the marker bit is set on the last one.
    pub fn packetize(
        &mut self,
        frame: &[u8],
        rtp_time: u32,
        now: Instant,
    ) -> Result<Vec<RtpPacket>, Error> {
        let payloads = self.pack.packetize(self.max_payload_size, frame)?;
        self.last_rtp_time = rtp_time;

        let count = payloads.len();
        let mut packets = Vec::with_capacity(count);
        let mut previous: Option<Vec<u8>> = None;

        for (i, payload) in payloads.into_iter().enumerate() {
            let last = i == count - 1;
            let marker = self.pack.is_marker(&payload, previous.as_deref(), last);

            let header = self.header(marker, rtp_time, now);
            previous = Some(payload.clone());

            packets.push(RtpPacket {
                header,
                payload,
                padding: 0,
            });
        }

        trace!(
            "Packetized {} bytes into {} packets ssrc: {} ts: {}",
            frame.len(),
            count,
            self.ssrc,
            rtp_time
        );

        Ok(packets)
    }

    /// Create a padding-only packet of (up to) `size` padding bytes.
    ///
    /// Padding takes a sequence number like any media packet, so the
    /// receiver's loss accounting and the congestion control feedback see it.
    pub fn padding(&mut self, size: usize, now: Instant) -> RtpPacket {
        let padding = size.clamp(1, MAX_PADDING_PER_PACKET) as u8;
        let header = self.header(false, self.last_rtp_time, now);

        RtpPacket {
            header,
            payload: vec![],
            padding,
        }
    }

    fn header(&mut self, marker: bool, rtp_time: u32, now: Instant) -> RtpHeader {
        let sequence_number = self.seq_no.as_u16();
        self.seq_no = self.seq_no.next();

        RtpHeader {
            marker,
            payload_type: self.pt,
            sequence_number,
            timestamp: rtp_time,
            ssrc: self.ssrc,
            ext_vals: ExtensionValues::with_abs_send_time(now),
            ..Default::default()
        }
    }
}

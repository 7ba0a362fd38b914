//! Codec specific packetization of frames into RTP payloads and back.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::rtp::Pt;
use crate::Error;

mod av1;
pub use av1::{Av1Depacketizer, Av1Packetizer};

mod generic;
pub use generic::{GenericDepacketizer, GenericPacketizer};

mod h264;
pub use h264::{H264Depacketizer, H264Packetizer};

mod payload;
pub use payload::RtpPacketizer;

mod assembler;
pub use assembler::{AssembledFrame, FrameAssembler};

/// Payload formats the transport can packetize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Codec {
    /// Opaque bytes in fixed size chunks. Used for audio and data.
    Generic,
    /// H.264 Annex-B access units.
    H264,
    /// AV1 temporal units.
    Av1,
}

impl Codec {
    /// Look up the codec of a payload type.
    pub fn for_pt(pt: Pt, map: &HashMap<Pt, Codec>) -> Result<Codec, Error> {
        map.get(&pt).copied().ok_or(Error::UnsupportedCodec(pt))
    }
}

/// Packetizes a frame into RTP payloads.
pub trait Packetizer: fmt::Debug {
    /// Chunk the frame up into payloads of at most `max_payload_size` bytes.
    fn packetize(&mut self, max_payload_size: usize, frame: &[u8]) -> Result<Vec<Vec<u8>>, Error>;

    /// Tell if this is the last packet of a frame.
    fn is_marker(&mut self, data: &[u8], previous: Option<&[u8]>, last: bool) -> bool;
}

/// Codec specific information found while depacketizing.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CodecExtra {
    /// The frame can be decoded without reference to earlier frames.
    pub is_keyframe: bool,
}

/// Depacketizes RTP payloads back into a frame.
pub trait Depacketizer: fmt::Debug {
    /// Size hint for the output of depacketizing packets totaling `packets_size` bytes.
    fn out_size_hint(&self, packets_size: usize) -> Option<usize>;

    /// Unpack one RTP payload into `out`.
    fn depacketize(
        &mut self,
        packet: &[u8],
        out: &mut Vec<u8>,
        extra: &mut CodecExtra,
    ) -> Result<(), Error>;

    /// Checks if the packet is at the beginning of a frame.
    fn is_partition_head(&self, packet: &[u8]) -> bool;

    /// Checks if the packet is at the end of a frame.
    fn is_partition_tail(&self, marker: bool, packet: &[u8]) -> bool;

    /// Checks if the packet begins a frame that decodes without earlier frames.
    ///
    /// The assembler takes such a packet as a frame start even when the packets
    /// before it are lost.
    fn is_keyframe_head(&self, _packet: &[u8]) -> bool {
        false
    }
}

#[derive(Debug)]
pub(crate) enum CodecPacketizer {
    Generic(GenericPacketizer),
    H264(H264Packetizer),
    Av1(Av1Packetizer),
}

#[derive(Debug)]
pub(crate) enum CodecDepacketizer {
    Generic(GenericDepacketizer),
    H264(H264Depacketizer),
    Av1(Av1Depacketizer),
}

impl From<Codec> for CodecPacketizer {
    fn from(c: Codec) -> Self {
        match c {
            Codec::Generic => CodecPacketizer::Generic(GenericPacketizer),
            Codec::H264 => CodecPacketizer::H264(H264Packetizer::default()),
            Codec::Av1 => CodecPacketizer::Av1(Av1Packetizer::default()),
        }
    }
}

impl From<Codec> for CodecDepacketizer {
    fn from(c: Codec) -> Self {
        match c {
            Codec::Generic => CodecDepacketizer::Generic(GenericDepacketizer),
            Codec::H264 => CodecDepacketizer::H264(H264Depacketizer::default()),
            Codec::Av1 => CodecDepacketizer::Av1(Av1Depacketizer::default()),
        }
    }
}

impl Packetizer for CodecPacketizer {
    fn packetize(&mut self, max_payload_size: usize, frame: &[u8]) -> Result<Vec<Vec<u8>>, Error> {
        use CodecPacketizer::*;
        match self {
            Generic(v) => v.packetize(max_payload_size, frame),
            H264(v) => v.packetize(max_payload_size, frame),
            Av1(v) => v.packetize(max_payload_size, frame),
        }
    }

    fn is_marker(&mut self, data: &[u8], previous: Option<&[u8]>, last: bool) -> bool {
        use CodecPacketizer::*;
        match self {
            Generic(v) => v.is_marker(data, previous, last),
            H264(v) => v.is_marker(data, previous, last),
            Av1(v) => v.is_marker(data, previous, last),
        }
    }
}

impl Depacketizer for CodecDepacketizer {
    fn out_size_hint(&self, packets_size: usize) -> Option<usize> {
        use CodecDepacketizer::*;
        match self {
            Generic(v) => v.out_size_hint(packets_size),
            H264(v) => v.out_size_hint(packets_size),
            Av1(v) => v.out_size_hint(packets_size),
        }
    }

    fn depacketize(
        &mut self,
        packet: &[u8],
        out: &mut Vec<u8>,
        extra: &mut CodecExtra,
    ) -> Result<(), Error> {
        use CodecDepacketizer::*;
        match self {
            Generic(v) => v.depacketize(packet, out, extra),
            H264(v) => v.depacketize(packet, out, extra),
            Av1(v) => v.depacketize(packet, out, extra),
        }
    }

    fn is_partition_head(&self, packet: &[u8]) -> bool {
        use CodecDepacketizer::*;
        match self {
            Generic(v) => v.is_partition_head(packet),
            H264(v) => v.is_partition_head(packet),
            Av1(v) => v.is_partition_head(packet),
        }
    }

    fn is_partition_tail(&self, marker: bool, packet: &[u8]) -> bool {
        use CodecDepacketizer::*;
        match self {
            Generic(v) => v.is_partition_tail(marker, packet),
            H264(v) => v.is_partition_tail(marker, packet),
            Av1(v) => v.is_partition_tail(marker, packet),
        }
    }

    fn is_keyframe_head(&self, packet: &[u8]) -> bool {
        use CodecDepacketizer::*;
        match self {
            Generic(v) => v.is_keyframe_head(packet),
            H264(v) => v.is_keyframe_head(packet),
            Av1(v) => v.is_keyframe_head(packet),
        }
    }
}

/// Depacketize all payloads of one frame.
pub(crate) fn depacketize_frame<'a>(
    depack: &mut impl Depacketizer,
    payloads: impl Iterator<Item = &'a [u8]> + Clone,
) -> Result<(Vec<u8>, CodecExtra), Error> {
    let total: usize = payloads.clone().map(|p| p.len()).sum();
    let mut out = Vec::with_capacity(depack.out_size_hint(total).unwrap_or(total));
    let mut extra = CodecExtra::default();

    for p in payloads {
        depack.depacketize(p, &mut out, &mut extra)?;
    }

    Ok((out, extra))
}

#[cfg(test)]
mod test {
    use super::*;

    const MPS: usize = 1200;

    fn round_trip(codec: Codec, frame: &[u8]) -> Vec<u8> {
        let mut pack: CodecPacketizer = codec.into();
        let mut depack: CodecDepacketizer = codec.into();

        let payloads = pack.packetize(MPS, frame).unwrap();
        for p in &payloads {
            assert!(p.len() <= MPS, "{:?} payload {} > {}", codec, p.len(), MPS);
        }

        let (out, _) = depacketize_frame(&mut depack, payloads.iter().map(|p| p.as_slice())).unwrap();
        out
    }

    fn sizes() -> [usize; 6] {
        [0, 1, MPS - 1, MPS, MPS + 1, 10 * MPS]
    }

    fn bytes(n: usize) -> Vec<u8> {
        (0..n).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn generic_round_trip() {
        for n in sizes() {
            let frame = bytes(n);
            assert_eq!(round_trip(Codec::Generic, &frame), frame, "size {n}");
        }
    }

    #[test]
    fn h264_round_trip() {
        for n in sizes() {
            // One Annex-B NAL of n bytes, 0x65 is an IDR slice header.
            let mut frame = vec![];
            if n > 0 {
                frame.extend_from_slice(&[0, 0, 0, 1]);
                frame.push(0x65);
                frame.extend(bytes(n - 1));
            }
            assert_eq!(round_trip(Codec::H264, &frame), frame, "size {n}");
        }
    }

    #[test]
    fn av1_round_trip() {
        for n in sizes() {
            let frame = bytes(n);
            assert_eq!(round_trip(Codec::Av1, &frame), frame, "size {n}");
        }
    }

    #[test]
    fn unknown_pt_is_unsupported() {
        let mut map = HashMap::new();
        map.insert(Pt::from(96), Codec::H264);

        assert_eq!(Codec::for_pt(96.into(), &map), Ok(Codec::H264));
        assert_eq!(
            Codec::for_pt(97.into(), &map),
            Err(Error::UnsupportedCodec(97.into()))
        );
    }

    #[test]
    fn empty_payload_is_truncated() {
        let mut extra = CodecExtra::default();
        let mut out = vec![];

        let mut h264 = H264Depacketizer::default();
        assert!(matches!(
            h264.depacketize(&[], &mut out, &mut extra),
            Err(Error::Truncated { .. })
        ));

        let mut av1 = Av1Depacketizer::default();
        assert!(matches!(
            av1.depacketize(&[], &mut out, &mut extra),
            Err(Error::Truncated { .. })
        ));
    }
}

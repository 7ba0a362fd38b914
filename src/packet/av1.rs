use super::{CodecExtra, Depacketizer, Packetizer};
use crate::Error;

const OBU_EXTENSION_PRESENT_MASK: u8 = 0b0000_0100;
const OBU_SIZE_PRESENT_MASK: u8 = 0b0000_0010;
const OBU_TYPE_MASK: u8 = 0b0111_1000;
const OBU_TYPE_SEQUENCE_HEADER: u8 = 1;

const AGGREGATION_HEADER_SIZE: usize = 1;

// Aggregation header
//
// +-+-+-+-+-+-+-+-+
// |Z|Y| W |N|-|-|-|
// +-+-+-+-+-+-+-+-+
const AGG_Z: u8 = 0b1000_0000;
const AGG_Y: u8 = 0b0100_0000;
const AGG_W_MASK: u8 = 0b0011_0000;
const AGG_N: u8 = 0b0000_1000;

/// Packetizes AV1 RTP packets.
///
/// The whole temporal unit is carried as a single OBU element, which makes
/// W = 1 on every packet and the Z/Y bits track the continuation between
/// packets.
#[derive(Debug, Default)]
pub struct Av1Packetizer;

/// Depacketizes AV1 RTP packets.
#[derive(Debug, Default)]
pub struct Av1Depacketizer;

/// Length of an leb128 value and the value itself.
fn read_leb128(buf: &[u8]) -> Option<(usize, usize)> {
    let mut value = 0_usize;

    for (i, b) in buf.iter().take(8).enumerate() {
        value |= ((b & 0x7f) as usize) << (i * 7);
        if b & 0x80 == 0 {
            return Some((i + 1, value));
        }
    }

    None
}

/// Tell whether the temporal unit starts a coded video sequence.
///
/// Walks the OBU headers looking for a sequence header. Data that does not
/// parse as OBUs is taken to not contain one.
pub(crate) fn has_sequence_header(mut data: &[u8]) -> bool {
    while let Some(&header) = data.first() {
        let obu_type = (header & OBU_TYPE_MASK) >> 3;
        if obu_type == OBU_TYPE_SEQUENCE_HEADER {
            return true;
        }

        let mut pos = 1;
        if header & OBU_EXTENSION_PRESENT_MASK > 0 {
            pos += 1;
        }

        if header & OBU_SIZE_PRESENT_MASK == 0 {
            // Last OBU runs to the end of the data.
            return false;
        }

        let Some((n, size)) = data.get(pos..).and_then(read_leb128) else {
            return false;
        };

        let next = pos + n + size;
        if next > data.len() {
            return false;
        }
        data = &data[next..];
    }

    false
}

impl Packetizer for Av1Packetizer {
    fn packetize(&mut self, mtu: usize, payload: &[u8]) -> Result<Vec<Vec<u8>>, Error> {
        if mtu <= AGGREGATION_HEADER_SIZE {
            return Err(Error::CapacityExceeded(
                "max payload size too small for AV1 aggregation header",
            ));
        }

        // An empty temporal unit is a lone aggregation header, both head and tail.
        if payload.is_empty() {
            return Ok(vec![vec![1 << 4]]);
        }

        let new_sequence = has_sequence_header(payload);
        let chunks: Vec<_> = payload.chunks(mtu - AGGREGATION_HEADER_SIZE).collect();
        let count = chunks.len();

        let payloads = chunks
            .into_iter()
            .enumerate()
            .map(|(i, chunk)| {
                let mut agg = 1 << 4; // W = 1

                if i > 0 {
                    agg |= AGG_Z;
                }
                if i < count - 1 {
                    agg |= AGG_Y;
                }
                if i == 0 && new_sequence {
                    agg |= AGG_N;
                }

                let mut out = Vec::with_capacity(AGGREGATION_HEADER_SIZE + chunk.len());
                out.push(agg);
                out.extend_from_slice(chunk);
                out
            })
            .collect();

        Ok(payloads)
    }

    fn is_marker(&mut self, _data: &[u8], _previous: Option<&[u8]>, last: bool) -> bool {
        last
    }
}

impl Depacketizer for Av1Depacketizer {
    fn out_size_hint(&self, packets_size: usize) -> Option<usize> {
        Some(packets_size)
    }

    fn depacketize(
        &mut self,
        packet: &[u8],
        out: &mut Vec<u8>,
        extra: &mut CodecExtra,
    ) -> Result<(), Error> {
        if packet.len() < AGGREGATION_HEADER_SIZE {
            return Err(Error::Truncated {
                needed: AGGREGATION_HEADER_SIZE,
                available: packet.len(),
            });
        }

        let agg = packet[0];
        if agg & AGG_W_MASK != 1 << 4 {
            return Err(Error::Malformed("AV1 packet with more than one OBU element"));
        }

        if agg & AGG_N > 0 {
            extra.is_keyframe = true;
        }

        out.extend_from_slice(&packet[AGGREGATION_HEADER_SIZE..]);

        Ok(())
    }

    fn is_partition_head(&self, packet: &[u8]) -> bool {
        let Some(&agg) = packet.first() else {
            return false;
        };

        agg & AGG_Z == 0 && agg & AGG_W_MASK == 1 << 4
    }

    fn is_partition_tail(&self, _marker: bool, packet: &[u8]) -> bool {
        let Some(&agg) = packet.first() else {
            return false;
        };

        agg & AGG_Y == 0 && agg & AGG_W_MASK == 1 << 4
    }

    fn is_keyframe_head(&self, packet: &[u8]) -> bool {
        self.is_partition_head(packet) && packet[0] & AGG_N > 0
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn aggregation_bits() {
        let mut pack = Av1Packetizer;
        let data = vec![0x30; 25];
        let payloads = pack.packetize(10, &data).unwrap();

        // 9 bytes of data per packet.
        assert_eq!(payloads.len(), 3);
        assert_eq!(payloads[0][0], 0b0101_0000); // Y W=1
        assert_eq!(payloads[1][0], 0b1101_0000); // Z Y W=1
        assert_eq!(payloads[2][0], 0b1001_0000); // Z W=1

        let depack = Av1Depacketizer;
        assert!(depack.is_partition_head(&payloads[0]));
        assert!(!depack.is_partition_head(&payloads[1]));
        assert!(!depack.is_partition_tail(false, &payloads[1]));
        assert!(depack.is_partition_tail(false, &payloads[2]));
    }

    #[test]
    fn single_packet_is_head_and_tail() {
        let mut pack = Av1Packetizer;
        let payloads = pack.packetize(1200, &[0x32, 0x00]).unwrap();
        assert_eq!(payloads, vec![vec![0b0001_0000, 0x32, 0x00]]);

        let depack = Av1Depacketizer;
        assert!(depack.is_partition_head(&payloads[0]));
        assert!(depack.is_partition_tail(false, &payloads[0]));
    }

    #[test]
    fn n_bit_on_sequence_header() {
        // temporal delimiter (type 2, sized 0), then sequence header (type 1, sized 2)
        let data = [0x12, 0x00, 0x0a, 0x02, 0xaa, 0xbb, 0x32, 0x01, 0xcc];
        assert!(has_sequence_header(&data));

        let mut pack = Av1Packetizer;
        let payloads = pack.packetize(5, &data).unwrap();
        assert_eq!(payloads[0][0] & AGG_N, AGG_N);
        assert!(payloads[1..].iter().all(|p| p[0] & AGG_N == 0));

        let mut depack = Av1Depacketizer;
        let mut out = vec![];
        let mut extra = CodecExtra::default();
        for p in &payloads {
            depack.depacketize(p, &mut out, &mut extra).unwrap();
        }
        assert_eq!(out, data);
        assert!(extra.is_keyframe);

        assert!(depack.is_keyframe_head(&payloads[0]));
        assert!(!depack.is_keyframe_head(&payloads[1]));
    }

    #[test]
    fn empty_temporal_unit_is_one_packet() {
        let mut pack = Av1Packetizer;
        let payloads = pack.packetize(1200, &[]).unwrap();
        assert_eq!(payloads, vec![vec![0b0001_0000]]);

        let mut depack = Av1Depacketizer;
        assert!(depack.is_partition_head(&payloads[0]));
        assert!(depack.is_partition_tail(false, &payloads[0]));

        let mut out = vec![];
        let mut extra = CodecExtra::default();
        depack.depacketize(&payloads[0], &mut out, &mut extra).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn no_sequence_header() {
        let data = [0x12, 0x00, 0x32, 0x01, 0xcc];
        assert!(!has_sequence_header(&data));
        // Unparseable data
        assert!(!has_sequence_header(&[0x32, 0xff]));
    }

    #[test]
    fn leb128() {
        assert_eq!(read_leb128(&[0x05]), Some((1, 5)));
        assert_eq!(read_leb128(&[0x80, 0x01]), Some((2, 128)));
        assert_eq!(read_leb128(&[0x80]), None);
    }

    #[test]
    fn rejects_multiple_elements() {
        let mut depack = Av1Depacketizer;
        let mut out = vec![];
        let mut extra = CodecExtra::default();
        assert!(matches!(
            depack.depacketize(&[0b0010_0000, 1], &mut out, &mut extra),
            Err(Error::Malformed(_))
        ));
    }
}

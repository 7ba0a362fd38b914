use super::{CodecExtra, Depacketizer, Packetizer};
use crate::Error;

/// Packetizes H264 RTP packets.
///
/// The input is an Annex-B access unit. Each NAL unit is sent as a single NAL
/// packet when it fits, and fragmented with FU-A otherwise.
#[derive(Default, Debug, Clone)]
pub struct H264Packetizer;

pub const STAPA_NALU_TYPE: u8 = 24;
pub const FUA_NALU_TYPE: u8 = 28;
pub const FUB_NALU_TYPE: u8 = 29;
pub const IDR_NALU_TYPE: u8 = 5;
pub const SPS_NALU_TYPE: u8 = 7;

pub const FUA_HEADER_SIZE: usize = 2;
pub const STAPA_HEADER_SIZE: usize = 1;
pub const STAPA_NALU_LENGTH_SIZE: usize = 2;

pub const NALU_TYPE_BITMASK: u8 = 0x1F;
pub const NALU_REF_IDC_BITMASK: u8 = 0x60;
pub const NALU_F_BITMASK: u8 = 0x80;
pub const FU_START_BITMASK: u8 = 0x80;
pub const FU_END_BITMASK: u8 = 0x40;

pub static ANNEXB_NALUSTART_CODE: &[u8] = &[0x00, 0x00, 0x00, 0x01];

/// Find the next start code at or after `start`.
///
/// Returns the index of the first zero of the start code and its length.
fn next_ind(nalu: &[u8], start: usize) -> Option<(usize, usize)> {
    let mut zero_count = 0;

    for (i, &b) in nalu[start..].iter().enumerate() {
        if b == 0 {
            zero_count += 1;
            continue;
        } else if b == 1 && zero_count >= 2 {
            // Longer runs of zeros belong to the start code (zero_byte + 3 byte code).
            let len = zero_count.min(3) + 1;
            return Some((start + i + 1 - len, len));
        }
        zero_count = 0;
    }

    None
}

/// Split an Annex-B stream into NAL units. A stream without start codes is one NAL.
pub(crate) fn split_nalus(frame: &[u8]) -> Vec<&[u8]> {
    let Some((first, len)) = next_ind(frame, 0) else {
        return vec![frame];
    };

    let mut out = vec![];

    if first > 0 {
        out.push(&frame[..first]);
    }

    let mut pos = first + len;
    while let Some((next, len)) = next_ind(frame, pos) {
        out.push(&frame[pos..next]);
        pos = next + len;
    }
    out.push(&frame[pos..]);

    out.retain(|n| !n.is_empty());
    out
}

impl H264Packetizer {
    fn emit(&mut self, nalu: &[u8], mtu: usize, payloads: &mut Vec<Vec<u8>>) {
        if nalu.is_empty() {
            return;
        }

        // Single NALU
        if nalu.len() <= mtu {
            payloads.push(nalu.to_vec());
            return;
        }

        // FU-A
        let max_fragment_size = mtu - FUA_HEADER_SIZE;

        // +---------------+
        // |0|1|2|3|4|5|6|7|
        // +-+-+-+-+-+-+-+-+
        // |F|NRI|  Type   |
        // +---------------+
        let indicator = (nalu[0] & (NALU_F_BITMASK | NALU_REF_IDC_BITMASK)) | FUA_NALU_TYPE;
        let nalu_type = nalu[0] & NALU_TYPE_BITMASK;

        // The first octet is carried in the FU indicator and header.
        let data = &nalu[1..];
        let count = (data.len() + max_fragment_size - 1) / max_fragment_size;

        for (i, fragment) in data.chunks(max_fragment_size).enumerate() {
            let mut out = Vec::with_capacity(FUA_HEADER_SIZE + fragment.len());
            out.push(indicator);

            // +---------------+
            // |0|1|2|3|4|5|6|7|
            // +-+-+-+-+-+-+-+-+
            // |S|E|R|  Type   |
            // +---------------+
            let mut header = nalu_type;
            if i == 0 {
                header |= FU_START_BITMASK;
            }
            if i == count - 1 {
                header |= FU_END_BITMASK;
            }
            out.push(header);

            out.extend_from_slice(fragment);
            payloads.push(out);
        }
    }
}

impl Packetizer for H264Packetizer {
    fn packetize(&mut self, mtu: usize, payload: &[u8]) -> Result<Vec<Vec<u8>>, Error> {
        if mtu <= FUA_HEADER_SIZE {
            return Err(Error::CapacityExceeded("max payload size too small for FU-A"));
        }

        let mut payloads = vec![];

        for nalu in split_nalus(payload) {
            self.emit(nalu, mtu, &mut payloads);
        }

        Ok(payloads)
    }

    fn is_marker(&mut self, _data: &[u8], _previous: Option<&[u8]>, last: bool) -> bool {
        last
    }
}

/// Depacketizes H264 RTP packets into Annex-B.
#[derive(PartialEq, Eq, Debug, Default, Clone)]
pub struct H264Depacketizer {
    fua_buffer: Option<Vec<u8>>,
}

fn is_keyframe_nalu(t: u8) -> bool {
    t == IDR_NALU_TYPE || t == SPS_NALU_TYPE
}

impl Depacketizer for H264Depacketizer {
    fn out_size_hint(&self, packets_size: usize) -> Option<usize> {
        Some(packets_size + 64)
    }

    fn depacketize(
        &mut self,
        packet: &[u8],
        out: &mut Vec<u8>,
        extra: &mut CodecExtra,
    ) -> Result<(), Error> {
        if packet.is_empty() {
            return Err(Error::Truncated {
                needed: 1,
                available: 0,
            });
        }

        let b0 = packet[0];
        let nalu_type = b0 & NALU_TYPE_BITMASK;

        match nalu_type {
            t @ 1..=23 => {
                extra.is_keyframe |= is_keyframe_nalu(t);

                out.extend_from_slice(ANNEXB_NALUSTART_CODE);
                out.extend_from_slice(packet);
                Ok(())
            }
            STAPA_NALU_TYPE => {
                let mut curr_offset = STAPA_HEADER_SIZE;
                while curr_offset + 1 < packet.len() {
                    let nalu_size =
                        ((packet[curr_offset] as usize) << 8) | packet[curr_offset + 1] as usize;
                    curr_offset += STAPA_NALU_LENGTH_SIZE;

                    if curr_offset + nalu_size > packet.len() {
                        return Err(Error::Truncated {
                            needed: curr_offset + nalu_size,
                            available: packet.len(),
                        });
                    }

                    let Some(b0) = packet.get(curr_offset) else {
                        continue;
                    };
                    extra.is_keyframe |= is_keyframe_nalu(b0 & NALU_TYPE_BITMASK);

                    out.extend_from_slice(ANNEXB_NALUSTART_CODE);
                    out.extend_from_slice(&packet[curr_offset..curr_offset + nalu_size]);
                    curr_offset += nalu_size;
                }

                Ok(())
            }
            FUA_NALU_TYPE => {
                if packet.len() < FUA_HEADER_SIZE {
                    return Err(Error::Truncated {
                        needed: FUA_HEADER_SIZE,
                        available: packet.len(),
                    });
                }

                let b1 = packet[1];

                // A start fragment discards whatever is left of an unfinished NAL.
                if b1 & FU_START_BITMASK != 0 {
                    self.fua_buffer = Some(Vec::new());
                }

                let Some(fua_buffer) = &mut self.fua_buffer else {
                    trace!("Drop FU-A fragment before start fragment");
                    return Ok(());
                };
                fua_buffer.extend_from_slice(&packet[FUA_HEADER_SIZE..]);

                if b1 & FU_END_BITMASK != 0 {
                    let header = b0 & (NALU_F_BITMASK | NALU_REF_IDC_BITMASK);
                    let fragmented_nalu_type = b1 & NALU_TYPE_BITMASK;

                    extra.is_keyframe |= is_keyframe_nalu(fragmented_nalu_type);

                    if let Some(fua_buffer) = self.fua_buffer.take() {
                        out.extend_from_slice(ANNEXB_NALUSTART_CODE);
                        out.push(header | fragmented_nalu_type);
                        out.extend_from_slice(&fua_buffer);
                    }
                }

                Ok(())
            }
            _ => Err(Error::Malformed("Unhandled H264 NAL unit type")),
        }
    }

    fn is_partition_head(&self, packet: &[u8]) -> bool {
        if packet.is_empty() {
            return false;
        }

        let t = packet[0] & NALU_TYPE_BITMASK;
        if t == FUA_NALU_TYPE || t == FUB_NALU_TYPE {
            packet.len() >= 2 && (packet[1] & FU_START_BITMASK) != 0
        } else {
            true
        }
    }

    fn is_partition_tail(&self, marker: bool, _packet: &[u8]) -> bool {
        marker
    }

    fn is_keyframe_head(&self, packet: &[u8]) -> bool {
        if !self.is_partition_head(packet) {
            return false;
        }

        let t = match packet[0] & NALU_TYPE_BITMASK {
            FUA_NALU_TYPE | FUB_NALU_TYPE => packet[1],
            // First aggregated NAL, after the 2 byte size.
            STAPA_NALU_TYPE => match packet.get(STAPA_HEADER_SIZE + STAPA_NALU_LENGTH_SIZE) {
                Some(b) => *b,
                None => return false,
            },
            _ => packet[0],
        };

        is_keyframe_nalu(t & NALU_TYPE_BITMASK)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn split_annexb() {
        let frame = [0, 0, 0, 1, 0x67, 1, 2, 0, 0, 1, 0x68, 3, 0, 0, 0, 1, 0x65, 4, 5];
        let nalus = split_nalus(&frame);
        assert_eq!(
            nalus,
            vec![&[0x67, 1, 2][..], &[0x68, 3][..], &[0x65, 4, 5][..]]
        );
    }

    #[test]
    fn no_start_code_is_single_nal() {
        let frame = [0x41, 1, 2, 3];
        assert_eq!(split_nalus(&frame), vec![&frame[..]]);
    }

    #[test]
    fn fua_fragments() {
        let mut pack = H264Packetizer;
        let mut nalu = vec![0x65];
        nalu.extend(0..20_u8);

        let payloads = pack.packetize(10, &nalu).unwrap();

        // 20 bytes after the NAL header, 8 per fragment.
        assert_eq!(payloads.len(), 3);
        assert_eq!(payloads[0][..2], [0x7c, 0x85]);
        assert_eq!(payloads[1][..2], [0x7c, 0x05]);
        assert_eq!(payloads[2][..2], [0x7c, 0x45]);
        assert!(payloads.iter().all(|p| p.len() <= 10));

        let mut depack = H264Depacketizer::default();
        let mut out = vec![];
        let mut extra = CodecExtra::default();
        for p in &payloads {
            depack.depacketize(p, &mut out, &mut extra).unwrap();
        }

        assert_eq!(out[..4], *ANNEXB_NALUSTART_CODE);
        assert_eq!(out[4..], nalu[..]);
        assert!(extra.is_keyframe);
    }

    #[test]
    fn single_nal_when_it_fits() {
        let mut pack = H264Packetizer;
        let frame = [0, 0, 0, 1, 0x67, 1, 0, 0, 0, 1, 0x41, 2, 3];
        let payloads = pack.packetize(1200, &frame).unwrap();
        assert_eq!(payloads, vec![vec![0x67, 1], vec![0x41, 2, 3]]);
    }

    #[test]
    fn stapa_depacketize() {
        let packet = [0x78, 0, 2, 0x67, 1, 0, 1, 0x68];
        let mut depack = H264Depacketizer::default();
        let mut out = vec![];
        let mut extra = CodecExtra::default();
        depack.depacketize(&packet, &mut out, &mut extra).unwrap();

        assert_eq!(out, vec![0, 0, 0, 1, 0x67, 1, 0, 0, 0, 1, 0x68]);
        assert!(extra.is_keyframe);
    }

    #[test]
    fn stapa_size_larger_than_buffer() {
        let packet = [0x78, 0, 9, 0x67, 1];
        let mut depack = H264Depacketizer::default();
        let mut out = vec![];
        let mut extra = CodecExtra::default();
        assert!(matches!(
            depack.depacketize(&packet, &mut out, &mut extra),
            Err(Error::Truncated { .. })
        ));
    }

    #[test]
    fn unhandled_nal_type() {
        let mut depack = H264Depacketizer::default();
        let mut out = vec![];
        let mut extra = CodecExtra::default();
        assert!(matches!(
            depack.depacketize(&[0x1e, 0], &mut out, &mut extra),
            Err(Error::Malformed(_))
        ));
    }

    #[test]
    fn fua_without_start_is_dropped() {
        let mut pack = H264Packetizer;
        let mut nalu = vec![0x41];
        nalu.extend(0..20_u8);
        let payloads = pack.packetize(10, &nalu).unwrap();
        assert_eq!(payloads.len(), 3);

        let mut depack = H264Depacketizer::default();
        let mut out = vec![];
        let mut extra = CodecExtra::default();

        // Start fragment lost.
        depack.depacketize(&payloads[1], &mut out, &mut extra).unwrap();
        depack.depacketize(&payloads[2], &mut out, &mut extra).unwrap();
        assert!(out.is_empty());

        // The next complete NAL comes through untouched.
        for p in &payloads {
            depack.depacketize(p, &mut out, &mut extra).unwrap();
        }
        assert_eq!(out[4..], nalu[..]);
    }

    #[test]
    fn empty_access_unit_has_no_packets() {
        let mut pack = H264Packetizer;
        assert!(pack.packetize(1200, &[]).unwrap().is_empty());
        assert!(pack.packetize(1200, &[0, 0, 0, 1]).unwrap().is_empty());
    }

    #[test]
    fn keyframe_head() {
        let depack = H264Depacketizer::default();
        // SPS, IDR and a P slice.
        assert!(depack.is_keyframe_head(&[0x67, 1]));
        assert!(depack.is_keyframe_head(&[0x65, 1]));
        assert!(!depack.is_keyframe_head(&[0x41, 1]));
        // FU-A start of an IDR, and a middle fragment of it.
        assert!(depack.is_keyframe_head(&[0x7c, 0x85]));
        assert!(!depack.is_keyframe_head(&[0x7c, 0x05]));
        // STAP-A led by an SPS.
        assert!(depack.is_keyframe_head(&[0x78, 0, 2, 0x67, 1]));
        assert!(!depack.is_keyframe_head(&[0x78, 0]));
    }

    #[test]
    fn partition_head() {
        let depack = H264Depacketizer::default();
        assert!(depack.is_partition_head(&[0x65]));
        assert!(depack.is_partition_head(&[0x7c, 0x85]));
        assert!(!depack.is_partition_head(&[0x7c, 0x05]));
        assert!(!depack.is_partition_head(&[]));
    }
}

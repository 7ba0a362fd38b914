use super::{CodecExtra, Depacketizer, Packetizer};
use crate::Error;

/// Splits a frame into fixed size chunks. The payload carries no header.
#[derive(Debug, Default)]
pub struct GenericPacketizer;

/// Concatenates generic payloads.
#[derive(Debug, Default)]
pub struct GenericDepacketizer;

impl Packetizer for GenericPacketizer {
    fn packetize(&mut self, max_payload_size: usize, frame: &[u8]) -> Result<Vec<Vec<u8>>, Error> {
        if max_payload_size == 0 {
            return Err(Error::CapacityExceeded("max payload size is zero"));
        }

        // An empty frame is still sent, as a single empty packet carrying the marker.
        if frame.is_empty() {
            return Ok(vec![vec![]]);
        }

        // chunks() leaves a full sized last chunk when the length is an exact multiple.
        Ok(frame
            .chunks(max_payload_size)
            .map(|c| c.to_vec())
            .collect())
    }

    fn is_marker(&mut self, _data: &[u8], _previous: Option<&[u8]>, last: bool) -> bool {
        last
    }
}

impl Depacketizer for GenericDepacketizer {
    fn out_size_hint(&self, packets_size: usize) -> Option<usize> {
        Some(packets_size)
    }

    fn depacketize(
        &mut self,
        packet: &[u8],
        out: &mut Vec<u8>,
        _extra: &mut CodecExtra,
    ) -> Result<(), Error> {
        out.extend_from_slice(packet);
        Ok(())
    }

    fn is_partition_head(&self, _packet: &[u8]) -> bool {
        // Without a payload header there is nothing marking the start. The
        // assembler relies on the marker of the previous frame instead.
        true
    }

    fn is_partition_tail(&self, marker: bool, _packet: &[u8]) -> bool {
        marker
    }
}

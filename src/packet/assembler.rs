use std::collections::VecDeque;

use super::{depacketize_frame, Codec, CodecDepacketizer, Depacketizer};
use crate::rtp::{extend_recv_u16, RtpPacket};
use crate::Error;

/// Number of packets the assembler holds while waiting for frames to complete.
const BUFFER_SIZE: usize = 2048;

/// Number of assembled frames remembered to discard late duplicates.
const HISTORY_SIZE: usize = 5;

/// A frame put back together from its RTP packets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledFrame {
    /// Extended sequence number of the first packet.
    pub first_seq: u64,
    /// Extended sequence number of the last packet.
    pub last_seq: u64,
    /// RTP timestamp shared by the frame's packets.
    pub rtp_time: u32,
    /// The depacketized frame.
    pub data: Vec<u8>,
    /// Frame decodable on its own.
    pub is_keyframe: bool,
}

impl AssembledFrame {
    /// Number of RTP packets the frame was made of.
    pub fn packet_count(&self) -> usize {
        (self.last_seq - self.first_seq + 1) as usize
    }
}

#[derive(Debug)]
struct Entry {
    seq: u64,
    rtp_time: u32,
    head: bool,
    tail: bool,
    keyframe_head: bool,
    padding: bool,
    continuous: bool,
    payload: Vec<u8>,
}

/// Orders incoming RTP packets and emits complete frames.
///
/// Packets may arrive out of order, duplicated or across the 16 bit sequence
/// number wrap. A frame is emitted once every packet from its first to its last
/// is present.
#[derive(Debug)]
pub struct FrameAssembler {
    codec: Codec,
    depack: CodecDepacketizer,
    slots: Vec<Option<Entry>>,
    max_seq: Option<u64>,
    /// Everything up to and including this has been emitted or given up on.
    cleared_to: Option<u64>,
    /// Whether `cleared_to` has moved past the first received packet.
    has_cleared: bool,
    /// (first, last) of recently emitted frames.
    history: VecDeque<(u64, u64)>,
    ready: VecDeque<AssembledFrame>,
}

impl FrameAssembler {
    pub fn new(codec: Codec) -> Self {
        FrameAssembler {
            codec,
            depack: codec.into(),
            slots: (0..BUFFER_SIZE).map(|_| None).collect(),
            max_seq: None,
            cleared_to: None,
            has_cleared: false,
            history: VecDeque::with_capacity(HISTORY_SIZE),
            ready: VecDeque::new(),
        }
    }

    /// Extend a 16 bit sequence number relative to the highest seen.
    fn unwrap_seq(&mut self, seq: u16) -> u64 {
        let v = extend_recv_u16(self.max_seq, seq);
        self.max_seq = Some(self.max_seq.map_or(v, |m| m.max(v)));
        v
    }

    /// Add a packet.
    ///
    /// Duplicates and packets belonging to already emitted frames are dropped.
    /// A packet that later frames have passed by is dropped when its slot is needed.
    /// When the buffer is full the pending packets are discarded, the new packet
    /// is kept and [`Error::CapacityExceeded`] is returned.
    pub fn insert(&mut self, packet: RtpPacket) -> Result<(), Error> {
        let seq = self.unwrap_seq(packet.header.sequence_number);

        let cleared_to = *self.cleared_to.get_or_insert(seq - 1);

        // Until the first frame is out, earlier packets may still be the start of it.
        if !self.has_cleared && seq <= cleared_to {
            self.cleared_to = Some(seq - 1);
        } else if seq <= cleared_to || self.in_history(seq) {
            trace!("Drop old packet: {}", seq);
            return Ok(());
        }

        let padding = packet.is_padding();
        let (head, tail) = if padding {
            (true, true)
        } else {
            (
                self.depack.is_partition_head(&packet.payload),
                self.depack
                    .is_partition_tail(packet.header.marker, &packet.payload),
            )
        };
        let keyframe_head = !padding && self.depack.is_keyframe_head(&packet.payload);

        let entry = Entry {
            seq,
            rtp_time: packet.header.timestamp,
            head,
            tail,
            keyframe_head,
            padding,
            continuous: false,
            payload: packet.payload,
        };

        let idx = seq as usize % BUFFER_SIZE;
        let mut result = Ok(());

        if let Some(existing) = self.slots[idx].as_ref().map(|e| e.seq) {
            if existing == seq {
                trace!("Drop duplicate packet: {}", seq);
                return Ok(());
            }

            if existing > seq {
                return Err(Error::CapacityExceeded("packet too old for assembly buffer"));
            }

            if self.is_unclaimed(existing) {
                trace!("Drop unclaimed packet: {}", existing);
            } else {
                warn!("Assembly buffer full, clear pending packets before {}", seq);
                self.clear();
                self.cleared_to = Some(seq - 1);
                self.has_cleared = true;
                result = Err(Error::CapacityExceeded("assembly buffer full"));
            }
        }

        self.slots[idx] = Some(entry);
        self.find_frames(seq)?;

        result
    }

    /// Next complete frame, if any.
    pub fn pop_frame(&mut self) -> Option<AssembledFrame> {
        self.ready.pop_front()
    }

    /// Number of packets waiting for their frame to complete.
    pub fn pending(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    fn clear(&mut self) {
        for s in &mut self.slots {
            *s = None;
        }
        self.history.clear();
    }

    /// A packet that a later emitted frame has passed by. Its frame start is lost.
    fn is_unclaimed(&self, seq: u64) -> bool {
        self.history.iter().any(|(f, _)| *f > seq)
    }

    fn in_history(&self, seq: u64) -> bool {
        self.history.iter().any(|(f, l)| seq >= *f && seq <= *l)
    }

    fn get(&self, seq: u64) -> Option<&Entry> {
        self.slots[seq as usize % BUFFER_SIZE]
            .as_ref()
            .filter(|e| e.seq == seq)
    }

    fn get_mut(&mut self, seq: u64) -> Option<&mut Entry> {
        self.slots[seq as usize % BUFFER_SIZE]
            .as_mut()
            .filter(|e| e.seq == seq)
    }

    fn is_frame_start(&self, seq: u64) -> bool {
        let Some(e) = self.get(seq) else {
            return false;
        };

        if !e.head {
            return false;
        }

        // AV1 signals the frame start in the aggregation header.
        if self.codec == Codec::Av1 || e.padding {
            return true;
        }

        // Otherwise a frame starts after a frame boundary.
        let prev = seq - 1;
        if Some(prev) == self.cleared_to || self.history.iter().any(|(_, l)| *l == prev) {
            return true;
        }

        match self.get(prev) {
            Some(p) => p.tail || p.rtp_time != e.rtp_time,
            // After loss only a keyframe can be decoded.
            None => e.keyframe_head,
        }
    }

    fn potential_new_frame(&self, seq: u64) -> bool {
        let Some(e) = self.get(seq) else {
            return false;
        };

        if self.is_frame_start(seq) {
            return true;
        }

        let Some(prev) = self.get(seq - 1) else {
            return false;
        };

        if prev.rtp_time != e.rtp_time || prev.tail || prev.padding {
            return false;
        }

        prev.continuous
    }

    fn find_frames(&mut self, mut seq: u64) -> Result<(), Error> {
        while self.potential_new_frame(seq) {
            let tail = {
                let Some(e) = self.get_mut(seq) else {
                    break;
                };
                e.continuous = true;
                e.tail
            };

            if tail {
                self.assemble(seq)?;
            }

            seq += 1;
        }

        Ok(())
    }

    fn assemble(&mut self, last: u64) -> Result<(), Error> {
        let mut first = last;
        while !self.is_frame_start(first) {
            first -= 1;
            if last - first >= BUFFER_SIZE as u64 {
                return Err(Error::CapacityExceeded("frame larger than assembly buffer"));
            }
        }

        let resync = match (self.cleared_to, self.get(first)) {
            (Some(to), Some(e)) => first > to + 1 && e.keyframe_head,
            _ => false,
        };

        let entries: Vec<Entry> = (first..=last)
            .filter_map(|s| self.slots[s as usize % BUFFER_SIZE].take())
            .collect();

        if self.history.len() == HISTORY_SIZE {
            self.history.pop_front();
        }
        self.history.push_back((first, last));

        // A keyframe after a gap starts over. Nothing pending before it can be decoded.
        if let (true, Some(to)) = (resync, self.cleared_to) {
            debug!("Resume on keyframe {}, drop pending {}..{}", first, to + 1, first);
            let from = (to + 1).max(first.saturating_sub(BUFFER_SIZE as u64));
            for s in from..first {
                if self.get(s).is_some() {
                    self.slots[s as usize % BUFFER_SIZE] = None;
                }
            }
            self.cleared_to = Some(first - 1);
        }

        // Advance over this and any frames that completed ahead of it.
        while let Some(to) = self.cleared_to {
            let Some(&(_, l)) = self.history.iter().find(|(f, _)| *f == to + 1) else {
                break;
            };
            self.cleared_to = Some(l);
            self.has_cleared = true;
        }

        if entries.iter().all(|e| e.padding) {
            trace!("Skip padding {}..={}", first, last);
            return Ok(());
        }

        let rtp_time = entries[0].rtp_time;
        let payloads = entries
            .iter()
            .filter(|e| !e.padding)
            .map(|e| e.payload.as_slice());

        let (data, extra) = depacketize_frame(&mut self.depack, payloads)?;

        debug!(
            "Assembled frame {}..={} ts: {} size: {}",
            first,
            last,
            rtp_time,
            data.len()
        );

        self.ready.push_back(AssembledFrame {
            first_seq: first,
            last_seq: last,
            rtp_time,
            data,
            is_keyframe: extra.is_keyframe,
        });

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::packet::RtpPacketizer;
    use crate::rtp::SeqNo;
    use std::time::Instant;

    fn packets(codec: Codec, start: u64, frames: &[(&[u8], u32)], mps: usize) -> Vec<RtpPacket> {
        let now = Instant::now();
        let mut p =
            RtpPacketizer::new(1.into(), 96.into(), codec, mps).with_start_seq(SeqNo::from(start));
        frames
            .iter()
            .flat_map(|(f, ts)| p.packetize(f, *ts, now).unwrap())
            .collect()
    }

    #[test]
    fn frame_across_wrap() {
        let mut a = FrameAssembler::new(Codec::Generic);
        let frame: Vec<u8> = (0..40).collect();

        let pkts = packets(Codec::Generic, 65534, &[(&frame, 1000)], 10);
        let seqs: Vec<_> = pkts.iter().map(|p| p.header.sequence_number).collect();
        assert_eq!(seqs, vec![65534, 65535, 0, 1]);

        for p in pkts {
            a.insert(p).unwrap();
        }

        let f = a.pop_frame().unwrap();
        assert_eq!(f.packet_count(), 4);
        assert_eq!(f.data, frame);
        assert_eq!(f.rtp_time, 1000);
        assert!(a.pop_frame().is_none());
        assert_eq!(a.pending(), 0);
    }

    #[test]
    fn reordered_across_wrap() {
        let mut a = FrameAssembler::new(Codec::Generic);
        let frame: Vec<u8> = (0..40).collect();

        let mut pkts = packets(Codec::Generic, 65534, &[(&frame, 1000)], 10);
        // 0, 65535, 65534, 1
        pkts.swap(0, 2);

        for p in pkts {
            a.insert(p).unwrap();
        }

        let f = a.pop_frame().unwrap();
        assert_eq!(f.data, frame);
        assert_eq!(f.packet_count(), 4);
    }

    #[test]
    fn missing_packet_holds_frame() {
        let mut a = FrameAssembler::new(Codec::Generic);
        let frame = vec![7_u8; 30];
        let mut pkts = packets(Codec::Generic, 10, &[(&frame, 0)], 10);

        let missing = pkts.remove(1);
        for p in pkts {
            a.insert(p).unwrap();
        }
        assert!(a.pop_frame().is_none());
        assert_eq!(a.pending(), 2);

        a.insert(missing).unwrap();
        assert_eq!(a.pop_frame().unwrap().data, frame);
    }

    #[test]
    fn frames_complete_out_of_order() {
        let mut a = FrameAssembler::new(Codec::Generic);
        let f1 = vec![1_u8; 20];
        let f2 = vec![2_u8; 20];
        let f3 = vec![3_u8; 20];
        let pkts = packets(Codec::Generic, 100, &[(&f1, 0), (&f2, 3000), (&f3, 6000)], 10);

        // Packet 101 (end of f1) is late.
        let order = [0, 2, 3, 4, 5, 1];
        for i in order {
            a.insert(pkts[i].clone()).unwrap();
        }

        // f3 completes first, the late packet then releases f1 and f2.
        let mut frames: Vec<_> = std::iter::from_fn(|| a.pop_frame()).collect();
        assert_eq!(frames[0].data, f3);
        frames.sort_by_key(|f| f.first_seq);
        let data: Vec<_> = frames.into_iter().map(|f| f.data).collect();
        assert_eq!(data, vec![f1, f2, f3]);
        assert_eq!(a.pending(), 0);
    }

    #[test]
    fn duplicates_dropped() {
        let mut a = FrameAssembler::new(Codec::Generic);
        let pkts = packets(Codec::Generic, 0, &[(&[1, 2, 3], 0)], 10);

        a.insert(pkts[0].clone()).unwrap();
        a.insert(pkts[0].clone()).unwrap();

        assert!(a.pop_frame().is_some());
        assert!(a.pop_frame().is_none());
    }

    #[test]
    fn padding_between_frames() {
        let now = Instant::now();
        let mut p = RtpPacketizer::new(1.into(), 96.into(), Codec::Generic, 10)
            .with_start_seq(SeqNo::from(50));

        let mut pkts = p.packetize(&[1; 15], 0, now).unwrap();
        pkts.push(p.padding(100, now));
        pkts.extend(p.packetize(&[2; 15], 3000, now).unwrap());

        let mut a = FrameAssembler::new(Codec::Generic);
        for pkt in pkts {
            a.insert(pkt).unwrap();
        }

        assert_eq!(a.pop_frame().unwrap().data, vec![1; 15]);
        assert_eq!(a.pop_frame().unwrap().data, vec![2; 15]);
        assert!(a.pop_frame().is_none());
    }

    #[test]
    fn h264_keyframe() {
        let mut frame = vec![0, 0, 0, 1, 0x67, 1, 2, 0, 0, 0, 1, 0x65];
        frame.extend(vec![9; 50]);

        let mut a = FrameAssembler::new(Codec::H264);
        for p in packets(Codec::H264, 1, &[(&frame, 0)], 20) {
            a.insert(p).unwrap();
        }

        let f = a.pop_frame().unwrap();
        assert_eq!(f.data, frame);
        assert!(f.is_keyframe);
    }

    #[test]
    fn buffer_overflow() {
        let mut a = FrameAssembler::new(Codec::Generic);
        let pkts = packets(Codec::Generic, 0, &[(&[0; 30], 0)], 10);

        // Start of a frame that never completes.
        a.insert(pkts[0].clone()).unwrap();

        let mut far = pkts[0].clone();
        far.header.sequence_number = BUFFER_SIZE as u16;
        far.header.marker = true;
        far.header.timestamp = 9000;

        assert!(matches!(a.insert(far), Err(Error::CapacityExceeded(_))));

        // The packet that caused the overflow is kept and completes its frame.
        assert_eq!(a.pop_frame().unwrap().first_seq, (1 << 16) + BUFFER_SIZE as u64);
    }
    fn h264_stream(frames: &[(bool, u32)]) -> Vec<RtpPacket> {
        let mut key = vec![0, 0, 0, 1, 0x67, 1, 2, 0, 0, 0, 1, 0x65];
        key.extend(vec![9; 50]);
        let delta = vec![0, 0, 0, 1, 0x41, 8, 8, 8];

        let frames: Vec<(&[u8], u32)> = frames
            .iter()
            .map(|(k, ts)| (if *k { &key[..] } else { &delta[..] }, *ts))
            .collect();

        packets(Codec::H264, 1, &frames, 20)
    }

    fn emitted(a: &mut FrameAssembler) -> Vec<(u32, bool)> {
        std::iter::from_fn(|| a.pop_frame())
            .map(|f| (f.rtp_time, f.is_keyframe))
            .collect()
    }

    #[test]
    fn idr_after_lost_delta_is_emitted() {
        let pkts = h264_stream(&[(true, 0), (false, 3000), (true, 6000), (false, 9000)]);

        let mut a = FrameAssembler::new(Codec::H264);
        for p in pkts.into_iter().filter(|p| p.header.timestamp != 3000) {
            a.insert(p).unwrap();
        }

        assert_eq!(
            emitted(&mut a),
            vec![(0, true), (6000, true), (9000, false)]
        );
        assert_eq!(a.pending(), 0);
    }

    #[test]
    fn delta_after_loss_waits_for_keyframe() {
        let pkts = h264_stream(&[
            (true, 0),
            (false, 3000),
            (false, 6000),
            (true, 9000),
            (false, 12000),
        ]);

        let mut a = FrameAssembler::new(Codec::H264);
        for p in pkts.into_iter().filter(|p| p.header.timestamp != 3000) {
            a.insert(p).unwrap();
        }

        // The delta at 6000 refers to the lost frame and is given up on.
        assert_eq!(
            emitted(&mut a),
            vec![(0, true), (9000, true), (12000, false)]
        );
        assert_eq!(a.pending(), 0);
    }

    #[test]
    fn av1_frame_after_lost_frame() {
        let data = [0x32, 0x01, 0xcc];
        let frames: Vec<(&[u8], u32)> = (0..4).map(|i| (&data[..], i * 3000)).collect();
        let pkts = packets(Codec::Av1, 1, &frames, 2);

        let mut a = FrameAssembler::new(Codec::Av1);
        for p in pkts.into_iter().filter(|p| p.header.timestamp != 3000) {
            a.insert(p).unwrap();
        }

        let ts: Vec<_> = emitted(&mut a).into_iter().map(|(ts, _)| ts).collect();
        assert_eq!(ts, vec![0, 6000, 9000]);
        assert_eq!(a.pending(), 0);
    }

    #[test]
    fn unclaimed_packet_dropped_on_wrap() {
        let data = [1_u8, 2, 3];
        let count = BUFFER_SIZE as u32 + 10;
        let frames: Vec<(&[u8], u32)> = (0..count).map(|i| (&data[..], i * 3000)).collect();
        let pkts = packets(Codec::Generic, 0, &frames, 10);

        let mut a = FrameAssembler::new(Codec::Generic);
        let mut frames = 0;

        for (i, p) in pkts.into_iter().enumerate() {
            if i == 5 {
                continue;
            }
            // The frame after the lost one has no known start and is held, until its
            // slot is reused without clearing the rest of the buffer.
            a.insert(p).unwrap();
            frames += std::iter::from_fn(|| a.pop_frame()).count();
        }

        assert_eq!(frames, count as usize - 2);
        assert_eq!(a.pending(), 0);
    }
}

use std::time::Instant;

use medialink::fec::{FecDecoder, FecEncoder};
use medialink::packet::{Codec, FrameAssembler, RtpPacketizer};
use medialink::rtp::ExtensionMap;
use medialink::rtp::RtpPacket;
use medialink::Error;

mod common;
use common::init_log;

#[test]
pub fn generic_frame_of_3000_bytes() {
    init_log();

    let now = Instant::now();
    let mut packetizer = RtpPacketizer::new(42.into(), 96.into(), Codec::Generic, 1200);

    let frame: Vec<u8> = (0..3000).map(|i| i as u8).collect();
    let packets = packetizer.packetize(&frame, 1234, now).unwrap();

    assert_eq!(packets.len(), 3);

    let markers: Vec<_> = packets.iter().map(|p| p.header.marker).collect();
    assert_eq!(markers, [false, false, true]);

    let first = packets[0].header.sequence_number;
    for (i, p) in packets.iter().enumerate() {
        assert_eq!(p.header.sequence_number, first.wrapping_add(i as u16));
        assert_eq!(p.header.timestamp, 1234);
    }

    // Through the wire and back into one frame.
    let exts = ExtensionMap::standard();
    let mut assembler = FrameAssembler::new(Codec::Generic);
    for p in &packets {
        let parsed = RtpPacket::parse(&p.to_vec(&exts), &exts).unwrap();
        assembler.insert(parsed).unwrap();
    }

    let out = assembler.pop_frame().expect("frame");
    assert_eq!(out.data, frame);
    assert_eq!(out.packet_count(), 3);
}

#[test]
pub fn any_four_of_eight_symbols() {
    init_log();

    let encoder = FecEncoder::new(0.5, 64).unwrap();
    let data: Vec<u8> = (0..256).map(|i| (i * 7) as u8).collect();

    let symbols = encoder.encode(&data).unwrap();
    assert_eq!(symbols.len(), 8);

    // Every way to pick 4 of 8.
    for mask in 0_u32..256 {
        if mask.count_ones() != 4 {
            continue;
        }

        let mut decoder = FecDecoder::new(4, 64).unwrap();
        let mut fed = 0;
        for (esi, symbol) in symbols.iter().enumerate() {
            if mask & (1 << esi) == 0 {
                continue;
            }
            if fed == 3 {
                assert_eq!(decoder.decode(), Err(Error::NotYetDecodable));
            }
            decoder.insert(esi, symbol).unwrap();
            fed += 1;
        }

        let sources = decoder.decode().unwrap();
        assert_eq!(sources.concat(), data, "mask {:08b}", mask);
    }
}

#[test]
pub fn frame_across_sequence_wrap() {
    init_log();

    let now = Instant::now();
    let mut packetizer = RtpPacketizer::new(42.into(), 96.into(), Codec::Generic, 100)
        .with_start_seq(65534.into());

    let frame = vec![9_u8; 400];
    let packets = packetizer.packetize(&frame, 90_000, now).unwrap();

    let seqs: Vec<_> = packets.iter().map(|p| p.header.sequence_number).collect();
    assert_eq!(seqs, [65534, 65535, 0, 1]);

    // Arrive in reverse.
    let mut assembler = FrameAssembler::new(Codec::Generic);
    for p in packets.into_iter().rev() {
        assembler.insert(p).unwrap();
    }

    let out = assembler.pop_frame().expect("frame");
    assert_eq!(out.packet_count(), 4);
    assert_eq!(out.data, frame);
    assert_eq!(out.last_seq - out.first_seq, 3);
    assert!(assembler.pop_frame().is_none());
}

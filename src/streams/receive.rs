use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use super::{FrameSink, ReceivedFrame, RR_INTERVAL};
use crate::config::TransportConfig;
use crate::fec::FecReceiver;
use crate::feedback::FeedbackGenerator;
use crate::packet::{AssembledFrame, Codec, FrameAssembler};
use crate::rtp::{Bitrate, ExtensionMap, Pt, ReceiverReport, ReportList, Rtcp, RtpPacket};
use crate::rtp::{Ssrc, VIDEO_CLOCK_RATE};
use crate::stats::{IoStatistics, MediaKind, ReceptionStats};
use crate::util::{already_happened, InstantExt};
use crate::Error;

/// Number of recovered sequence numbers remembered to flag frames.
const RECOVERED_HISTORY: usize = 256;

/// Incoming media stream.
///
/// The media SSRC is learned from the first packet with the expected payload type.
pub struct RecvStream {
    /// Our SSRC, used as sender of the RTCP we produce.
    local_ssrc: Ssrc,
    /// Media SSRC, once seen.
    ssrc: Option<Ssrc>,
    pt: Pt,
    fec_pt: Pt,
    clock_rate: u32,
    exts: ExtensionMap,

    fec: FecReceiver,
    assembler: FrameAssembler,
    generator: FeedbackGenerator,
    stats: Option<ReceptionStats>,

    sink: Box<dyn FrameSink>,
    io: Option<(Arc<IoStatistics>, MediaKind)>,

    /// Compact NTP time of the last sender report and when it arrived.
    last_sr: Option<(u32, Instant)>,
    next_report: Instant,
    next_feedback: Instant,
    recovered: VecDeque<u16>,
}

impl RecvStream {
    /// Create a stream receiving payload type `pt`.
    ///
    /// `local_ssrc` is put as the sender of the feedback and receiver reports.
    pub fn new(
        config: &TransportConfig,
        local_ssrc: Ssrc,
        pt: Pt,
        sink: impl FrameSink + 'static,
    ) -> Result<Self, Error> {
        let codec = Codec::for_pt(pt, config.codecs())?;

        debug!("Create RecvStream pt {} codec {:?}", pt, codec);

        Ok(RecvStream {
            local_ssrc,
            ssrc: None,
            pt,
            fec_pt: config.fec().payload_type(),
            clock_rate: VIDEO_CLOCK_RATE,
            exts: config.extension_map().clone(),
            fec: FecReceiver::new(),
            assembler: FrameAssembler::new(codec),
            generator: FeedbackGenerator::new(local_ssrc, config.feedback().clone()),
            stats: None,
            sink: Box::new(sink),
            io: None,
            last_sr: None,
            next_report: already_happened(),
            next_feedback: already_happened(),
            recovered: VecDeque::with_capacity(RECOVERED_HISTORY),
        })
    }

    /// Clock rate of the RTP timestamps, for jitter. Defaults to 90kHz.
    pub fn with_clock_rate(mut self, clock_rate: u32) -> Self {
        self.clock_rate = clock_rate;
        self
    }

    /// Count received bytes in shared I/O statistics.
    pub fn with_io_statistics(mut self, io: Arc<IoStatistics>, kind: MediaKind) -> Self {
        self.io = Some((io, kind));
        self
    }

    /// The media SSRC, once a packet has been received.
    pub fn ssrc(&self) -> Option<Ssrc> {
        self.ssrc
    }

    /// Handle an RTP packet, media or repair.
    ///
    /// Packets that fail to parse are dropped and the error returned. The stream carries
    /// on regardless. [`Error::CapacityExceeded`] means the frame assembler gave up on
    /// frames and the application should ask for a key frame.
    pub fn handle_rtp(&mut self, buf: &[u8], now: Instant) -> Result<(), Error> {
        let packet = match RtpPacket::parse(buf, &self.exts) {
            Ok(v) => v,
            Err(e) => {
                debug!("Drop RTP: {}", e);
                return Err(e);
            }
        };

        if let Some((io, kind)) = &self.io {
            io.on_inbound(*kind, buf.len());
        }

        let header = &packet.header;
        self.generator.on_received(
            header.ssrc,
            header.sequence_number,
            header.marker,
            0,
            now,
        );

        if header.payload_type == self.fec_pt {
            let recovered = match self.fec.on_repair(&packet, now) {
                Ok(v) => v,
                Err(e) => {
                    debug!("Drop repair packet {}: {}", header.sequence_number, e);
                    return Err(e);
                }
            };
            let result = self.insert_recovered(recovered);
            self.emit_frames(now);
            return result;
        }

        if header.payload_type != self.pt {
            trace!("Drop RTP with unexpected pt {}", header.payload_type);
            return Err(Error::UnsupportedCodec(header.payload_type));
        }

        match self.ssrc {
            None => {
                debug!("RecvStream media SSRC {}", header.ssrc);
                self.ssrc = Some(header.ssrc);
            }
            Some(ssrc) if ssrc != header.ssrc => {
                trace!("Drop RTP from unexpected SSRC {}", header.ssrc);
                return Ok(());
            }
            Some(_) => {}
        }

        let clock_rate = self.clock_rate;
        self.stats
            .get_or_insert_with(|| ReceptionStats::new(header.ssrc, clock_rate))
            .update(header.sequence_number, header.timestamp, now);

        let recovered = if packet.is_padding() {
            vec![]
        } else {
            self.fec.on_media(header.sequence_number, buf)
        };

        let inserted = self.assembler.insert(packet);
        let result = inserted.and(self.insert_recovered(recovered));

        self.emit_frames(now);

        if let Err(e) = &result {
            warn!("Frame assembly: {}", e);
        }

        result
    }

    fn insert_recovered(&mut self, recovered: Vec<Vec<u8>>) -> Result<(), Error> {
        let mut result = Ok(());

        for raw in recovered {
            let packet = match RtpPacket::parse(&raw, &self.exts) {
                Ok(v) => v,
                Err(e) => {
                    debug!("Drop recovered packet: {}", e);
                    continue;
                }
            };

            let seq = packet.header.sequence_number;
            trace!("Recovered packet {}", seq);

            if self.recovered.len() == RECOVERED_HISTORY {
                self.recovered.pop_front();
            }
            self.recovered.push_back(seq);

            if let Err(e) = self.assembler.insert(packet) {
                result = Err(e);
            }
        }

        result
    }

    fn emit_frames(&mut self, now: Instant) {
        while let Some(frame) = self.assembler.pop_frame() {
            let recovered = self.is_recovered(&frame);

            trace!(
                "Frame {} with {} packets, keyframe: {} recovered: {}",
                frame.rtp_time,
                frame.packet_count(),
                frame.is_keyframe,
                recovered
            );

            self.sink.on_frame(ReceivedFrame {
                data: frame.data,
                rtp_time: frame.rtp_time,
                receive_time: now,
                is_keyframe: frame.is_keyframe,
                recovered,
            });
        }
    }

    fn is_recovered(&self, frame: &AssembledFrame) -> bool {
        let first = frame.first_seq as u16;
        let span = frame.last_seq - frame.first_seq;
        self.recovered
            .iter()
            .any(|s| s.wrapping_sub(first) as u64 <= span)
    }

    /// Handle a compound RTCP packet from the remote sender.
    pub fn handle_rtcp(&mut self, buf: &[u8], now: Instant) {
        let mut queue = VecDeque::new();
        Rtcp::read_packet(buf, &mut queue);

        for rtcp in queue {
            match rtcp {
                Rtcp::SenderReport(sr) => {
                    if Some(sr.sender_info.ssrc) != self.ssrc {
                        continue;
                    }
                    trace!(
                        "Sender report rtp time {} packets {}",
                        sr.sender_info.rtp_time,
                        sr.sender_info.sender_packet_count
                    );
                    self.last_sr = Some((sr.sender_info.ntp_time.to_compact_ntp(), now));
                }
                other => trace!("Ignore RTCP on receive side: {:?}", other),
            }
        }
    }

    /// Drive timers. Returns the RTCP to send to the remote sender.
    pub fn process(&mut self, now: Instant) -> Vec<Rtcp> {
        self.fec.handle_timeout(now);
        self.next_feedback = self.generator.process(now);

        let mut out = vec![];
        while let Some(fb) = self.generator.poll_feedback() {
            out.push(Rtcp::CongestionControlFeedback(fb));
        }

        if now >= self.next_report {
            self.next_report = now + RR_INTERVAL;
            if let Some(rr) = self.receiver_report(now) {
                out.push(Rtcp::ReceiverReport(rr));
            }
        }

        out
    }

    /// When [`process()`][Self::process] should be called next.
    pub fn poll_timeout(&self) -> Instant {
        let fec = self.fec.poll_timeout().unwrap_or(self.next_report);
        self.next_feedback.min(self.next_report).min(fec)
    }

    /// Build a receiver report, if any media has been received.
    pub fn receiver_report(&mut self, now: Instant) -> Option<ReceiverReport> {
        let last_sr = self.last_sr.map(|(ntp, at)| {
            let delay = now.saturating_duration_since(at).as_secs_f64() * 65536.0;
            (ntp, delay as u32)
        });

        let report = self.stats.as_mut()?.report(last_sr)?;

        let mut reports = ReportList::new();
        reports.push(report).ok()?;

        Some(ReceiverReport {
            sender_ssrc: self.local_ssrc,
            reports,
        })
    }

    /// The bitrate we send to the remote changed. Feedback is capped at a share of it.
    pub fn on_send_bitrate_changed(&mut self, bitrate: Bitrate) {
        self.generator.on_send_bitrate_changed(bitrate);
    }

    pub fn reception_stats(&self) -> Option<&ReceptionStats> {
        self.stats.as_ref()
    }

    /// Repair groups waiting for more packets.
    pub fn pending_fec_groups(&self) -> usize {
        self.fec.pending_groups()
    }

    /// Packets held waiting for their frame to complete.
    pub fn pending_packets(&self) -> usize {
        self.assembler.pending()
    }
}

impl fmt::Debug for RecvStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecvStream")
            .field("ssrc", &self.ssrc)
            .field("pt", &self.pt)
            .field("assembler", &self.assembler)
            .field("stats", &self.stats)
            .field("last_sr", &self.last_sr)
            .finish_non_exhaustive()
    }
}

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{BitrateObserver, SendStatus, Transport};
use crate::bwe::{BandwidthEstimate, BandwidthEstimator, ProbeClusterState};
use crate::config::TransportConfig;
use crate::fec::{FecEncoder, FecSender};
use crate::feedback::TransportFeedbackAdapter;
use crate::packet::{Codec, RtpPacketizer};
use crate::rtp::{Bitrate, DataSize, ExtensionMap, Pt, ReceptionReport, ReportList};
use crate::rtp::{Rtcp, RtpPacket, SenderInfo, SenderReport, SeqNo, Ssrc};
use crate::rtp::{MAX_PADDING_PER_PACKET, VIDEO_CLOCK_RATE};
use crate::stats::{IoStatistics, MediaKind, SenderStats};
use crate::util::{not_happening, rtt_from_report, InstantExt, Soonest};
use crate::Error;

/// Outgoing media stream.
///
/// ```
/// # use std::time::Instant;
/// # use medialink::{SendStream, SendStatus, TransportConfig, BandwidthEstimate};
/// let mut stream = SendStream::new(
///     &TransportConfig::default(),
///     1234.into(),
///     96.into(),
///     move |_: &[u8]| SendStatus::Sent,
///     |e: &BandwidthEstimate| println!("send at {}", e.target),
/// )
/// .unwrap();
///
/// let now = Instant::now();
/// stream.send_frame(&[0; 3000], 90_000, now).unwrap();
/// let _next = stream.process(now);
/// ```
pub struct SendStream {
    ssrc: Ssrc,
    clock_rate: u32,
    exts: ExtensionMap,

    packetizer: RtpPacketizer,
    /// Extended sequence number of the last media or padding packet.
    seq_no: Option<SeqNo>,

    fec: Option<FecSender>,
    fec_seq_no: Option<SeqNo>,

    adapter: TransportFeedbackAdapter,
    bwe: BandwidthEstimator,
    probe: Option<ProbeClusterState>,

    transport: Box<dyn Transport>,
    observer: Box<dyn BitrateObserver>,

    stats: SenderStats,
    io: Option<(Arc<IoStatistics>, MediaKind)>,

    /// RTP time and wallclock of the last frame, to extrapolate the SR rtp time.
    last_frame: Option<(u32, Instant)>,
    /// Round trip time from the remote receiver reports.
    rtt: Option<Duration>,
    /// Last report block the remote sent about this stream.
    remote_report: Option<ReceptionReport>,
}

impl SendStream {
    /// Create a stream sending payload type `pt` on `ssrc`.
    ///
    /// Fails if `pt` has no codec in the config, or if FEC is enabled with bad parameters.
    pub fn new(
        config: &TransportConfig,
        ssrc: Ssrc,
        pt: Pt,
        transport: impl Transport + 'static,
        observer: impl BitrateObserver + 'static,
    ) -> Result<Self, Error> {
        let codec = Codec::for_pt(pt, config.codecs())?;
        let packetizer = RtpPacketizer::new(ssrc, pt, codec, config.max_payload_size());

        let fec = if config.fec().enabled() {
            let fec_config = config.fec();
            let encoder = FecEncoder::new(fec_config.code_rate(), fec_config.max_symbol_size())?;
            Some(FecSender::new(encoder, Ssrc::new(), fec_config.payload_type()))
        } else {
            None
        };

        debug!(
            "Create SendStream {} pt {} codec {:?} fec: {}",
            ssrc,
            pt,
            codec,
            fec.is_some()
        );

        Ok(SendStream {
            ssrc,
            clock_rate: VIDEO_CLOCK_RATE,
            exts: config.extension_map().clone(),
            packetizer,
            seq_no: None,
            fec,
            fec_seq_no: None,
            adapter: TransportFeedbackAdapter::new()
                .with_history_window(config.bwe().history_window()),
            bwe: BandwidthEstimator::new(config.bwe().clone()),
            probe: None,
            transport: Box::new(transport),
            observer: Box::new(observer),
            stats: SenderStats::default(),
            io: None,
            last_frame: None,
            rtt: None,
            remote_report: None,
        })
    }

    /// Clock rate of the RTP timestamps. Defaults to 90kHz.
    pub fn with_clock_rate(mut self, clock_rate: u32) -> Self {
        self.clock_rate = clock_rate;
        self
    }

    /// Count sent bytes in shared I/O statistics.
    pub fn with_io_statistics(mut self, io: Arc<IoStatistics>, kind: MediaKind) -> Self {
        self.io = Some((io, kind));
        self
    }

    pub fn ssrc(&self) -> Ssrc {
        self.ssrc
    }

    /// SSRC of the repair packets, when FEC is enabled.
    pub fn fec_ssrc(&self) -> Option<Ssrc> {
        self.fec.as_ref().map(|f| f.ssrc())
    }

    /// Packetize, protect and send one frame.
    ///
    /// Packets the transport refuses are dropped. They are neither retried nor
    /// counted as sent.
    pub fn send_frame(&mut self, frame: &[u8], rtp_time: u32, now: Instant) -> Result<(), Error> {
        let packets = self.packetizer.packetize(frame, rtp_time, now)?;

        let Some(first) = packets.first() else {
            return Ok(());
        };
        let base_seq = first.header.sequence_number;

        self.last_frame = Some((rtp_time, now));

        let mut raws = Vec::with_capacity(packets.len());

        for packet in &packets {
            let seq_no = packet.header.sequence_number(self.seq_no);
            self.seq_no = Some(seq_no);

            let raw = packet.to_vec(&self.exts);
            if self.send_rtp(self.ssrc, seq_no, &raw, now) {
                self.stats.on_sent(packet.payload.len());
                self.bwe.on_media_sent(DataSize::bytes(raw.len() as u64), now);
            }
            raws.push(raw);
        }

        self.protect(base_seq, &raws, rtp_time, now);

        Ok(())
    }

    fn protect(&mut self, base_seq: u16, raws: &[Vec<u8>], rtp_time: u32, now: Instant) {
        let Some(fec) = &mut self.fec else {
            return;
        };
        let ssrc = fec.ssrc();

        let repairs = match fec.protect(base_seq, raws, rtp_time, now) {
            Ok(v) => v,
            Err(e) => {
                debug!("No FEC for frame at {}: {}", rtp_time, e);
                return;
            }
        };

        trace!("{} repair packets for {} media", repairs.len(), raws.len());

        for packet in repairs {
            let seq_no = packet.header.sequence_number(self.fec_seq_no);
            self.fec_seq_no = Some(seq_no);

            let raw = packet.to_vec(&self.exts);
            self.send_rtp(ssrc, seq_no, &raw, now);
        }
    }

    /// Send a padding only packet of up to `size` padding bytes.
    ///
    /// Returns false if the transport did not take it.
    pub fn send_padding(&mut self, size: usize, now: Instant) -> bool {
        let packet = self.packetizer.padding(size, now);
        self.send_packet(packet, now)
    }

    fn send_packet(&mut self, packet: RtpPacket, now: Instant) -> bool {
        let seq_no = packet.header.sequence_number(self.seq_no);
        self.seq_no = Some(seq_no);

        let raw = packet.to_vec(&self.exts);
        self.send_rtp(self.ssrc, seq_no, &raw, now)
    }

    fn send_rtp(&mut self, ssrc: Ssrc, seq_no: SeqNo, raw: &[u8], now: Instant) -> bool {
        let status = self.transport.send(raw);
        if status != SendStatus::Sent {
            debug!("Drop RTP {} {}: {}", ssrc, seq_no, status);
            return false;
        }

        let size = DataSize::bytes(raw.len() as u64);
        let cluster = self.probe.as_ref().map(|p| p.config().cluster());

        self.adapter.on_sent(ssrc, seq_no, size, cluster, now);

        if let Some(probe) = &mut self.probe {
            probe.record_packet(size, now);
        }
        if let Some((io, kind)) = &self.io {
            io.on_outbound(*kind, raw.len());
        }

        true
    }

    /// Handle a compound RTCP packet from the remote receiver.
    ///
    /// Unparseable packets are logged and dropped.
    pub fn handle_rtcp(&mut self, buf: &[u8], now: Instant) {
        let mut queue = VecDeque::new();
        Rtcp::read_packet(buf, &mut queue);

        for rtcp in queue {
            match rtcp {
                Rtcp::CongestionControlFeedback(fb) => {
                    if let Some(report) = self.adapter.on_feedback(&fb, now) {
                        trace!(
                            "Feedback {} packets, {} lost",
                            report.packets.len(),
                            report.lost_count()
                        );
                        self.bwe.on_feedback(&report);
                    }
                }
                Rtcp::ReceiverReport(rr) => self.handle_reports(&rr.reports, now),
                Rtcp::SenderReport(sr) => self.handle_reports(&sr.reports, now),
            }
        }

        self.notify_estimate();
    }

    fn handle_reports(&mut self, reports: &ReportList<ReceptionReport>, now: Instant) {
        for report in reports.iter().filter(|r| r.ssrc == self.ssrc) {
            let rtt = rtt_from_report(
                now.to_compact_ntp(),
                report.last_sr_delay,
                report.last_sr_time,
            );

            if rtt.is_some() {
                self.rtt = rtt;
            }

            trace!(
                "Report for {} fraction lost {} rtt {:?}",
                self.ssrc,
                report.fraction_lost,
                self.rtt
            );

            self.remote_report = Some(*report);
        }
    }

    /// Drive timers, send probes and notify bitrate changes.
    ///
    /// Returns when this should be called next.
    pub fn process(&mut self, now: Instant) -> Instant {
        self.bwe.process(now);
        self.send_probe(now);
        self.notify_estimate();
        self.poll_timeout()
    }

    fn send_probe(&mut self, now: Instant) {
        if self.probe.is_none() {
            if let Some(config) = self.bwe.poll_probe(now) {
                self.probe = Some(ProbeClusterState::new(config));
            }
        }

        loop {
            let Some(probe) = &mut self.probe else {
                return;
            };
            let cluster = probe.config().cluster();

            if probe.is_complete() {
                self.bwe.end_probe(cluster, now);
                self.probe = None;
                return;
            }

            let Some(size) = probe.next_padding(now) else {
                return;
            };

            let size = size.as_bytes_usize().min(MAX_PADDING_PER_PACKET);
            if !self.send_padding(size, now) {
                debug!("Abort probe cluster {}, transport refused", cluster);
                self.bwe.end_probe(cluster, now);
                self.probe = None;
                return;
            }
        }
    }

    fn notify_estimate(&mut self) {
        if self.bwe.poll_estimate().is_none() {
            return;
        }
        let estimate = self.bwe.estimate();
        self.observer.on_target_bitrate(&estimate);
    }

    pub fn poll_timeout(&self) -> Instant {
        let probe = self.probe.as_ref().and_then(|p| p.poll_timeout());
        Some(self.bwe.poll_timeout())
            .soonest(probe)
            .unwrap_or_else(not_happening)
    }

    /// What the application would like to send. Caps probing.
    pub fn set_desired_bitrate(&mut self, desired: Bitrate) {
        self.bwe.set_desired_bitrate(desired);
    }

    pub fn estimate(&self) -> BandwidthEstimate {
        self.bwe.estimate()
    }

    pub fn bwe(&self) -> &BandwidthEstimator {
        &self.bwe
    }

    pub fn stats(&self) -> SenderStats {
        self.stats
    }

    /// Round trip time measured through the remote receiver reports.
    pub fn rtt(&self) -> Option<Duration> {
        self.rtt
    }

    /// The last report block the remote sent about this stream.
    pub fn remote_report(&self) -> Option<&ReceptionReport> {
        self.remote_report.as_ref()
    }

    /// Bytes sent and not yet covered by feedback.
    pub fn in_flight(&self) -> DataSize {
        self.adapter.in_flight()
    }

    /// Build a sender report for this stream.
    pub fn sender_report(&self, now: Instant) -> SenderReport {
        let rtp_time = match self.last_frame {
            Some((rtp_time, at)) => {
                let elapsed = now.saturating_duration_since(at).as_secs_f64();
                rtp_time.wrapping_add((elapsed * self.clock_rate as f64) as u32)
            }
            None => 0,
        };

        SenderReport {
            sender_info: SenderInfo {
                ssrc: self.ssrc,
                ntp_time: now,
                rtp_time,
                sender_packet_count: self.stats.packets,
                sender_octet_count: self.stats.octets,
            },
            reports: ReportList::new(),
        }
    }

    /// Build and send a sender report through the transport.
    pub fn send_sender_report(&mut self, now: Instant) -> SendStatus {
        let buf = Rtcp::SenderReport(self.sender_report(now)).to_vec();
        self.transport.send(&buf)
    }
}

impl fmt::Debug for SendStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendStream")
            .field("ssrc", &self.ssrc)
            .field("seq_no", &self.seq_no)
            .field("fec", &self.fec)
            .field("bwe", &self.bwe)
            .field("probe", &self.probe)
            .field("stats", &self.stats)
            .field("rtt", &self.rtt)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod test {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::config::{BweConfig, FecConfig};
    use crate::feedback::FeedbackGenerator;
    use crate::rtp::{ReceiverReport, RtpPacket};
    use crate::FeedbackConfig;

    type Sent = Rc<RefCell<Vec<Vec<u8>>>>;

    type Targets = Rc<RefCell<Vec<Bitrate>>>;

    fn stream(config: &TransportConfig, status: SendStatus) -> (SendStream, Sent, Targets) {
        let sent: Sent = Default::default();
        let targets: Targets = Default::default();

        let s = sent.clone();
        let t = targets.clone();
        let stream = SendStream::new(
            config,
            1.into(),
            96.into(),
            move |buf: &[u8]| {
                s.borrow_mut().push(buf.to_vec());
                status
            },
            move |e: &BandwidthEstimate| t.borrow_mut().push(e.target),
        )
        .unwrap();

        (stream, sent, targets)
    }

    fn parse_all(sent: &Sent) -> Vec<RtpPacket> {
        let exts = ExtensionMap::standard();
        sent.borrow()
            .iter()
            .map(|b| RtpPacket::parse(b, &exts).unwrap())
            .collect()
    }

    #[test]
    fn unknown_payload_type() {
        let r = SendStream::new(
            &TransportConfig::default(),
            1.into(),
            33.into(),
            |_: &[u8]| SendStatus::Sent,
            |_: &BandwidthEstimate| {},
        );
        assert_eq!(r.err(), Some(Error::UnsupportedCodec(33.into())));
    }

    #[test]
    fn frame_is_packetized_and_tracked() {
        let now = Instant::now();
        let (mut s, sent, _) = stream(&TransportConfig::default(), SendStatus::Sent);

        s.send_frame(&[1; 3000], 9000, now).unwrap();

        let packets = parse_all(&sent);
        assert_eq!(packets.len(), 3);
        assert!(packets.iter().all(|p| p.header.ssrc == 1.into()));
        assert!(packets[2].header.marker);

        assert_eq!(s.stats().packets, 3);
        assert_eq!(s.stats().octets, 3000);
        assert_eq!(s.adapter.pending(), 3);
    }

    #[test]
    fn refused_packets_are_not_tracked() {
        let now = Instant::now();
        let (mut s, sent, _) = stream(&TransportConfig::default(), SendStatus::WouldBlock);

        s.send_frame(&[1; 3000], 9000, now).unwrap();

        // Tried once each, never retried.
        assert_eq!(sent.borrow().len(), 3);
        assert_eq!(s.stats().packets, 0);
        assert_eq!(s.adapter.pending(), 0);
        assert_eq!(s.in_flight(), DataSize::ZERO);
    }

    #[test]
    fn history_window_from_config() {
        let now = Instant::now();
        let config = TransportConfig::default()
            .set_bwe(BweConfig::default().set_history_window(Duration::from_secs(1)));
        let (mut s, _, _) = stream(&config, SendStatus::Sent);

        s.send_frame(&[1; 3000], 0, now).unwrap();
        let one_frame = s.in_flight();
        assert!(one_frame > DataSize::ZERO);

        // The unanswered first frame is forgotten once the second goes out.
        s.send_frame(&[1; 3000], 3000, now + Duration::from_secs(2)).unwrap();
        assert_eq!(s.in_flight(), one_frame);
    }

    #[test]
    fn fec_repair_packets_follow_media() {
        let now = Instant::now();
        let config = TransportConfig::default().set_fec(FecConfig::default().set_enabled(true));
        let (mut s, sent, _) = stream(&config, SendStatus::Sent);
        let fec_ssrc = s.fec_ssrc().unwrap();

        s.send_frame(&[1; 4000], 9000, now).unwrap();

        let packets = parse_all(&sent);
        let media = packets.iter().filter(|p| p.header.ssrc == 1.into()).count();
        let repair: Vec<_> = packets
            .iter()
            .filter(|p| p.header.ssrc == fec_ssrc)
            .collect();

        assert_eq!(media, 4);
        // Code rate 0.8 for 4 packets gives 5 symbols.
        assert_eq!(repair.len(), 1);
        assert_eq!(repair[0].header.payload_type, 127.into());
        assert_eq!(s.adapter.pending(), 5);
    }

    #[test]
    fn start_bitrate_reported_once() {
        let now = Instant::now();
        let (mut s, _, targets) = stream(&TransportConfig::default(), SendStatus::Sent);

        s.process(now);
        s.process(now + Duration::from_millis(10));

        assert_eq!(targets.borrow().as_slice(), &[Bitrate::kbps(300)]);
    }

    #[test]
    fn first_process_sends_probe_padding() {
        let now = Instant::now();
        let (mut s, sent, _) = stream(&TransportConfig::default(), SendStatus::Sent);

        let mut t = now;
        for _ in 0..200 {
            let next = s.process(t);
            t = next.min(t + Duration::from_millis(5)).max(t + Duration::from_micros(100));
        }

        let packets = parse_all(&sent);
        assert!(packets.len() >= 5, "{}", packets.len());
        assert!(packets.iter().all(|p| p.is_padding()));
        assert!(s.probe.is_none(), "probe ended");
    }

    #[test]
    fn feedback_reaches_estimator() {
        let now = Instant::now();
        let (mut s, sent, _) = stream(&TransportConfig::default(), SendStatus::Sent);

        s.send_frame(&[1; 3000], 9000, now).unwrap();
        assert!(s.in_flight() > DataSize::ZERO);

        let mut generator = FeedbackGenerator::new(2.into(), FeedbackConfig::default());
        let arrival = now + Duration::from_millis(20);
        for p in parse_all(&sent) {
            generator.on_received(
                p.header.ssrc,
                p.header.sequence_number,
                p.header.marker,
                0,
                arrival,
            );
        }

        let at = arrival + Duration::from_millis(100);
        generator.process(at);
        let fb = generator.poll_feedback().expect("feedback");

        let buf = Rtcp::CongestionControlFeedback(fb).to_vec();
        s.handle_rtcp(&buf, at + Duration::from_millis(20));

        assert_eq!(s.in_flight(), DataSize::ZERO);
    }

    #[test]
    fn rtt_from_receiver_report() {
        let now = Instant::now();
        let (mut s, _, _) = stream(&TransportConfig::default(), SendStatus::Sent);

        let sr_time = now;
        let mut reports = ReportList::new();
        reports
            .push(ReceptionReport {
                ssrc: 1.into(),
                fraction_lost: 0,
                packets_lost: 0,
                max_seq: 0,
                jitter: 0,
                last_sr_time: sr_time.to_compact_ntp(),
                // 50ms in 1/65536 seconds.
                last_sr_delay: 3277,
            })
            .unwrap();

        let rr = Rtcp::ReceiverReport(ReceiverReport {
            sender_ssrc: 2.into(),
            reports,
        });

        s.handle_rtcp(&rr.to_vec(), now + Duration::from_millis(200));

        let rtt = s.rtt().unwrap();
        assert!(
            rtt > Duration::from_millis(148) && rtt < Duration::from_millis(152),
            "{:?}",
            rtt
        );
        assert!(s.remote_report().is_some());
    }

    #[test]
    fn sender_report_extrapolates_rtp_time() {
        let now = Instant::now();
        let (mut s, _, _) = stream(&TransportConfig::default(), SendStatus::Sent);

        s.send_frame(&[1; 100], 9000, now).unwrap();

        let sr = s.sender_report(now + Duration::from_millis(100));
        assert_eq!(sr.sender_info.ssrc, 1.into());
        assert_eq!(sr.sender_info.rtp_time, 18000);
        assert_eq!(sr.sender_info.sender_packet_count, 1);
        assert_eq!(sr.sender_info.sender_octet_count, 100);
    }
}

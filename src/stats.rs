//! Statistics: I/O bitrates and RTCP reception/sender counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::rtp::{extend_recv_u16, Bitrate, DataSize, ReceptionReport, SeqNo, Ssrc};
use crate::rtp::RECV_SEQ_BASE;

/// How often [`IoStatistics::process`] produces new bitrates.
const IO_INTERVAL: Duration = Duration::from_millis(1000);

/// Kind of media carried by a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Video,
    Audio,
    Data,
}

impl MediaKind {
    fn index(&self) -> usize {
        match self {
            MediaKind::Video => 0,
            MediaKind::Audio => 1,
            MediaKind::Data => 2,
        }
    }
}

/// Bitrates per media kind in one direction.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct KindRates {
    pub video: Bitrate,
    pub audio: Bitrate,
    pub data: Bitrate,
}

impl KindRates {
    pub fn total(&self) -> Bitrate {
        self.video + self.audio + self.data
    }
}

/// Per second bitrates computed by [`IoStatistics`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct IoStats {
    pub inbound: KindRates,
    pub outbound: KindRates,
}

#[derive(Debug, Default)]
struct Counters {
    bytes: [AtomicU64; 3],
    /// Last computed rate in bits per second.
    rates: [AtomicU64; 3],
}

impl Counters {
    fn add(&self, kind: MediaKind, bytes: usize) {
        self.bytes[kind.index()].fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn roll(&self, elapsed: Duration) {
        for (bytes, rate) in self.bytes.iter().zip(self.rates.iter()) {
            let taken = DataSize::bytes(bytes.swap(0, Ordering::Relaxed));
            rate.store((taken / elapsed).as_u64(), Ordering::Relaxed);
        }
    }

    fn rates(&self) -> KindRates {
        let load = |i: usize| Bitrate::new(self.rates[i].load(Ordering::Relaxed));
        KindRates {
            video: load(0),
            audio: load(1),
            data: load(2),
        }
    }
}

/// Inbound and outbound byte counters per media kind.
///
/// Counters are written from the send and receive paths and can be shared between
/// threads. The values read through [`snapshot()`][Self::snapshot] are eventually
/// consistent.
#[derive(Debug, Default)]
pub struct IoStatistics {
    inbound: Counters,
    outbound: Counters,
    last_process: Mutex<Option<Instant>>,
}

impl IoStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_inbound(&self, kind: MediaKind, bytes: usize) {
        self.inbound.add(kind, bytes);
    }

    pub fn on_outbound(&self, kind: MediaKind, bytes: usize) {
        self.outbound.add(kind, bytes);
    }

    /// Compute new bitrates if a second has passed since the last time.
    pub fn process(&self, now: Instant) -> Option<IoStats> {
        let mut last = match self.last_process.lock() {
            Ok(v) => v,
            Err(poisoned) => poisoned.into_inner(),
        };

        let Some(previous) = *last else {
            *last = Some(now);
            return None;
        };

        let elapsed = now.saturating_duration_since(previous);
        if elapsed < IO_INTERVAL {
            return None;
        }

        self.inbound.roll(elapsed);
        self.outbound.roll(elapsed);
        *last = Some(now);

        let stats = self.snapshot();
        trace!(
            "IO in: {} out: {}",
            stats.inbound.total(),
            stats.outbound.total()
        );

        Some(stats)
    }

    /// The bitrates of the last completed interval.
    pub fn snapshot(&self) -> IoStats {
        IoStats {
            inbound: self.inbound.rates(),
            outbound: self.outbound.rates(),
        }
    }

    /// When `process` should next be called.
    pub fn poll_timeout(&self) -> Option<Instant> {
        let last = match self.last_process.lock() {
            Ok(v) => *v,
            Err(poisoned) => *poisoned.into_inner(),
        };
        last.map(|t| t + IO_INTERVAL)
    }
}

/// Reception statistics of one inbound stream (RFC 3550 A.3 and A.8).
#[derive(Debug)]
pub struct ReceptionStats {
    ssrc: Ssrc,
    clock_rate: u32,
    first: Option<SeqNo>,
    max_seq: Option<SeqNo>,
    received: u64,
    expected_prior: i64,
    received_prior: i64,
    /// Interarrival jitter in RTP timestamp units.
    jitter: f64,
    prior: Option<(Instant, u32)>,
}

impl ReceptionStats {
    pub fn new(ssrc: Ssrc, clock_rate: u32) -> Self {
        Self {
            ssrc,
            clock_rate,
            first: None,
            max_seq: None,
            received: 0,
            expected_prior: 0,
            received_prior: 0,
            jitter: 0.0,
            prior: None,
        }
    }

    /// Register a received packet. Returns the extended sequence number.
    pub fn update(&mut self, seq: u16, rtp_time: u32, arrival: Instant) -> SeqNo {
        let ext: SeqNo = extend_recv_u16(self.max_seq.map(|s| *s), seq).into();

        self.first = Some(self.first.map_or(ext, |f| f.min(ext)));
        self.max_seq = Some(self.max_seq.map_or(ext, |m| m.max(ext)));
        self.received += 1;

        self.update_jitter(arrival, rtp_time);

        ext
    }

    fn update_jitter(&mut self, arrival: Instant, rtp_time: u32) {
        let Some((prior_arrival, prior_rtp)) = self.prior else {
            self.prior = Some((arrival, rtp_time));
            return;
        };

        // Packets of the same frame share a timestamp. Only the first counts.
        if prior_rtp == rtp_time {
            return;
        }

        let arrival_delta = if arrival >= prior_arrival {
            (arrival - prior_arrival).as_secs_f64()
        } else {
            -(prior_arrival - arrival).as_secs_f64()
        };
        let arrival_units = arrival_delta * self.clock_rate as f64;
        let rtp_units = rtp_time.wrapping_sub(prior_rtp) as i32 as f64;

        let d = (arrival_units - rtp_units).abs();
        self.jitter += (d - self.jitter) / 16.0;

        self.prior = Some((arrival, rtp_time));
    }

    pub fn ssrc(&self) -> Ssrc {
        self.ssrc
    }

    pub fn max_seq(&self) -> Option<SeqNo> {
        self.max_seq
    }

    pub fn jitter(&self) -> f64 {
        self.jitter
    }

    /// Produce a report block. The fraction lost counts since the previous call.
    ///
    /// `last_sr` is the compact NTP time of the last sender report received and the
    /// delay since, in 1/65536 seconds.
    pub fn report(&mut self, last_sr: Option<(u32, u32)>) -> Option<ReceptionReport> {
        let first = self.first?;
        let max = self.max_seq?;

        let expected = (*max - *first) as i64 + 1;
        let received = self.received as i64;

        let expected_interval = expected - self.expected_prior;
        let received_interval = received - self.received_prior;
        self.expected_prior = expected;
        self.received_prior = received;

        let lost_interval = expected_interval - received_interval;
        let fraction_lost = if expected_interval <= 0 || lost_interval <= 0 {
            0
        } else {
            ((lost_interval << 8) / expected_interval).min(255) as u8
        };

        let (last_sr_time, last_sr_delay) = last_sr.unwrap_or((0, 0));

        Some(ReceptionReport {
            ssrc: self.ssrc,
            fraction_lost,
            packets_lost: packets_lost(expected - received),
            max_seq: max.saturating_sub(RECV_SEQ_BASE) as u32,
            jitter: self.jitter as u32,
            last_sr_time,
            last_sr_delay,
        })
    }
}

/// Cumulative loss is a signed 24 bit number, clamped rather than wrapped.
fn packets_lost(lost: i64) -> u32 {
    let clamped = lost.clamp(-0x80_0000, 0x7f_ffff);
    (clamped as i32 as u32) & 0x00ff_ffff
}

/// Sent packet and octet counts for the SR sender info.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SenderStats {
    pub packets: u32,
    /// Payload octets, excluding headers and padding.
    pub octets: u32,
}

impl SenderStats {
    pub fn on_sent(&mut self, payload_len: usize) {
        self.packets = self.packets.wrapping_add(1);
        self.octets = self.octets.wrapping_add(payload_len as u32);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn io_rates_per_second() {
        let now = Instant::now();
        let io = IoStatistics::new();

        assert_eq!(io.process(now), None);

        io.on_inbound(MediaKind::Video, 100_000);
        io.on_inbound(MediaKind::Audio, 4_000);
        io.on_outbound(MediaKind::Data, 1_000);

        assert_eq!(io.process(now + Duration::from_millis(500)), None);

        let stats = io.process(now + Duration::from_secs(1)).unwrap();
        assert_eq!(stats.inbound.video, Bitrate::kbps(800));
        assert_eq!(stats.inbound.audio, Bitrate::kbps(32));
        assert_eq!(stats.inbound.total(), Bitrate::kbps(832));
        assert_eq!(stats.outbound.data, Bitrate::kbps(8));
        assert_eq!(io.snapshot(), stats);

        // Counters were reset.
        let stats = io.process(now + Duration::from_secs(2)).unwrap();
        assert_eq!(stats.inbound.total(), Bitrate::ZERO);
    }

    #[test]
    fn jitter_zero_for_steady_arrival() {
        let start = Instant::now();
        let mut r = ReceptionStats::new(1.into(), 90_000);

        for i in 0..10_u32 {
            let arrival = start + Duration::from_millis(10 * i as u64);
            r.update(i as u16, 1234 + i * 900, arrival);
        }
        assert!(r.jitter() < 1e-6, "{}", r.jitter());
    }

    #[test]
    fn jitter_converges() {
        let start = Instant::now();
        let mut r = ReceptionStats::new(1.into(), 90_000);

        // Arrivals alternate 1ms early and late, 2ms or 180 units apart from expected.
        for i in 4..1000_u32 {
            let nominal = start + Duration::from_millis(10 * i as u64);
            let arrival = if i % 2 == 0 {
                nominal - Duration::from_millis(1)
            } else {
                nominal + Duration::from_millis(1)
            };
            r.update(i as u16, 1234 + i * 900, arrival);
        }

        assert!((r.jitter() - 180.0).abs() < 0.5, "{}", r.jitter());
    }

    #[test]
    fn report_fraction_and_cumulative_loss() {
        let now = Instant::now();
        let mut r = ReceptionStats::new(7.into(), 90_000);

        for seq in 10..14 {
            r.update(seq, 0, now);
        }
        r.update(19, 0, now);

        let report = r.report(Some((0x1234_5678, 0x10000))).unwrap();
        assert_eq!(report.ssrc, 7.into());
        assert_eq!(report.fraction_lost, 128);
        assert_eq!(report.packets_lost, 5);
        assert_eq!(report.max_seq, 19);
        assert_eq!(report.last_sr_time, 0x1234_5678);
        assert_eq!(report.last_sr_delay, 0x10000);

        // Nothing new, nothing lost since.
        let report = r.report(None).unwrap();
        assert_eq!(report.fraction_lost, 0);
        assert_eq!(report.packets_lost, 5);
    }

    #[test]
    fn extended_seq_across_wrap() {
        let now = Instant::now();
        let mut r = ReceptionStats::new(1.into(), 90_000);

        for seq in [65534, 65535, 0, 1] {
            r.update(seq, 0, now);
        }

        let report = r.report(None).unwrap();
        assert_eq!(report.max_seq, 65537);
        assert_eq!(report.packets_lost, 0);
    }

    #[test]
    fn reorder_before_first_packet() {
        let now = Instant::now();
        let mut r = ReceptionStats::new(1.into(), 90_000);

        // 65535 and 0 were sent before 1.
        for seq in [1, 65535, 0, 2] {
            r.update(seq, 0, now);
        }

        let report = r.report(None).unwrap();
        assert_eq!(report.packets_lost, 0);
        assert_eq!(report.fraction_lost, 0);
        assert_eq!(report.max_seq, 2);
    }

    #[test]
    fn negative_loss_from_duplicates() {
        let now = Instant::now();
        let mut r = ReceptionStats::new(1.into(), 90_000);
        r.update(1, 0, now);
        r.update(1, 0, now);

        let report = r.report(None).unwrap();
        assert_eq!(report.packets_lost, 0x00ff_ffff);
    }
}

#![allow(unused)]
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Once;
use std::time::{Duration, Instant};

use medialink::{BandwidthEstimate, Bitrate, DataSize, ReceivedFrame, RecvStream};
use medialink::{SendStatus, SendStream, TransportConfig};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub fn init_log() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    static START: Once = Once::new();

    START.call_once(|| {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(env_filter)
            .init();
    });
}

/// One direction of a simulated network path.
///
/// Packets queue behind a bottleneck of `capacity`, then take `delay` to arrive.
/// Each packet is lost with probability `loss`.
pub struct Link {
    capacity: Option<Bitrate>,
    delay: Duration,
    loss: f64,
    rng: StdRng,
    free_at: Option<Instant>,
    queue: VecDeque<(Instant, Vec<u8>)>,
    pub lost: usize,
}

impl Link {
    pub fn new(capacity: Option<Bitrate>, delay: Duration, loss: f64, seed: u64) -> Self {
        Link {
            capacity,
            delay,
            loss,
            rng: StdRng::seed_from_u64(seed),
            free_at: None,
            queue: VecDeque::new(),
            lost: 0,
        }
    }

    pub fn perfect() -> Self {
        Link::new(None, Duration::from_millis(10), 0.0, 0)
    }

    pub fn send(&mut self, buf: Vec<u8>, now: Instant) {
        let departure = match self.capacity {
            Some(capacity) => {
                let start = self.free_at.map_or(now, |f| f.max(now));
                let size = DataSize::bytes(buf.len() as u64);
                let done = start + size / capacity;
                self.free_at = Some(done);
                done
            }
            None => now,
        };

        if self.loss > 0.0 && self.rng.random::<f64>() < self.loss {
            self.lost += 1;
            return;
        }

        self.queue.push_back((departure + self.delay, buf));
    }

    pub fn poll(&mut self, now: Instant) -> Option<Vec<u8>> {
        let (at, _) = self.queue.front()?;
        if *at > now {
            return None;
        }
        self.queue.pop_front().map(|(_, buf)| buf)
    }
}

type Shared<T> = Rc<RefCell<Vec<T>>>;

/// A send and a receive stream connected through simulated links.
///
/// A simple encoder sends 30 frames per second sized after the latest target bitrate.
pub struct Session {
    pub now: Instant,
    pub send: SendStream,
    pub recv: RecvStream,
    pub forward: Link,
    pub backward: Link,
    pub frames: Shared<ReceivedFrame>,
    pub targets: Shared<Bitrate>,
    outbox: Shared<Vec<u8>>,
    next_frame: Instant,
    next_sr: Instant,
    rtp_time: u32,
    pub frames_sent: usize,
}

const FRAME_INTERVAL: Duration = Duration::from_micros(33_333);
const SR_INTERVAL: Duration = Duration::from_millis(1000);

/// RTCP packet types 192-223 are never RTP payload types (RFC 5761).
pub fn is_rtcp(buf: &[u8]) -> bool {
    buf.len() > 1 && (192..=223).contains(&buf[1])
}

impl Session {
    pub fn new(config: &TransportConfig, forward: Link, backward: Link) -> Self {
        let now = Instant::now();

        let outbox: Shared<Vec<u8>> = Default::default();
        let targets: Shared<Bitrate> = Default::default();
        let frames: Shared<ReceivedFrame> = Default::default();

        let o = outbox.clone();
        let t = targets.clone();
        let send = SendStream::new(
            config,
            1111.into(),
            96.into(),
            move |buf: &[u8]| {
                o.borrow_mut().push(buf.to_vec());
                SendStatus::Sent
            },
            move |e: &BandwidthEstimate| t.borrow_mut().push(e.target),
        )
        .expect("send stream");

        let f = frames.clone();
        let recv = RecvStream::new(config, 2222.into(), 96.into(), move |frame: ReceivedFrame| {
            f.borrow_mut().push(frame)
        })
        .expect("recv stream");

        Session {
            now,
            send,
            recv,
            forward,
            backward,
            frames,
            targets,
            outbox,
            next_frame: now,
            next_sr: now + SR_INTERVAL,
            rtp_time: 0,
            frames_sent: 0,
        }
    }

    pub fn target(&self) -> Bitrate {
        self.send.estimate().target
    }

    /// Advance time by `step`, moving packets in both directions.
    pub fn tick(&mut self, step: Duration) {
        self.now += step;
        let now = self.now;

        if now >= self.next_frame {
            let size = (self.target() * FRAME_INTERVAL).as_bytes_usize().max(100);
            let frame = vec![(self.frames_sent % 251) as u8; size];
            self.send
                .send_frame(&frame, self.rtp_time, now)
                .expect("send frame");
            self.frames_sent += 1;
            self.rtp_time = self.rtp_time.wrapping_add(3000);
            self.next_frame += FRAME_INTERVAL;
        }

        if now >= self.next_sr {
            self.send.send_sender_report(now);
            self.next_sr += SR_INTERVAL;
        }

        self.send.process(now);
        self.flush_outbox();

        while let Some(buf) = self.forward.poll(now) {
            if is_rtcp(&buf) {
                self.recv.handle_rtcp(&buf, now);
                continue;
            }
            // Losses surface as errors from the assembler. The stream carries on.
            let _ = self.recv.handle_rtp(&buf, now);
        }

        for rtcp in self.recv.process(now) {
            self.backward.send(rtcp.to_vec(), now);
        }

        while let Some(buf) = self.backward.poll(now) {
            self.send.handle_rtcp(&buf, now);
        }
    }

    fn flush_outbox(&mut self) {
        let packets: Vec<_> = self.outbox.borrow_mut().drain(..).collect();
        for buf in packets {
            self.forward.send(buf, self.now);
        }
    }

    pub fn run_for(&mut self, duration: Duration) {
        let end = self.now + duration;
        while self.now < end {
            self.tick(Duration::from_millis(1));
        }
    }
}

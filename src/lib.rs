//! A Sans I/O real-time media transport core in Rust.
//!
//! medialink moves encoded media frames over RTP with send side congestion control,
//! forward error correction and RTCP feedback. Like the rest of the sans I/O family it
//! has no sockets, threads or timers. Packets are handed in as byte slices, time is
//! handed in as `now` and everything outgoing goes through the [`Transport`] trait or
//! is returned to the caller.
//!
//! # Overview
//!
//! ```text
//!            frame                                                   frame
//!              |                                                       ^
//!     +--------v---------+          RTP (media + repair)      +--------+---------+
//!     |    SendStream    |  ------------------------------->  |    RecvStream    |
//!     | packetize, FEC,  |                                    | FEC recovery,    |
//!     | bandwidth estim. |  <-------------------------------  | frame assembly,  |
//!     +------------------+     RTCP (CCFB, RR)                | feedback         |
//!                                                             +------------------+
//! ```
//!
//! The sender side:
//!
//! * [`RtpPacketizer`][packet::RtpPacketizer] splits frames into RTP packets.
//! * [`FecSender`][fec::FecSender] adds repair packets from a Reed-Solomon code.
//! * [`TransportFeedbackAdapter`][feedback::TransportFeedbackAdapter] remembers what was
//!   sent and matches RFC 8888 congestion control feedback against it.
//! * [`BandwidthEstimator`] combines delay based, loss based and probe based estimates
//!   into a target bitrate.
//!
//! The receiver side:
//!
//! * [`FecReceiver`][fec::FecReceiver] recovers lost packets.
//! * [`FrameAssembler`][packet::FrameAssembler] reorders packets and emits frames.
//! * [`FeedbackGenerator`][feedback::FeedbackGenerator] reports arrival times, limiting
//!   its own bitrate to a share of the media.
//! * [`ReceptionStats`][stats::ReceptionStats] feeds the receiver reports.
//!
//! # Usage
//!
//! ```
//! use std::cell::RefCell;
//! use std::rc::Rc;
//! use std::time::{Duration, Instant};
//!
//! use medialink::{BandwidthEstimate, ReceivedFrame, RecvStream, SendStatus, SendStream};
//! use medialink::TransportConfig;
//!
//! let config = TransportConfig::default();
//!
//! let wire: Rc<RefCell<Vec<Vec<u8>>>> = Default::default();
//! let w = wire.clone();
//!
//! let mut send = SendStream::new(
//!     &config,
//!     1234.into(),
//!     96.into(),
//!     move |buf: &[u8]| {
//!         // A real transport writes to a socket.
//!         w.borrow_mut().push(buf.to_vec());
//!         SendStatus::Sent
//!     },
//!     |e: &BandwidthEstimate| println!("encode at {}", e.target),
//! )
//! .unwrap();
//!
//! let mut recv = RecvStream::new(&config, 5678.into(), 96.into(), |f: ReceivedFrame| {
//!     println!("frame of {} bytes", f.data.len())
//! })
//! .unwrap();
//!
//! let now = Instant::now();
//! send.send_frame(&[0; 5000], 0, now).unwrap();
//!
//! for buf in wire.borrow_mut().drain(..) {
//!     recv.handle_rtp(&buf, now).ok();
//! }
//!
//! let later = now + Duration::from_millis(100);
//! for rtcp in recv.process(later) {
//!     send.handle_rtcp(&rtcp.to_vec(), later);
//! }
//!
//! // Drive both sides from the returned timeouts.
//! let _next = send.process(later).min(recv.poll_timeout());
//! ```
//!
//! # Logging
//!
//! Logging goes through [`tracing`]. Nothing is logged above `info` in the normal case;
//! `debug` covers state changes and `trace` every packet.

#![forbid(unsafe_code)]
#![allow(clippy::new_without_default)]
#![allow(clippy::manual_range_contains)]
#![allow(clippy::get_first)]

#[macro_use]
extern crate tracing;

pub mod bwe;
pub use bwe::{BandwidthEstimate, BandwidthEstimator, BweState};

mod config;
pub use config::{BweConfig, FecConfig, FeedbackConfig, TransportConfig};

mod error;
pub use error::Error;

pub mod fec;

pub mod feedback;

pub mod packet;

pub mod rtp;
pub use rtp::{Bitrate, DataSize};

pub mod stats;
pub use stats::{IoStatistics, MediaKind};

mod streams;
pub use streams::{BitrateObserver, FrameSink, ReceivedFrame, Transport};
pub use streams::{RecvStream, SendStatus, SendStream};

mod util;
pub use util::InstantExt;

/// Log a CSV like stat to stdout.
///
/// ```ignore
/// log_stat!("MY_STAT", 1, "hello", 3);
/// ```
///
/// will result in the following being printed
///
/// ```text
/// MY_STAT 1, hello, 3, {unix_timestamp_ms}
/// ````
///
/// These logs can be easily grepped for, parsed and graphed, or otherwise analyzed.
///
/// This macro turns into a NO-OP if the `_internal_dont_use_log_stats` feature is not enabled
macro_rules! log_stat {
    ($name:expr, $($arg:expr),+) => {
        #[cfg(feature = "_internal_dont_use_log_stats")]
        {
            use std::time::SystemTime;
            use std::io::{self, Write};

            let now = SystemTime::now();
            let since_epoch = now.duration_since(SystemTime::UNIX_EPOCH).unwrap_or_default();
            let unix_time_ms = since_epoch.as_millis();
            let mut lock = io::stdout().lock();
            let _ = write!(lock, "{} ", $name);

            $(
                let _ = write!(lock, "{},", $arg);
            )+
            let _ = writeln!(lock, "{}", unix_time_ms);
        }
    };
}
pub(crate) use log_stat;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn config_is_send_and_sync() {
        fn is_send<T: Send>(_t: T) {}
        fn is_sync<T: Sync>(_t: T) {}
        is_send(TransportConfig::default());
        is_sync(TransportConfig::default());
    }

    #[test]
    fn io_statistics_is_shareable() {
        fn is_send<T: Send + Sync>(_t: T) {}
        is_send(std::sync::Arc::new(IoStatistics::new()));
    }

    #[test]
    fn estimator_is_send() {
        fn is_send<T: Send>(_t: T) {}
        is_send(BandwidthEstimator::new(BweConfig::default()));
    }
}

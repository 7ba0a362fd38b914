//! Frames crossing a lossy path with forward error correction.

use std::time::Duration;

use medialink::{Bitrate, BweConfig, FecConfig, TransportConfig};

mod common;
use common::{init_log, Link, Session};

fn lossy_session(fec: bool, seed: u64) -> Session {
    let config = TransportConfig::default()
        .set_bwe(BweConfig::default().set_start_bitrate(Bitrate::mbps(2)))
        .set_fec(FecConfig::default().set_enabled(fec).set_code_rate(0.5));

    let forward = Link::new(None, Duration::from_millis(20), 0.05, seed);
    let backward = Link::new(None, Duration::from_millis(20), 0.0, seed + 1);

    Session::new(&config, forward, backward)
}

#[test]
pub fn fec_recovers_random_loss() {
    init_log();

    let mut session = lossy_session(true, 11);
    session.run_for(Duration::from_secs(10));

    assert!(session.forward.lost > 0);
    assert!(session.send.fec_ssrc().is_some());

    let frames = session.frames.borrow();
    let delivered = frames.len() as f64 / session.frames_sent as f64;
    assert!(delivered >= 0.9, "delivered {}", delivered);

    let recovered = frames.iter().filter(|f| f.recovered).count();
    assert!(recovered > 0, "no frame needed recovery");

    // Recovered frames carry the same bytes as any other.
    for f in frames.iter().filter(|f| f.recovered) {
        assert!(f.data.iter().all(|b| *b == f.data[0]));
    }
}

#[test]
pub fn without_fec_nothing_is_recovered() {
    init_log();

    let mut session = lossy_session(false, 11);
    session.run_for(Duration::from_secs(5));

    assert!(session.forward.lost > 0);
    assert!(session.send.fec_ssrc().is_none());

    let frames = session.frames.borrow();
    assert!(frames.iter().all(|f| !f.recovered));

    // Frames hit by loss are gone, the rest keep coming.
    let delivered = frames.len() as f64 / session.frames_sent as f64;
    assert!(frames.len() < session.frames_sent);
    assert!(delivered >= 0.25, "delivered {}", delivered);

    for f in frames.iter() {
        assert!(f.data.iter().all(|b| *b == f.data[0]));
    }

    // Delivery carries on to the end of the run.
    let last = frames.iter().map(|f| f.rtp_time).max().unwrap_or(0);
    let last_sent = (session.frames_sent as u32 - 1) * 3000;
    assert!(last + 10 * 3000 >= last_sent, "last {} of {}", last, last_sent);
}

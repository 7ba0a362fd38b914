//! Bandwidth estimation over simulated network paths.

use std::time::Duration;

use medialink::{Bitrate, BweState, TransportConfig};

mod common;
use common::{init_log, Link, Session};

#[test]
pub fn bwe_unchanged_without_feedback() {
    init_log();

    // Nothing ever comes back.
    let forward = Link::new(None, Duration::from_millis(20), 1.0, 1);
    let mut session = Session::new(&TransportConfig::default(), forward, Link::perfect());

    session.run_for(Duration::from_secs(3));

    assert_eq!(session.target(), Bitrate::kbps(300));
    assert!(session.frames.borrow().is_empty());
    assert_ne!(session.send.bwe().state(), BweState::Initial);
}

#[test]
pub fn bwe_grows_on_a_fast_link() {
    init_log();

    let forward = Link::new(Some(Bitrate::mbps(10)), Duration::from_millis(20), 0.0, 1);
    let backward = Link::new(None, Duration::from_millis(20), 0.0, 2);
    let mut session = Session::new(&TransportConfig::default(), forward, backward);
    session.send.set_desired_bitrate(Bitrate::mbps(2));

    session.run_for(Duration::from_secs(10));

    let target = session.target();
    assert!(target > Bitrate::kbps(300), "target {}", target);
    assert!(target <= Bitrate::mbps(20), "target {}", target);

    // The observer saw the changes.
    let targets = session.targets.borrow();
    assert_eq!(targets.first(), Some(&Bitrate::kbps(300)));
    assert_eq!(targets.last(), Some(&target));

    // Frames made it across.
    let frames = session.frames.borrow().len();
    assert!(frames as f64 >= session.frames_sent as f64 * 0.9, "{}", frames);

    // Both round trip measurements see the 40ms path.
    let rr_rtt = session.send.rtt().expect("rtt from receiver reports");
    assert!(rr_rtt >= Duration::from_millis(39), "{:?}", rr_rtt);
    assert!(rr_rtt < Duration::from_millis(200), "{:?}", rr_rtt);

    let feedback_rtt = session.send.estimate().rtt.expect("rtt from feedback");
    assert!(feedback_rtt >= Duration::from_millis(40), "{:?}", feedback_rtt);
}

#[test]
pub fn bwe_stays_below_a_slow_link() {
    init_log();

    let capacity = Bitrate::kbps(500);
    let forward = Link::new(Some(capacity), Duration::from_millis(30), 0.0, 1);
    let backward = Link::new(None, Duration::from_millis(30), 0.0, 2);

    let config = TransportConfig::default().set_bwe(
        medialink::BweConfig::default().set_start_bitrate(Bitrate::kbps(400)),
    );
    let mut session = Session::new(&config, forward, backward);
    session.send.set_desired_bitrate(Bitrate::mbps(5));

    session.run_for(Duration::from_secs(30));

    let target = session.target();
    assert!(target < capacity * 3.0, "target {}", target);
    assert!(target >= Bitrate::kbps(30), "target {}", target);
}

#[test]
pub fn bwe_sees_random_loss() {
    init_log();

    let forward = Link::new(Some(Bitrate::mbps(10)), Duration::from_millis(20), 0.1, 7);
    let backward = Link::new(None, Duration::from_millis(20), 0.0, 8);
    let mut session = Session::new(&TransportConfig::default(), forward, backward);

    session.run_for(Duration::from_secs(5));

    assert!(session.forward.lost > 0);
    let loss = session.send.estimate().loss_fraction;
    assert!(loss > 0.03 && loss < 0.3, "loss {}", loss);
}

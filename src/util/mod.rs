use std::time::{Duration, Instant};

mod average;
pub(crate) use average::MovingAverage;

mod time_tricks;
pub use time_tricks::InstantExt;
pub(crate) use time_tricks::{already_happened, not_happening};

pub(crate) trait Soonest {
    fn soonest(self, other: Self) -> Self;
}

impl Soonest for Option<Instant> {
    fn soonest(self, other: Self) -> Self {
        match (self, other) {
            (Some(v1), Some(v2)) => Some(v1.min(v2)),
            (None, v) => v,
            (v, None) => v,
        }
    }
}

/// Round trip time from a reception report block.
///
/// `now` is the compact NTP time the report arrived. `dlsr` and `lsr` are echoed from the
/// block, all in 1/65536 s. See [RFC 3550 6.4.1](https://www.rfc-editor.org/rfc/rfc3550#section-6.4.1).
pub(crate) fn rtt_from_report(now: u32, dlsr: u32, lsr: u32) -> Option<Duration> {
    // The remote has not seen a sender report.
    if lsr == 0 {
        return None;
    }

    let rtt = now.wrapping_sub(lsr).checked_sub(dlsr)?;

    // A wrapped result means the clocks or the report are off.
    if rtt > u32::MAX / 2 {
        return None;
    }

    Some(Duration::from_micros(rtt as u64 * 1_000_000 / 65536))
}

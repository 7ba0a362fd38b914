use std::time::SystemTime;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;

/// Seconds from 1900-01-01 (NTP epoch) to 1970-01-01 (unix epoch).
const NTP_UNIX_OFFSET: Duration = Duration::from_secs(2_208_988_800);

/// Pairs an [`Instant`] with the wall clock time it was taken at.
///
/// Wire formats want wall clock time, everything else in the crate runs on the `now: Instant`
/// handed in by the caller. All conversions go through this one anchor.
struct Anchor {
    instant: Instant,
    ntp: Duration,
}

static ANCHOR: Lazy<Anchor> = Lazy::new(|| {
    let now = Instant::now();
    let unix = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or(Duration::ZERO);

    // Move the anchor back so that instants from before the first call still convert.
    // Limited by how long the machine has been up.
    let back = (0..=12)
        .rev()
        .map(|n| Duration::from_secs(300 * n))
        .find(|d| now.checked_sub(*d).is_some())
        .unwrap_or(Duration::ZERO);

    Anchor {
        instant: now - back,
        ntp: (unix + NTP_UNIX_OFFSET).saturating_sub(back),
    }
});

static FAR_FUTURE: Lazy<Instant> =
    Lazy::new(|| Instant::now() + Duration::from_secs(60 * 60 * 24 * 365 * 100));

/// An instant that is never reached. Used as timeout when there is nothing to do.
pub(crate) fn not_happening() -> Instant {
    *FAR_FUTURE
}

/// An instant that has always passed. Used to make something happen on the next poll.
pub(crate) fn already_happened() -> Instant {
    ANCHOR.instant
}

/// Conversions between [`Instant`] and the wall clock formats used on the wire.
pub trait InstantExt {
    /// Duration since the NTP epoch, 1900-01-01.
    fn to_ntp_duration(&self) -> Duration;

    /// Convert the 64 bit NTP timestamp of a sender report to an Instant.
    fn from_ntp_64(v: u64) -> Self;

    /// 64 bit NTP timestamp. Seconds in the upper 32 bits, fraction in the lower.
    fn as_ntp_64(&self) -> u64;

    /// The middle 32 bits of the 64 bit NTP timestamp. Units of 1/65536 s.
    fn to_compact_ntp(&self) -> u32;
}

impl InstantExt for Instant {
    fn to_ntp_duration(&self) -> Duration {
        if *self < ANCHOR.instant {
            warn!("Instant before the wall clock anchor");
        }
        ANCHOR.ntp + self.saturating_duration_since(ANCHOR.instant)
    }

    fn from_ntp_64(v: u64) -> Self {
        let secs = v >> 32;
        let nanos = ((v & 0xffff_ffff) * 1_000_000_000) >> 32;
        let ntp = Duration::new(secs, nanos as u32);

        match ntp.checked_sub(ANCHOR.ntp) {
            Some(d) => ANCHOR.instant + d,
            None => ANCHOR
                .instant
                .checked_sub(ANCHOR.ntp - ntp)
                .unwrap_or(ANCHOR.instant),
        }
    }

    fn as_ntp_64(&self) -> u64 {
        let ntp = self.to_ntp_duration();
        let fraction = ((ntp.subsec_nanos() as u64) << 32) / 1_000_000_000;
        (ntp.as_secs() << 32) | fraction
    }

    fn to_compact_ntp(&self) -> u32 {
        (self.as_ntp_64() >> 16) as u32
    }
}

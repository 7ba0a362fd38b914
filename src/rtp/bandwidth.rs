use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Div, Mul, Sub};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A data rate in bits per second.
///
/// Tracked as a float since the estimators do a lot of repeated scaling.
/// Constructors never produce negative rates.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct Bitrate(f64);

impl Bitrate {
    /// No bandwidth.
    pub const ZERO: Self = Self::new(0);

    /// Unbounded rate.
    pub const MAX: Self = Bitrate(f64::MAX);

    /// Rate in bits per second.
    pub const fn new(bps: u64) -> Self {
        Bitrate(bps as f64)
    }

    /// Rate in kilobits per second.
    pub const fn kbps(kbps: u64) -> Self {
        Self::new(kbps * 10_u64.pow(3))
    }

    /// Rate in megabits per second.
    pub const fn mbps(mbps: u64) -> Self {
        Self::new(mbps * 10_u64.pow(6))
    }

    /// Rate in gigabits per second.
    pub const fn gbps(gbps: u64) -> Self {
        Self::new(gbps * 10_u64.pow(9))
    }

    /// Bits per second as float.
    pub fn as_f64(&self) -> f64 {
        self.0
    }

    /// Bits per second rounded up.
    pub fn as_u64(&self) -> u64 {
        self.0.ceil() as u64
    }

    /// Clamp to the given range.
    pub fn clamp(&self, min: Self, max: Self) -> Self {
        Self(self.0.clamp(min.0, max.0))
    }

    /// The smallest of two rates.
    pub fn min(self, other: Self) -> Self {
        Self(self.0.min(other.0))
    }

    /// The largest of two rates.
    pub fn max(self, other: Self) -> Self {
        Self(self.0.max(other.0))
    }
}

impl Default for Bitrate {
    fn default() -> Self {
        Bitrate::ZERO
    }
}

impl From<u64> for Bitrate {
    fn from(value: u64) -> Self {
        Self::new(value)
    }
}

impl From<f64> for Bitrate {
    fn from(value: f64) -> Self {
        Self(value.max(0.0))
    }
}

impl Mul<Duration> for Bitrate {
    type Output = DataSize;

    fn mul(self, rhs: Duration) -> Self::Output {
        let bits = self.0 * rhs.as_secs_f64();
        let bytes = bits / 8.0;

        DataSize::bytes(bytes.round() as u64)
    }
}

impl Mul<f64> for Bitrate {
    type Output = Bitrate;

    fn mul(self, rhs: f64) -> Self::Output {
        Bitrate((self.0 * rhs).max(0.0))
    }
}

impl Add<Bitrate> for Bitrate {
    type Output = Bitrate;

    fn add(self, rhs: Bitrate) -> Self::Output {
        Bitrate(self.0 + rhs.0)
    }
}

impl Sub<Bitrate> for Bitrate {
    type Output = Bitrate;

    /// Saturates at zero.
    fn sub(self, rhs: Bitrate) -> Self::Output {
        Bitrate((self.0 - rhs.0).max(0.0))
    }
}

impl fmt::Display for Bitrate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_si(f, self.0, ["bit/s", "kbit/s", "Mbit/s", "Gbit/s", "Tbit/s"])
    }
}

/// Scale `value` to the largest prefix keeping it at or above 1.
fn write_si(f: &mut fmt::Formatter<'_>, value: f64, units: [&str; 5]) -> fmt::Result {
    let steps = if value >= 1.0 {
        ((value.log10() / 3.0).floor() as usize).min(units.len() - 1)
    } else {
        0
    };

    if steps == 0 {
        return write!(f, "{}{}", value, units[0]);
    }

    let scaled = value / 1000_f64.powi(steps as i32);
    write!(f, "{:.3}{}", scaled, units[steps])
}

/// An amount of data in bytes.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct DataSize(u64);

impl DataSize {
    /// Nothing.
    pub const ZERO: Self = DataSize::bytes(0);

    /// Size in bytes.
    pub const fn bytes(bytes: u64) -> DataSize {
        Self(bytes)
    }

    /// Bytes as float.
    pub fn as_bytes_f64(&self) -> f64 {
        self.0 as f64
    }

    /// Bytes as usize.
    pub fn as_bytes_usize(&self) -> usize {
        self.0 as usize
    }

    /// Subtract, stopping at zero.
    pub fn saturating_sub(self, rhs: Self) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }
}

impl From<usize> for DataSize {
    fn from(value: usize) -> Self {
        Self(value as u64)
    }
}

impl From<u64> for DataSize {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl Div<Duration> for DataSize {
    type Output = Bitrate;

    fn div(self, rhs: Duration) -> Self::Output {
        if rhs.is_zero() {
            return Bitrate::ZERO;
        }

        let bytes = self.as_bytes_f64();
        let bps = (bytes * 8.0) / rhs.as_secs_f64();

        bps.into()
    }
}

impl Div<Bitrate> for DataSize {
    type Output = Duration;

    fn div(self, rhs: Bitrate) -> Self::Output {
        if rhs.as_f64() <= 0.0 {
            return Duration::MAX;
        }

        let bits = self.as_bytes_f64() * 8.0;
        let seconds = bits / rhs.as_f64();

        Duration::try_from_secs_f64(seconds).unwrap_or(Duration::MAX)
    }
}

impl Mul<u64> for DataSize {
    type Output = DataSize;

    fn mul(self, rhs: u64) -> Self::Output {
        Self(self.0 * rhs)
    }
}

impl AddAssign<DataSize> for DataSize {
    fn add_assign(&mut self, rhs: DataSize) {
        self.0 += rhs.0;
    }
}

impl Add<DataSize> for DataSize {
    type Output = DataSize;

    fn add(self, rhs: DataSize) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl Sum<DataSize> for DataSize {
    fn sum<I: Iterator<Item = DataSize>>(iter: I) -> Self {
        iter.fold(DataSize::ZERO, |acc, s| acc + s)
    }
}

impl fmt::Display for DataSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_si(f, self.0 as f64, ["B", "kB", "MB", "GB", "TB"])
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::{Bitrate, DataSize};

    #[test]
    fn bitrate_display() {
        assert_eq!(Bitrate::new(123).to_string(), "123bit/s");
        assert_eq!(Bitrate::new(12345).to_string(), "12.345kbit/s");
        assert_eq!(Bitrate::new(1234567).to_string(), "1.235Mbit/s");
        assert_eq!(Bitrate::new(1234567898).to_string(), "1.235Gbit/s");
        assert_eq!(Bitrate::ZERO.to_string(), "0bit/s");
    }

    #[test]
    fn data_size_display() {
        assert_eq!(DataSize::bytes(999).to_string(), "999B");
        assert_eq!(DataSize::bytes(1500).to_string(), "1.500kB");
    }

    #[test]
    fn bitrate_never_negative() {
        assert_eq!(Bitrate::from(-5.0), Bitrate::ZERO);
        assert_eq!(Bitrate::kbps(10) - Bitrate::kbps(20), Bitrate::ZERO);
        assert_eq!(Bitrate::kbps(10) * -1.0, Bitrate::ZERO);
    }

    #[test]
    fn data_size_div_duration() {
        let size = DataSize::bytes(2_500_000);
        let rate = size / Duration::from_secs(1);

        assert_eq!(rate.as_u64(), 20_000_000);
        assert_eq!(size / Duration::ZERO, Bitrate::ZERO);
    }

    #[test]
    fn data_size_div_bitrate() {
        let size = DataSize::bytes(12_500);
        let rate = Bitrate::new(2_500_000);
        let duration = size / rate;

        assert_eq!(duration.as_millis(), 40);
        assert_eq!(size / Bitrate::ZERO, Duration::MAX);
    }
}

use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::util::InstantExt;

/// The RFC 8285 profile marker of the one-byte extension form.
pub(crate) const ONE_BYTE_PROFILE: u16 = 0xBEDE;

/// RTP header extensions understood by this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum Extension {
    /// <http://www.webrtc.org/experiments/rtp-hdrext/abs-send-time>
    ///
    /// 24 bit fixed point, 6 bits of seconds and 18 bits of fraction. Wraps every 64 seconds.
    AbsoluteSendTime,
}

impl Extension {
    fn value_len(&self) -> usize {
        match self {
            Extension::AbsoluteSendTime => 3,
        }
    }

    fn write_to(&self, buf: &mut [u8], ev: &ExtensionValues) -> Option<usize> {
        match self {
            Extension::AbsoluteSendTime => {
                let time_24 = ev.abs_send_time?;
                buf[..3].copy_from_slice(&time_24.to_be_bytes()[1..]);
                Some(3)
            }
        }
    }

    fn parse_value(&self, buf: &[u8], ev: &mut ExtensionValues) -> Option<()> {
        match self {
            Extension::AbsoluteSendTime => {
                if buf.len() < 3 {
                    return None;
                }
                ev.abs_send_time = Some(u32::from_be_bytes([0, buf[0], buf[1], buf[2]]));
            }
        }
        Some(())
    }
}

/// Mapping between one-byte extension ids (1-14) and [`Extension`].
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionMap([Option<Extension>; 14]);

impl ExtensionMap {
    /// No extensions mapped.
    pub fn empty() -> Self {
        ExtensionMap([None; 14])
    }

    /// abs-send-time on id 2, the way most WebRTC peers configure it.
    pub fn standard() -> Self {
        let mut exts = Self::empty();
        exts.set(2, Extension::AbsoluteSendTime);
        exts
    }

    /// Map an id to an extension. Ids outside 1-14 are ignored.
    pub fn set(&mut self, id: u8, ext: Extension) {
        if !(1..=14).contains(&id) {
            debug!("Ignore one-byte extension id out of range: {}", id);
            return;
        }
        // An extension has one id at most.
        for e in self.0.iter_mut() {
            if *e == Some(ext) {
                *e = None;
            }
        }
        self.0[id as usize - 1] = Some(ext);
    }

    /// Look up the extension for an id.
    pub fn lookup(&self, id: u8) -> Option<Extension> {
        if (1..=14).contains(&id) {
            self.0[id as usize - 1]
        } else {
            None
        }
    }

    /// The id of an extension, if mapped.
    pub fn id_of(&self, ext: Extension) -> Option<u8> {
        self.0
            .iter()
            .position(|e| *e == Some(ext))
            .map(|p| p as u8 + 1)
    }

    fn iter(&self) -> impl Iterator<Item = (u8, Extension)> + '_ {
        self.0
            .iter()
            .enumerate()
            .filter_map(|(i, e)| e.map(|e| (i as u8 + 1, e)))
    }

    /// Length of the extension elements for these values, excluding the 4 byte
    /// extension header and padding.
    pub(crate) fn values_len(&self, ev: &ExtensionValues) -> usize {
        self.iter()
            .filter(|(_, e)| match e {
                Extension::AbsoluteSendTime => ev.abs_send_time.is_some(),
            })
            .map(|(_, e)| 1 + e.value_len())
            .sum()
    }

    // https://tools.ietf.org/html/rfc8285#section-4.2
    pub(crate) fn parse(&self, mut buf: &[u8], ext_vals: &mut ExtensionValues) {
        loop {
            if buf.is_empty() {
                return;
            }

            if buf[0] == 0 {
                // padding
                buf = &buf[1..];
                continue;
            }

            let id = buf[0] >> 4;
            let len = (buf[0] & 0xf) as usize + 1;
            buf = &buf[1..];

            // 15 is reserved and terminates processing.
            if id == 15 {
                return;
            }

            if buf.len() < len {
                trace!("Not enough type ext len: {} < {}", buf.len(), len);
                return;
            }

            if let Some(ext) = self.lookup(id) {
                if ext.parse_value(&buf[..len], ext_vals).is_none() {
                    trace!("Failed to parse extension {:?} with len {}", ext, len);
                }
            }

            buf = &buf[len..];
        }
    }

    pub(crate) fn write_to(&self, ext_buf: &mut [u8], ev: &ExtensionValues) -> usize {
        let mut b = ext_buf;
        let mut sum = 0;

        for (id, ext) in self.iter() {
            let Some(n) = ext.write_to(&mut b[1..], ev) else {
                continue;
            };
            assert!(n >= 1 && n <= 16);
            b[0] = id << 4 | (n as u8 - 1);
            b = &mut b[1 + n..];
            sum += 1 + n;
        }

        sum
    }
}

impl fmt::Debug for ExtensionMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Extensions(")?;
        let mut first = true;
        for (id, ext) in self.iter() {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{}={:?}", id, ext)?;
            first = false;
        }
        write!(f, ")")
    }
}

impl Default for ExtensionMap {
    fn default() -> Self {
        Self::standard()
    }
}

/// Values of the header extensions in one RTP packet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtensionValues {
    /// Raw 24 bit abs-send-time in 6.18 fixed point.
    pub abs_send_time: Option<u32>,
}

impl ExtensionValues {
    /// Values carrying the abs-send-time of `now`.
    pub fn with_abs_send_time(now: Instant) -> Self {
        ExtensionValues {
            abs_send_time: Some(abs_send_time(now)),
        }
    }
}

/// Encode `now` into the 24 bit abs-send-time value.
pub fn abs_send_time(now: Instant) -> u32 {
    // ntp_64 is 32.32, 6.18 is the same value shifted down 14 bits and truncated to 24.
    ((now.as_ntp_64() >> 14) & 0x00ff_ffff) as u32
}

/// Time from abs-send-time `from` to `to`, accounting for the 64 second wrap.
pub fn abs_send_time_delta(from: u32, to: u32) -> Duration {
    let delta = to.wrapping_sub(from) & 0x00ff_ffff;
    Duration::from_micros((delta as u64 * 1_000_000) >> 18)
}

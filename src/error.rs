use thiserror::Error;

use crate::rtp::Pt;

/// Errors surfaced by the transport core.
///
/// None of these are fatal to a stream. Wire data that fails to parse is dropped,
/// [`Error::NotYetDecodable`] is the normal state of an incomplete FEC group and
/// [`Error::CapacityExceeded`] is a hint to the application that it should ask
/// the remote peer for a key frame.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// Wire data that does not follow the packet format.
    #[error("Malformed packet: {0}")]
    Malformed(&'static str),

    /// Buffer ended before the structure it should contain.
    #[error("Truncated packet: needed {needed} bytes, got {available}")]
    Truncated {
        /// Bytes needed to read the structure.
        needed: usize,
        /// Bytes available in the buffer.
        available: usize,
    },

    /// Not enough FEC symbols to recover the source group.
    #[error("FEC group not yet decodable")]
    NotYetDecodable,

    /// A bounded buffer ran out of room.
    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(&'static str),

    /// Payload type that has no codec mapping.
    #[error("Unsupported codec for payload type {0}")]
    UnsupportedCodec(Pt),
}

impl Error {
    /// Shorthand for checking a buffer has at least `needed` bytes.
    pub(crate) fn check_len(buf: &[u8], needed: usize) -> Result<(), Error> {
        if buf.len() < needed {
            return Err(Error::Truncated {
                needed,
                available: buf.len(),
            });
        }
        Ok(())
    }
}

impl From<&'static str> for Error {
    fn from(reason: &'static str) -> Self {
        Error::Malformed(reason)
    }
}

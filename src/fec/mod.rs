//! Reed-Solomon forward error correction over GF(2^8).
//!
//! [`FecEncoder`] and [`FecDecoder`] work on opaque, equally sized symbols.
//! [`FecSender`] and [`FecReceiver`] apply them to RTP, protecting the media
//! packets of a frame with repair packets on a separate stream.

mod gf256;
mod matrix;

mod encoder;
pub use encoder::{total_symbols, FecEncoder};

mod decoder;
pub use decoder::FecDecoder;

mod wire;
pub use wire::{FecReceiver, FecSender, RepairHeader, GROUP_TIMEOUT, REPAIR_HEADER_LEN};

/// Max symbols in a group, bounded by the field size.
pub const MAX_SYMBOLS: usize = 256;

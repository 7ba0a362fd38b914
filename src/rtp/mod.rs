//! RTP and RTCP wire formats.

mod id;
pub use id::{Pt, SeqNo, Ssrc};

mod ext;
pub use ext::{abs_send_time, abs_send_time_delta};
pub use ext::{Extension, ExtensionMap, ExtensionValues};

mod header;
pub use header::{extend_u16, extend_u32, RtpHeader, RtpPacket, MAX_PADDING_PER_PACKET};
pub(crate) use header::{extend_recv_u16, RECV_SEQ_BASE};

mod rtcp;
pub use rtcp::*;

mod bandwidth;
pub use bandwidth::{Bitrate, DataSize};

/// Clock rate of video RTP timestamps.
pub const VIDEO_CLOCK_RATE: u32 = 90_000;

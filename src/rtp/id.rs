use std::fmt;
use std::ops::Deref;

use serde::{Deserialize, Serialize};

macro_rules! num_id {
    ($(#[$meta:meta])* $id:ident, $t:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
        )]
        pub struct $id($t);

        impl $id {
            /// Random value.
            pub fn new() -> Self {
                $id(fastrand::$t(..))
            }
        }

        impl Deref for $id {
            type Target = $t;

            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }

        impl From<$t> for $id {
            fn from(v: $t) -> Self {
                $id(v)
            }
        }

        impl fmt::Display for $id {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

num_id!(
    /// Synchronization source, identifies one RTP stream.
    Ssrc,
    u32
);
num_id!(
    /// RTP payload type.
    Pt,
    u8
);
num_id!(
    /// Extended (unwrapped) RTP sequence number.
    SeqNo,
    u64
);

impl SeqNo {
    /// Whether `other` directly follows this sequence number.
    pub fn is_next(&self, other: SeqNo) -> bool {
        if **self >= *other {
            return false;
        }
        *other - **self == 1
    }

    /// The following sequence number.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// The 16 bit value as seen on the wire.
    pub fn as_u16(&self) -> u16 {
        self.0 as u16
    }
}

//! Protocol status codes.
//!
//! Only the codes this engine can produce are modelled. Each carries its numeric
//! protocol value so it can be placed on the wire by an encoder.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Result status of an operation or of a sampled value.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum StatusCode {
    #[default]
    Good,
    UncertainLastUsableValue,
    BadInternalError,
    BadTimeout,
    BadSessionClosed,
    BadSubscriptionIdInvalid,
    BadNodeIdInvalid,
    BadNodeIdUnknown,
    BadAttributeIdInvalid,
    BadNotReadable,
    BadNotWritable,
    BadOutOfRange,
    BadMonitoredItemIdInvalid,
    BadNoMatch,
    BadBrowseNameInvalid,
    BadNodeIdExists,
    BadTypeMismatch,
    BadTooManySubscriptions,
    BadTooManyMonitoredItems,
    BadTooManySessions,
    BadUserAccessDenied,
    BadInvalidArgument,
    BadNotConnected,
}

impl StatusCode {
    /// Numeric protocol value.
    #[must_use]
    pub const fn code(self) -> u32 {
        match self {
            Self::Good => 0x0000_0000,
            Self::UncertainLastUsableValue => 0x4090_0000,
            Self::BadInternalError => 0x8002_0000,
            Self::BadTimeout => 0x800A_0000,
            Self::BadSessionClosed => 0x8026_0000,
            Self::BadSubscriptionIdInvalid => 0x8028_0000,
            Self::BadNodeIdInvalid => 0x8033_0000,
            Self::BadNodeIdUnknown => 0x8034_0000,
            Self::BadAttributeIdInvalid => 0x8035_0000,
            Self::BadNotReadable => 0x803A_0000,
            Self::BadNotWritable => 0x803B_0000,
            Self::BadOutOfRange => 0x803C_0000,
            Self::BadMonitoredItemIdInvalid => 0x8042_0000,
            Self::BadNoMatch => 0x806F_0000,
            Self::BadBrowseNameInvalid => 0x8060_0000,
            Self::BadNodeIdExists => 0x805E_0000,
            Self::BadTypeMismatch => 0x8074_0000,
            Self::BadTooManySubscriptions => 0x8077_0000,
            Self::BadTooManyMonitoredItems => 0x80DB_0000,
            Self::BadTooManySessions => 0x8056_0000,
            Self::BadUserAccessDenied => 0x801F_0000,
            Self::BadInvalidArgument => 0x80AB_0000,
            Self::BadNotConnected => 0x808A_0000,
        }
    }

    /// Severity is Good.
    #[must_use]
    pub const fn is_good(self) -> bool {
        self.code() & 0xC000_0000 == 0
    }

    /// Severity is Uncertain.
    #[must_use]
    pub const fn is_uncertain(self) -> bool {
        self.code() & 0xC000_0000 == 0x4000_0000
    }

    /// Severity is Bad.
    #[must_use]
    pub const fn is_bad(self) -> bool {
        self.code() & 0x8000_0000 != 0
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?} (0x{:08X})", self.code())
    }
}

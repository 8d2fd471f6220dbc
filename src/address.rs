use std::fmt;
use std::num::IntErrorKind;

use tracing::debug;

use crate::error::{Error, Result};

/// The outcome of decoding one bound of an address range from `/proc/<PID>/maps`.
///
/// Addresses are decoded as signed 64-bit integers. Values that do not fit (e.g. the
/// `[vsyscall]` page at `ffffffffff600000` on x86_64) are not rejected; they decode to
/// [`DecodedAddress::Overflow`] and the region they belong to is considered to have an
/// indeterminate size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecodedAddress {
    /// The address fits in an `i64`.
    Value(i64),
    /// The address does not fit in an `i64`.
    Overflow,
}

impl DecodedAddress {
    /// The sentinel reported in place of an address that overflowed.
    pub const OVERFLOW_SENTINEL: i64 = -1;

    /// Returns the decoded value, or `None` if it overflowed.
    #[inline(always)]
    pub fn value(&self) -> Option<i64> {
        match *self {
            DecodedAddress::Value(v) => Some(v),
            DecodedAddress::Overflow => None,
        }
    }

    /// Returns the decoded value, substituting [`Self::OVERFLOW_SENTINEL`] for an overflow.
    #[inline(always)]
    pub fn raw(&self) -> i64 {
        self.value().unwrap_or(Self::OVERFLOW_SENTINEL)
    }

    /// Returns `true` if the address overflowed while decoding.
    #[inline(always)]
    pub fn is_overflow(&self) -> bool {
        matches!(self, DecodedAddress::Overflow)
    }
}

impl std::str::FromStr for DecodedAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        decode_address(s)
    }
}

impl fmt::Display for DecodedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodedAddress::Value(v) => write!(f, "0x{:016x}", v),
            DecodedAddress::Overflow => write!(f, "<overflow>"),
        }
    }
}

/// Decode a hexadecimal address (no `0x` prefix) into a [`DecodedAddress`].
///
/// # Errors
///
/// Returns [`Error::ParseAddress`] for anything but a magnitude overflow, e.g. an empty string
/// or non-hexadecimal characters.
pub fn decode_address(s: &str) -> Result<DecodedAddress> {
    match i64::from_str_radix(s, 16) {
        Ok(v) => Ok(DecodedAddress::Value(v)),
        Err(e) => match e.kind() {
            IntErrorKind::PosOverflow | IntErrorKind::NegOverflow => {
                debug!(addr = s, "address does not fit in 64 bits");
                Ok(DecodedAddress::Overflow)
            }
            _ => Err(Error::ParseAddress {
                addr: s.to_owned(),
                source: e,
            }),
        },
    }
}

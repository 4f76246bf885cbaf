//! Log sequence numbers: a 64-bit byte offset into the write-ahead log.
//!
//! The textual form is the server's own `X/X` hex pair (high 32 bits, low 32
//! bits), e.g. `16/B374D848`. [`Lsn`] round-trips through that form so it can
//! be embedded directly in `backup.ini` and parsed back out of SQL results.

use std::fmt;
use std::ops::{Add, AddAssign, Sub};
use std::str::FromStr;

#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lsn(pub u64);

impl Lsn {
    pub const INVALID: Lsn = Lsn(0);

    pub fn is_valid(self) -> bool {
        self != Lsn::INVALID
    }

    /// Checked subtraction; `None` on underflow, mirroring `u64::checked_sub`.
    pub fn checked_sub(self, other: impl Into<u64>) -> Option<Lsn> {
        self.0.checked_sub(other.into()).map(Lsn)
    }

    pub fn checked_add(self, other: impl Into<u64>) -> Option<Lsn> {
        self.0.checked_add(other.into()).map(Lsn)
    }

    /// Rounds down to the start of the `seg_sz`-byte segment containing this LSN.
    pub fn segment_lsn(self, seg_sz: u64) -> Lsn {
        Lsn(self.0 - (self.0 % seg_sz))
    }

    /// Index of the WAL segment (of size `seg_sz`) containing this LSN.
    pub fn segment_number(self, seg_sz: u64) -> u64 {
        self.0 / seg_sz
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for Lsn {
    fn from(n: u64) -> Self {
        Lsn(n)
    }
}

impl From<Lsn> for u64 {
    fn from(lsn: Lsn) -> Self {
        lsn.0
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xffff_ffff)
    }
}

impl fmt::Debug for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid LSN literal: {0:?}")]
pub struct LsnParseError(String);

impl FromStr for Lsn {
    type Err = LsnParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (hi, lo) = s
            .split_once('/')
            .ok_or_else(|| LsnParseError(s.to_string()))?;
        let hi = u32::from_str_radix(hi, 16).map_err(|_| LsnParseError(s.to_string()))?;
        let lo = u32::from_str_radix(lo, 16).map_err(|_| LsnParseError(s.to_string()))?;
        Ok(Lsn(((hi as u64) << 32) | lo as u64))
    }
}

impl Add<u64> for Lsn {
    type Output = Lsn;
    fn add(self, rhs: u64) -> Lsn {
        Lsn(self.0 + rhs)
    }
}

impl AddAssign<u64> for Lsn {
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

impl Sub<Lsn> for Lsn {
    type Output = u64;
    fn sub(self, rhs: Lsn) -> u64 {
        self.0 - rhs.0
    }
}

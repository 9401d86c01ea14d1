use std::fmt;
use std::ops::{Add, AddAssign};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A PostgreSQL LSN (Log Sequence Number): a byte position in the WAL stream.
///
/// Postgres displays the 64-bit value as two 32-bit halves, `XXXXXXXX/YYYYYYYY`.
#[derive(Clone, Copy, Default, Eq, Ord, PartialEq, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Lsn(pub u64);

/// The LSN `0/0`, not a valid position in the stream.
pub const LSN_INVALID: Lsn = Lsn(0);

impl Lsn {
    /// Compute the 0-based WAL segment number containing this LSN.
    pub fn segment_number(self, seg_size: usize) -> u64 {
        self.0 / seg_size as u64
    }

    /// Byte offset of this LSN within its segment.
    pub fn segment_offset(self, seg_size: usize) -> usize {
        (self.0 % seg_size as u64) as usize
    }

    /// First LSN of the given segment.
    pub fn segment_start(seg_no: u64, seg_size: usize) -> Lsn {
        Lsn(seg_no * seg_size as u64)
    }

    pub fn is_valid(self) -> bool {
        self != LSN_INVALID
    }

    pub fn checked_sub<T: Into<u64>>(self, other: T) -> Option<Lsn> {
        self.0.checked_sub(other.into()).map(Lsn)
    }

    /// Build an LSN from the two 32-bit halves a page header stores.
    pub fn from_parts(hi: u32, lo: u32) -> Lsn {
        Lsn((hi as u64) << 32 | lo as u64)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xffffffff)
    }
}

impl fmt::Debug for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for Lsn {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (hi, lo) = s
            .split_once('/')
            .ok_or_else(|| anyhow::anyhow!("invalid LSN: {s:?}"))?;
        let hi = u64::from_str_radix(hi, 16)?;
        let lo = u64::from_str_radix(lo, 16)?;
        if hi > u32::MAX as u64 || lo > u32::MAX as u64 {
            anyhow::bail!("invalid LSN: {s:?}");
        }
        Ok(Lsn(hi << 32 | lo))
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

impl Add<u64> for Lsn {
    type Output = Lsn;

    fn add(self, rhs: u64) -> Self::Output {
        Lsn(self.0.checked_add(rhs).expect("LSN overflow"))
    }
}

impl AddAssign<u64> for Lsn {
    fn add_assign(&mut self, rhs: u64) {
        *self = *self + rhs;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lsn_display_parse_roundtrip() {
        let lsn = Lsn(0x1_A2B3_C4D5);
        assert_eq!(lsn.to_string(), "1/A2B3C4D5");
        assert_eq!("1/A2B3C4D5".parse::<Lsn>().unwrap(), lsn);
        assert_eq!("0/0".parse::<Lsn>().unwrap(), LSN_INVALID);
        assert!("nonsense".parse::<Lsn>().is_err());
        assert!("1/2/3".parse::<Lsn>().is_err());
    }

    #[test]
    fn lsn_segment_math() {
        let seg_size = 16 * 1024 * 1024;
        assert_eq!(Lsn(0).segment_number(seg_size), 0);
        assert_eq!(Lsn(seg_size as u64).segment_number(seg_size), 1);
        assert_eq!(Lsn(seg_size as u64 + 7).segment_offset(seg_size), 7);
        assert_eq!(Lsn::segment_start(3, seg_size), Lsn(3 * seg_size as u64));
    }

    #[test]
    fn lsn_from_parts() {
        assert_eq!(Lsn::from_parts(1, 0x10), Lsn(0x1_0000_0010));
    }
}

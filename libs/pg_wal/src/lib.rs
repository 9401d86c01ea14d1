//! WAL segment identity, arithmetic and header validation.
//!
//! A segment is named by 24 upper-case hex characters:
//! `timeline (8) | log (8) | seg (8)`. The log/seg split is historical; the
//! pair advances as a single counter except that servers before 9.3 never
//! used the last segment of each log file.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use byteorder::{ByteOrder, LittleEndian};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use utils::lsn::Lsn;

pub mod page;
pub mod version;

pub use version::PgVersion;

/// Default WAL segment size. The size is a compile-time constant in stock
/// PostgreSQL builds but configurable since 11, so it travels in archive.info.
pub const WAL_SEGMENT_SIZE_DEFAULT: usize = 16 * 1024 * 1024;
/// Smallest segment size accepted, used by tests to keep fixtures tiny.
pub const WAL_SEGMENT_SIZE_MIN: usize = 1024 * 1024;

/// Default data page size.
pub const PG_PAGE_SIZE_DEFAULT: usize = 8192;
/// Default relation file segment size (1 GiB).
pub const PG_SEGMENT_SIZE_DEFAULT: usize = 1024 * 1024 * 1024;

/// Bytes of WAL addressed by one log file (the `log` hex field).
const WAL_LOG_SIZE: u64 = 0x1_0000_0000;

static WAL_SEGMENT_RE: Lazy<Regex> = Lazy::new(|| Regex::new("^[0-9A-F]{24}$").unwrap());
static WAL_HISTORY_RE: Lazy<Regex> = Lazy::new(|| Regex::new("^[0-9A-F]{8}\\.history$").unwrap());

/// Identity of a single WAL segment.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WalSegment {
    pub timeline: u32,
    pub log: u32,
    pub seg: u32,
}

impl WalSegment {
    pub fn new(timeline: u32, log: u32, seg: u32) -> Self {
        WalSegment { timeline, log, seg }
    }

    /// Number of segments per log file at the given segment size.
    pub fn segments_per_log(seg_size: usize) -> u32 {
        (WAL_LOG_SIZE / seg_size as u64) as u32
    }

    /// The segment containing `lsn` on the given timeline.
    pub fn from_lsn(timeline: u32, lsn: Lsn, seg_size: usize) -> Self {
        let seg_no = lsn.segment_number(seg_size);
        let per_log = Self::segments_per_log(seg_size) as u64;
        WalSegment {
            timeline,
            log: (seg_no / per_log) as u32,
            seg: (seg_no % per_log) as u32,
        }
    }

    /// First LSN covered by this segment.
    pub fn start_lsn(&self, seg_size: usize) -> Lsn {
        let per_log = Self::segments_per_log(seg_size) as u64;
        Lsn((self.log as u64 * per_log + self.seg as u64) * seg_size as u64)
    }

    /// The next segment in archive order. Servers before 9.3 skip the last
    /// segment of each log file.
    pub fn next(&self, seg_size: usize, version: PgVersion) -> WalSegment {
        let mut limit = Self::segments_per_log(seg_size);
        if version.skips_last_segment() {
            limit -= 1;
        }

        let mut next = *self;
        next.seg += 1;
        if next.seg >= limit {
            next.seg = 0;
            next.log += 1;
        }
        next
    }

    /// Enumerate `count` segments starting with `self`.
    pub fn range(&self, count: usize, seg_size: usize, version: PgVersion) -> Vec<WalSegment> {
        let mut result = Vec::with_capacity(count);
        let mut current = *self;
        for _ in 0..count {
            result.push(current);
            current = current.next(seg_size, version);
        }
        result
    }

    /// Repository path component grouping segments of one log file, e.g.
    /// `0000000100000001`.
    pub fn log_group(&self) -> String {
        format!("{:08X}{:08X}", self.timeline, self.log)
    }
}

impl fmt::Display for WalSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08X}{:08X}{:08X}", self.timeline, self.log, self.seg)
    }
}

impl fmt::Debug for WalSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for WalSegment {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if !WAL_SEGMENT_RE.is_match(s) {
            anyhow::bail!("'{s}' is not a WAL segment name");
        }
        Ok(WalSegment {
            timeline: u32::from_str_radix(&s[0..8], 16)?,
            log: u32::from_str_radix(&s[8..16], 16)?,
            seg: u32::from_str_radix(&s[16..24], 16)?,
        })
    }
}

impl Ord for WalSegment {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.timeline, self.log, self.seg).cmp(&(other.timeline, other.log, other.seg))
    }
}

impl PartialOrd for WalSegment {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Kinds of file the database hands to the archiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalFileKind {
    /// A closed, full-size WAL segment.
    Segment(WalSegment),
    /// A segment closed early by a promote, `<segment>.partial`.
    Partial(WalSegment),
    /// A timeline history file, `<8-hex-tli>.history`.
    History,
    /// A backup history file (9.x), archived verbatim.
    BackupHistory,
}

impl WalFileKind {
    pub fn from_name(name: &str) -> anyhow::Result<WalFileKind> {
        if WAL_SEGMENT_RE.is_match(name) {
            return Ok(WalFileKind::Segment(name.parse()?));
        }
        if let Some(stem) = name.strip_suffix(".partial") {
            if WAL_SEGMENT_RE.is_match(stem) {
                return Ok(WalFileKind::Partial(stem.parse()?));
            }
        }
        if WAL_HISTORY_RE.is_match(name) {
            return Ok(WalFileKind::History);
        }
        if name.contains(".backup") {
            return Ok(WalFileKind::BackupHistory);
        }
        anyhow::bail!("'{name}' is not an archivable WAL file name")
    }

    /// Header checks only make sense for real segment content.
    pub fn segment(&self) -> Option<WalSegment> {
        match self {
            WalFileKind::Segment(seg) => Some(*seg),
            _ => None,
        }
    }
}

/// Fields of the long page header at the start of every WAL segment that the
/// push-side header check cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalSegmentHeader {
    pub magic: u16,
    pub timeline: u32,
    pub system_id: u64,
    pub seg_size: u32,
}

/// Info-flag bit marking a long header (first page of a segment).
const XLP_LONG_HEADER: u16 = 0x0002;
/// Size of XLogPageHeaderData with padding, before the long-header fields.
const WAL_PAGE_HEADER_SIZE: usize = 24;
const WAL_LONG_HEADER_SIZE: usize = WAL_PAGE_HEADER_SIZE + 16;

impl WalSegmentHeader {
    /// Parse the long header from the first bytes of a segment.
    pub fn parse(buf: &[u8]) -> anyhow::Result<WalSegmentHeader> {
        anyhow::ensure!(
            buf.len() >= WAL_LONG_HEADER_SIZE,
            "short read of {} byte(s) for WAL segment header",
            buf.len()
        );

        let info = LittleEndian::read_u16(&buf[2..4]);
        anyhow::ensure!(
            info & XLP_LONG_HEADER != 0,
            "first page of WAL segment lacks the long header flag"
        );

        Ok(WalSegmentHeader {
            magic: LittleEndian::read_u16(&buf[0..2]),
            timeline: LittleEndian::read_u32(&buf[4..8]),
            system_id: LittleEndian::read_u64(&buf[24..32]),
            seg_size: LittleEndian::read_u32(&buf[32..36]),
        })
    }

    /// Validate the header against the stanza's cluster identity. Errors name
    /// what mismatched; the caller decides fatality.
    pub fn check(
        &self,
        version: PgVersion,
        system_id: u64,
        seg_size: usize,
    ) -> anyhow::Result<()> {
        let magic = version.wal_page_magic();
        anyhow::ensure!(
            self.magic == magic,
            "WAL segment magic 0x{:04X} does not match 0x{:04X} for version {}",
            self.magic,
            magic,
            version
        );
        anyhow::ensure!(
            self.system_id == system_id,
            "WAL segment system-id {} does not match stanza system-id {}",
            self.system_id,
            system_id
        );
        anyhow::ensure!(
            self.seg_size as usize == seg_size,
            "WAL segment size {} does not match stanza segment size {}",
            self.seg_size,
            seg_size
        );
        Ok(())
    }

    /// Render a header for test fixtures.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; WAL_LONG_HEADER_SIZE];
        LittleEndian::write_u16(&mut buf[0..2], self.magic);
        LittleEndian::write_u16(&mut buf[2..4], XLP_LONG_HEADER);
        LittleEndian::write_u32(&mut buf[4..8], self.timeline);
        LittleEndian::write_u64(&mut buf[24..32], self.system_id);
        LittleEndian::write_u32(&mut buf[32..36], self.seg_size);
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use version::{PgVersion, PG_VERSION_96};

    const SEG_SIZE: usize = WAL_SEGMENT_SIZE_DEFAULT;

    #[test]
    fn segment_name_roundtrip() {
        let seg: WalSegment = "000000010000000200000003".parse().unwrap();
        assert_eq!(seg, WalSegment::new(1, 2, 3));
        assert_eq!(seg.to_string(), "000000010000000200000003");
        assert_eq!(seg.log_group(), "0000000100000002");

        assert!("00000001000000020000000".parse::<WalSegment>().is_err());
        assert!("00000001000000020000000g".parse::<WalSegment>().is_err());
        assert!("000000010000000200000003x".parse::<WalSegment>().is_err());
    }

    #[test]
    fn successor_is_continuous_from_93_on() {
        let seg = WalSegment::new(1, 1, 0xFE);
        let next = seg.next(SEG_SIZE, PG_VERSION_96);
        assert_eq!(next, WalSegment::new(1, 1, 0xFF));
        let next = next.next(SEG_SIZE, PG_VERSION_96);
        assert_eq!(next, WalSegment::new(1, 2, 0));
    }

    #[test]
    fn successor_skips_last_segment_before_93() {
        let v92 = PgVersion(90200);
        let seg = WalSegment::new(1, 1, 0xFE);
        assert_eq!(seg.next(SEG_SIZE, v92), WalSegment::new(1, 2, 0));
    }

    #[test]
    fn lsn_mapping() {
        let lsn: Lsn = "2/5000000".parse().unwrap();
        let seg = WalSegment::from_lsn(1, lsn, SEG_SIZE);
        assert_eq!(seg, WalSegment::new(1, 2, 5));
        assert_eq!(seg.start_lsn(SEG_SIZE), Lsn(0x2_0500_0000));
    }

    #[test]
    fn range_enumeration() {
        let start = WalSegment::new(1, 1, 1);
        let range = start.range(3, SEG_SIZE, PG_VERSION_96);
        assert_eq!(
            range,
            vec![
                WalSegment::new(1, 1, 1),
                WalSegment::new(1, 1, 2),
                WalSegment::new(1, 1, 3),
            ]
        );
    }

    #[test]
    fn wal_file_kinds() {
        assert_eq!(
            WalFileKind::from_name("000000010000000100000001").unwrap(),
            WalFileKind::Segment(WalSegment::new(1, 1, 1))
        );
        assert_eq!(
            WalFileKind::from_name("000000010000000100000001.partial").unwrap(),
            WalFileKind::Partial(WalSegment::new(1, 1, 1))
        );
        assert_eq!(
            WalFileKind::from_name("00000002.history").unwrap(),
            WalFileKind::History
        );
        assert!(WalFileKind::from_name("random.txt").is_err());
    }

    #[test]
    fn header_check_catches_mismatches() {
        let header = WalSegmentHeader {
            magic: PG_VERSION_96.wal_page_magic(),
            timeline: 1,
            system_id: 42,
            seg_size: SEG_SIZE as u32,
        };
        let parsed = WalSegmentHeader::parse(&header.to_bytes()).unwrap();
        assert_eq!(parsed, header);

        parsed.check(PG_VERSION_96, 42, SEG_SIZE).unwrap();
        assert!(parsed.check(PG_VERSION_96, 43, SEG_SIZE).is_err());
        assert!(parsed
            .check(version::PG_VERSION_15, 42, SEG_SIZE)
            .is_err());
        assert!(parsed.check(PG_VERSION_96, 42, SEG_SIZE * 2).is_err());
    }
}

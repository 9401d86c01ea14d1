//! Everything that varies across PostgreSQL releases, in one place.
//!
//! The rest of the engine never compares version numbers; it asks this
//! module which SQL to issue, which directory to scan, and how segment
//! numbering behaves.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A PostgreSQL server version in `PG_VERSION_NUM` form, e.g. `90620`,
/// `150002`. Only the major part matters to the engine.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PgVersion(pub u32);

pub const PG_VERSION_90: PgVersion = PgVersion(90000);
pub const PG_VERSION_93: PgVersion = PgVersion(90300);
pub const PG_VERSION_96: PgVersion = PgVersion(90600);
pub const PG_VERSION_10: PgVersion = PgVersion(100000);
pub const PG_VERSION_12: PgVersion = PgVersion(120000);
pub const PG_VERSION_15: PgVersion = PgVersion(150000);
pub const PG_VERSION_MAX: PgVersion = PgVersion(170000);

impl PgVersion {
    /// Major version with the minor part masked off, for matrix comparisons.
    pub fn major(self) -> u32 {
        if self.0 >= 100000 {
            self.0 / 10000 * 10000
        } else {
            self.0 / 100 * 100
        }
    }

    pub fn is_supported(self) -> bool {
        self >= PG_VERSION_90 && self < PG_VERSION_MAX
    }

    /// Name of the WAL directory inside the data directory.
    pub fn wal_dir(self) -> &'static str {
        if self < PG_VERSION_10 {
            "pg_xlog"
        } else {
            "pg_wal"
        }
    }

    /// Before 9.3 the last segment of each log file (`0xFF` at the default
    /// segment size) was never used.
    pub fn skips_last_segment(self) -> bool {
        self < PG_VERSION_93
    }

    /// Before 9.6 only the exclusive backup form exists; from 15 on only the
    /// non-exclusive form does. In between walvault always uses the
    /// non-exclusive form.
    pub fn uses_exclusive_backup(self) -> bool {
        self < PG_VERSION_96
    }

    pub fn start_backup_sql(self, label: &str, start_fast: bool) -> String {
        let fast = if start_fast { "true" } else { "false" };
        if self.uses_exclusive_backup() {
            format!(
                "select lsn::text, pg_xlogfile_name(lsn)::text from pg_start_backup('{label}', {fast}) as lsn"
            )
        } else if self >= PG_VERSION_15 {
            format!(
                "select lsn::text, pg_walfile_name(lsn)::text from pg_backup_start(label := '{label}', fast := {fast}) as lsn"
            )
        } else {
            format!(
                "select lsn::text, pg_walfile_name(lsn)::text from pg_start_backup('{label}', {fast}, false) as lsn"
            )
        }
    }

    pub fn stop_backup_sql(self) -> &'static str {
        if self.uses_exclusive_backup() {
            "select lsn::text, pg_xlogfile_name(lsn)::text, null::text, null::text \
             from pg_stop_backup() as lsn"
        } else if self >= PG_VERSION_15 {
            "select lsn::text, pg_walfile_name(lsn)::text, labelfile::text, spcmapfile::text \
             from pg_backup_stop(wait_for_archive := false)"
        } else {
            "select lsn::text, pg_walfile_name(lsn)::text, labelfile::text, spcmapfile::text \
             from pg_stop_backup(false)"
        }
    }

    pub fn switch_wal_sql(self) -> &'static str {
        if self < PG_VERSION_10 {
            "select pg_xlogfile_name(pg_switch_xlog())::text"
        } else {
            "select pg_walfile_name(pg_switch_wal())::text"
        }
    }

    /// Magic number in the first WAL page header, used by the push-side
    /// header check.
    pub fn wal_page_magic(self) -> u16 {
        match self.major() {
            90000 => 0xD064,
            90100 => 0xD066,
            90200 => 0xD071,
            90300 => 0xD075,
            90400 => 0xD07E,
            90500 => 0xD087,
            90600 => 0xD093,
            100000 => 0xD097,
            110000 => 0xD098,
            120000 => 0xD101,
            130000 => 0xD106,
            140000 => 0xD10D,
            150000 => 0xD110,
            160000 => 0xD113,
            _ => 0,
        }
    }
}

impl fmt::Display for PgVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 >= 100000 {
            write!(f, "{}", self.0 / 10000)
        } else {
            write!(f, "{}.{}", self.0 / 10000, self.0 % 10000 / 100)
        }
    }
}

impl fmt::Debug for PgVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for PgVersion {
    type Err = anyhow::Error;

    /// Accepts the forms users write: `9.6`, `12`, or a full
    /// `PG_VERSION_NUM` like `120004`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let version = if let Some((major, minor)) = s.split_once('.') {
            let major: u32 = major.parse()?;
            let minor: u32 = minor.parse()?;
            anyhow::ensure!(major < 10, "invalid PostgreSQL version '{s}'");
            PgVersion(major * 10000 + minor * 100)
        } else {
            let n: u32 = s.parse()?;
            if n >= 90000 {
                PgVersion(n)
            } else {
                PgVersion(n * 10000)
            }
        };
        anyhow::ensure!(
            version.is_supported(),
            "unsupported PostgreSQL version '{s}'"
        );
        Ok(version)
    }
}

//! `archive.info`: the WAL registry of one stanza on one repository.

use pg_wal::PgVersion;
use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};

/// One cluster identity the stanza has archived for. History is append-only;
/// the newest entry is the current one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveEntry {
    pub archive_id: String,
    pub version: PgVersion,
    pub system_id: u64,
    /// WAL segment size of the cluster, bytes.
    pub wal_segment_size: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveInfo {
    pub history: Vec<ArchiveEntry>,
}

impl ArchiveInfo {
    pub fn new(version: PgVersion, system_id: u64, wal_segment_size: usize) -> Self {
        ArchiveInfo {
            history: vec![ArchiveEntry {
                archive_id: super::archive_id(version, 1),
                version,
                system_id,
                wal_segment_size,
            }],
        }
    }

    pub fn current(&self) -> Result<&ArchiveEntry> {
        self.history
            .last()
            .ok_or_else(|| Error::Format("archive.info has no history".into()))
    }

    /// Validate the live cluster against the current entry. A mismatch means
    /// either the wrong cluster or a missed stanza-upgrade.
    pub fn check(&self, version: PgVersion, system_id: u64) -> Result<&ArchiveEntry> {
        let current = self.current()?;
        if current.version != version || current.system_id != system_id {
            return Err(Error::ArchiveMismatch(format!(
                "PostgreSQL version {version}, system-id {system_id} do not match \
                 stanza version {}, system-id {} -- is this the correct stanza?",
                current.version, current.system_id
            )));
        }
        Ok(current)
    }

    /// Stanza-upgrade: append a new identity with the next sequence number.
    pub fn upgrade(
        &mut self,
        version: PgVersion,
        system_id: u64,
        wal_segment_size: usize,
    ) -> &ArchiveEntry {
        let sequence = self.history.len() as u32 + 1;
        self.history.push(ArchiveEntry {
            archive_id: super::archive_id(version, sequence),
            version,
            system_id,
            wal_segment_size,
        });
        self.history.last().expect("just pushed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const V96: PgVersion = PgVersion(90600);
    const V15: PgVersion = PgVersion(150000);

    #[test]
    fn check_accepts_matching_cluster() {
        let info = ArchiveInfo::new(V96, 42, 16 * 1024 * 1024);
        let entry = info.check(V96, 42).unwrap();
        assert_eq!(entry.archive_id, "9.6-1");
    }

    #[test]
    fn check_rejects_mismatch() {
        let info = ArchiveInfo::new(V96, 42, 16 * 1024 * 1024);
        assert!(matches!(
            info.check(V96, 43),
            Err(Error::ArchiveMismatch(_))
        ));
        assert!(matches!(
            info.check(V15, 42),
            Err(Error::ArchiveMismatch(_))
        ));
    }

    #[test]
    fn upgrade_renumbers() {
        let mut info = ArchiveInfo::new(V96, 42, 16 * 1024 * 1024);
        let entry = info.upgrade(V15, 99, 16 * 1024 * 1024);
        assert_eq!(entry.archive_id, "15-2");
        assert_eq!(info.history.len(), 2);
        info.check(V15, 99).unwrap();
        assert!(info.check(V96, 42).is_err());
    }
}

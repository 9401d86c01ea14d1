//! `backup.info`: the backup registry of one stanza on one repository.

use chrono::{DateTime, Utc};
use pg_wal::PgVersion;
use serde::{Deserialize, Serialize};
use utils::lsn::Lsn;

use crate::backup::label::{BackupLabel, BackupType};
use crate::errors::{Error, Result};

/// Summary of one completed backup, enough for the recovery resolver and
/// expire to work without opening manifests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupEntry {
    pub label: BackupLabel,
    /// Label of the backup this one references, absent for fulls.
    pub prior: Option<BackupLabel>,
    pub archive_id: String,
    pub start_lsn: Lsn,
    pub stop_lsn: Lsn,
    /// First WAL segment the backup needs for recovery.
    pub wal_start: String,
    /// Last WAL segment the backup needs to reach consistency.
    pub wal_stop: String,
    pub timestamp_start: DateTime<Utc>,
    pub timestamp_stop: DateTime<Utc>,
    /// SHA-1 of the saved manifest, for cross-repository ambiguity checks.
    pub manifest_checksum: String,
}

impl BackupEntry {
    pub fn backup_type(&self) -> BackupType {
        self.label.backup_type()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupInfo {
    pub version: Option<PgVersion>,
    pub system_id: Option<u64>,
    /// Object versioning state of the backing store, recorded at
    /// stanza-create. Changing it afterwards is rejected.
    pub versioning: bool,
    pub backups: Vec<BackupEntry>,
}

impl BackupInfo {
    pub fn new(version: PgVersion, system_id: u64, versioning: bool) -> Self {
        BackupInfo {
            version: Some(version),
            system_id: Some(system_id),
            versioning,
            backups: Vec::new(),
        }
    }

    pub fn check(&self, version: PgVersion, system_id: u64) -> Result<()> {
        if self.version != Some(version) || self.system_id != Some(system_id) {
            return Err(Error::DbMismatch(format!(
                "PostgreSQL version {version}, system-id {system_id} do not match \
                 backup.info version {:?}, system-id {:?}",
                self.version, self.system_id
            )));
        }
        Ok(())
    }

    /// Record a completed backup, keeping the list label-sorted (label order
    /// is chronological by construction).
    pub fn add(&mut self, entry: BackupEntry) {
        self.backups.push(entry);
        self.backups.sort_by(|a, b| a.label.cmp(&b.label));
    }

    pub fn find(&self, label: &BackupLabel) -> Option<&BackupEntry> {
        self.backups.iter().find(|b| &b.label == label)
    }

    pub fn latest(&self) -> Option<&BackupEntry> {
        self.backups.last()
    }

    /// The dependency chain of `label`, oldest first, ending with `label`
    /// itself. Fails if a link is missing from the registry.
    pub fn chain(&self, label: &BackupLabel) -> Result<Vec<&BackupEntry>> {
        let mut chain = Vec::new();
        let mut current = self.find(label).ok_or_else(|| {
            Error::FileMissing(format!("backup '{label}' is not in backup.info"))
        })?;
        chain.push(current);
        while let Some(prior) = &current.prior {
            current = self.find(prior).ok_or_else(|| {
                Error::Format(format!(
                    "backup '{label}' references missing backup '{prior}'"
                ))
            })?;
            chain.push(current);
        }
        chain.reverse();
        Ok(chain)
    }

    /// Backups to remove under count-based full retention: everything older
    /// than the N-th newest full, plus dependents of removed fulls.
    pub fn expired(&self, retention_full: u32) -> Vec<&BackupEntry> {
        let fulls: Vec<&BackupEntry> = self
            .backups
            .iter()
            .filter(|b| b.backup_type() == BackupType::Full)
            .collect();
        if fulls.len() <= retention_full as usize {
            return Vec::new();
        }
        let cutoff = &fulls[fulls.len() - retention_full as usize].label;
        self.backups.iter().filter(|b| &b.label < cutoff).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(label: &str, prior: Option<&str>) -> BackupEntry {
        BackupEntry {
            label: label.parse().unwrap(),
            prior: prior.map(|p| p.parse().unwrap()),
            archive_id: "16-1".into(),
            start_lsn: Lsn(0x1000),
            stop_lsn: Lsn(0x2000),
            wal_start: "000000010000000000000001".into(),
            wal_stop: "000000010000000000000002".into(),
            timestamp_start: Utc::now(),
            timestamp_stop: Utc::now(),
            manifest_checksum: "da39a3ee5e6b4b0d3255bfef95601890afd80709".into(),
        }
    }

    #[test]
    fn chain_resolves_through_priors() {
        let mut info = BackupInfo::new(PgVersion(160000), 7, false);
        info.add(entry("20240101-000000F", None));
        info.add(entry("20240101-000000F_20240102-000000D", Some("20240101-000000F")));
        info.add(entry(
            "20240101-000000F_20240103-000000I",
            Some("20240101-000000F_20240102-000000D"),
        ));

        let chain = info
            .chain(&"20240101-000000F_20240103-000000I".parse().unwrap())
            .unwrap();
        let labels: Vec<String> = chain.iter().map(|e| e.label.to_string()).collect();
        assert_eq!(
            labels,
            vec![
                "20240101-000000F",
                "20240101-000000F_20240102-000000D",
                "20240101-000000F_20240103-000000I",
            ]
        );
    }

    #[test]
    fn broken_chain_is_a_format_error() {
        let mut info = BackupInfo::new(PgVersion(160000), 7, false);
        info.add(entry(
            "20240101-000000F_20240103-000000I",
            Some("20240101-000000F"),
        ));
        assert!(matches!(
            info.chain(&"20240101-000000F_20240103-000000I".parse().unwrap()),
            Err(Error::Format(_))
        ));
    }

    #[test]
    fn count_based_retention() {
        let mut info = BackupInfo::new(PgVersion(160000), 7, false);
        info.add(entry("20240101-000000F", None));
        info.add(entry("20240101-000000F_20240102-000000I", Some("20240101-000000F")));
        info.add(entry("20240201-000000F", None));
        info.add(entry("20240301-000000F", None));

        let expired: Vec<String> = info
            .expired(2)
            .iter()
            .map(|e| e.label.to_string())
            .collect();
        assert_eq!(
            expired,
            vec!["20240101-000000F", "20240101-000000F_20240102-000000I"]
        );
        assert!(info.expired(3).is_empty());
    }
}

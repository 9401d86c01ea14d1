//! The backup manifest: every file, path and link in the cluster, with the
//! attributes restore needs to reproduce them exactly.
//!
//! Manifests are mutated only between start-backup and save; after save they
//! are immutable and protected by a `.copy` written alongside.

use std::collections::BTreeMap;

use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use pg_wal::PgVersion;
use repo_storage::bundle::BundleRef;
use repo_storage::{GenericRepoStorage, RepoPath};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use utils::lsn::Lsn;

use super::block_incr::BlockIncrMap;
use super::label::{BackupLabel, BackupType};
use super::page_verify::PageCheckResult;
use crate::errors::{Error, Result};

pub const MANIFEST_FILE: &str = "manifest.json";

/// One regular file of the cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    pub size: u64,
    /// Mtime in unix seconds, used by incremental detection and delta
    /// restore.
    pub mtime: i64,
    pub mode: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// SHA-1 of the file content (decompressed, decrypted). Empty files have
    /// no hash.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    /// Bytes actually stored in the repository after the filter stack.
    #[serde(default)]
    pub repo_size: u64,
    /// Label of the ancestor backup holding this file's bytes; set for
    /// unchanged files in differential/incremental backups.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference: Option<BackupLabel>,
    /// Where the payload sits when the repository bundles small files.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bundle: Option<BundleRef>,
    /// Block-incremental map; present when the file was stored as deltas
    /// against the referenced backup.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_incr: Option<BlockIncrMap>,
    /// Result of page verification for relation files.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_check: Option<PageCheckResult>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathEntry {
    pub mode: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkEntry {
    pub destination: Utf8PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub label: BackupLabel,
    pub backup_type: BackupType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prior: Option<BackupLabel>,
    pub version: PgVersion,
    pub system_id: u64,
    pub start_lsn: Lsn,
    pub stop_lsn: Lsn,
    pub wal_start: String,
    pub wal_stop: String,
    pub timestamp_start: DateTime<Utc>,
    pub timestamp_stop: DateTime<Utc>,
    /// backup_label bytes captured from stop-backup (non-exclusive forms).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tablespace_map: Option<String>,
    /// Keyed by path relative to the backup root, e.g. `pg_data/base/1/1259`.
    pub files: BTreeMap<String, FileEntry>,
    pub paths: BTreeMap<String, PathEntry>,
    pub links: BTreeMap<String, LinkEntry>,
}

impl Manifest {
    /// Check the structural invariants before save.
    pub fn validate(&self) -> Result<()> {
        for (path, file) in &self.files {
            if file.size > 0 && file.checksum.as_deref().unwrap_or("").is_empty() {
                return Err(Error::Assert(format!(
                    "manifest file '{path}' has size {} but no checksum",
                    file.size
                )));
            }
            if file.reference.is_some() && file.bundle.is_some() {
                return Err(Error::Assert(format!(
                    "manifest file '{path}' is referenced but carries stored bytes"
                )));
            }
        }
        if self.backup_type != BackupType::Full && self.prior.is_none() {
            return Err(Error::Assert(format!(
                "{} backup '{}' has no prior backup",
                self.backup_type, self.label
            )));
        }
        Ok(())
    }

    /// Repository directory of this backup.
    pub fn repo_dir(&self, stanza: &str) -> RepoPath {
        crate::archive::backup_path(stanza).join(self.label.as_str())
    }

    /// Repository path of one stored file of this backup (not valid for
    /// referenced or bundled files).
    pub fn repo_file(&self, stanza: &str, file_path: &str) -> RepoPath {
        self.repo_dir(stanza).join(file_path)
    }

    /// Serialize with the checksum envelope shared with the info files.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        self.validate()?;
        crate::info::render(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Manifest> {
        crate::info::parse(bytes)
    }

    /// Save the manifest and its `.copy` into the backup directory.
    pub async fn save(
        &self,
        storage: &GenericRepoStorage,
        stanza: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let bytes = self.to_bytes()?;
        let checksum = {
            use sha1::{Digest, Sha1};
            let mut hasher = Sha1::new();
            hasher.update(&bytes);
            hex::encode(hasher.finalize())
        };
        let path = self.repo_dir(stanza).join(MANIFEST_FILE);
        crate::info::save_raw(storage, &path, &bytes, cancel).await?;
        Ok(checksum)
    }

    pub async fn load(
        storage: &GenericRepoStorage,
        stanza: &str,
        label: &BackupLabel,
        cancel: &CancellationToken,
    ) -> Result<Manifest> {
        let path = crate::archive::backup_path(stanza)
            .join(label.as_str())
            .join(MANIFEST_FILE);
        let bytes = crate::info::load_raw(storage, &path, cancel)
            .await?
            .ok_or_else(|| {
                Error::FileMissing(format!("manifest for backup '{label}' not found"))
            })?;
        Self::from_bytes(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_manifest() -> Manifest {
        Manifest {
            label: "20240315-102030F".parse().unwrap(),
            backup_type: BackupType::Full,
            prior: None,
            version: PgVersion(160000),
            system_id: 42,
            start_lsn: Lsn(0x1_0000_0000),
            stop_lsn: Lsn(0x1_0100_0000),
            wal_start: "000000010000000100000000".into(),
            wal_stop: "000000010000000100000001".into(),
            timestamp_start: Utc::now(),
            timestamp_stop: Utc::now(),
            backup_label: Some("START WAL LOCATION: ...".into()),
            tablespace_map: None,
            files: BTreeMap::new(),
            paths: BTreeMap::new(),
            links: BTreeMap::new(),
        }
    }

    fn file(size: u64, checksum: Option<&str>) -> FileEntry {
        FileEntry {
            size,
            mtime: 1_700_000_000,
            mode: 0o600,
            user: None,
            group: None,
            checksum: checksum.map(str::to_string),
            repo_size: size,
            reference: None,
            bundle: None,
            block_incr: None,
            page_check: None,
        }
    }

    #[test]
    fn roundtrip() {
        let mut manifest = base_manifest();
        manifest
            .files
            .insert("pg_data/PG_VERSION".into(), file(3, Some("abc")));
        let bytes = manifest.to_bytes().unwrap();
        assert_eq!(Manifest::from_bytes(&bytes).unwrap(), manifest);
    }

    #[test]
    fn nonempty_file_requires_checksum() {
        let mut manifest = base_manifest();
        manifest
            .files
            .insert("pg_data/base/1/1259".into(), file(8192, None));
        assert!(matches!(manifest.validate(), Err(Error::Assert(_))));

        // empty files are exempt
        let mut manifest = base_manifest();
        manifest.files.insert("pg_data/empty".into(), file(0, None));
        manifest.validate().unwrap();
    }

    #[test]
    fn referenced_file_cannot_carry_bytes() {
        let mut manifest = base_manifest();
        let mut entry = file(100, Some("abc"));
        entry.reference = Some("20240301-000000F".parse().unwrap());
        entry.bundle = Some(BundleRef {
            bundle_id: 1,
            offset: 0,
            size: 100,
        });
        manifest.files.insert("pg_data/base/1/1259".into(), entry);
        assert!(matches!(manifest.validate(), Err(Error::Assert(_))));
    }

    #[test]
    fn dependent_backup_requires_prior() {
        let mut manifest = base_manifest();
        manifest.label = "20240315-102030F_20240316-000000I".parse().unwrap();
        manifest.backup_type = BackupType::Incr;
        assert!(matches!(manifest.validate(), Err(Error::Assert(_))));

        manifest.prior = Some("20240315-102030F".parse().unwrap());
        manifest.validate().unwrap();
    }
}

//! The per-stanza, per-repository registries: `archive.info` and
//! `backup.info`.
//!
//! Both files map the live cluster's identity (system-id + version) to the
//! archive-id history and, for backups, to the list of completed backup
//! sets. Every save is dual-written (`file` then `file.copy`); every load
//! accepts whichever of the two parses and passes its self-checksum, so one
//! torn write never loses the registry.

use camino::Utf8PathBuf;
use pg_wal::PgVersion;
use repo_storage::{GenericRepoStorage, RepoPath};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha1::{Digest, Sha1};
use tokio_util::sync::CancellationToken;

use crate::errors::{Error, Result};

mod archive_info;
mod backup_info;

pub use archive_info::{ArchiveInfo, ArchiveEntry};
pub use backup_info::{BackupEntry, BackupInfo};

pub const ARCHIVE_INFO_FILE: &str = "archive.info";
pub const BACKUP_INFO_FILE: &str = "backup.info";
const COPY_EXT: &str = "copy";

/// Envelope adding a content checksum to a registry file.
#[derive(Debug, Serialize, Deserialize)]
struct Checked<T> {
    checksum: String,
    data: T,
}

fn content_checksum(data: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Serialize `data` with its checksum envelope.
pub(crate) fn render<T: Serialize>(data: &T) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(data)
        .map_err(|e| Error::Format(format!("unable to serialize info file: {e}")))?;
    let envelope = Checked {
        checksum: content_checksum(&payload),
        data: serde_json::from_slice::<serde_json::Value>(&payload).expect("just serialized"),
    };
    serde_json::to_vec_pretty(&envelope)
        .map_err(|e| Error::Format(format!("unable to serialize info file: {e}")))
}

/// Parse and verify one copy of a registry file.
pub(crate) fn parse<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let envelope: Checked<serde_json::Value> = serde_json::from_slice(bytes)
        .map_err(|e| Error::Format(format!("unable to parse info file: {e}")))?;
    let payload = serde_json::to_vec(&envelope.data)
        .map_err(|e| Error::Format(format!("unable to parse info file: {e}")))?;
    if content_checksum(&payload) != envelope.checksum {
        return Err(Error::Format("info file checksum mismatch".into()));
    }
    serde_json::from_value(envelope.data)
        .map_err(|e| Error::Format(format!("unable to parse info file: {e}")))
}

/// Load a registry, trying `path` then `path.copy`; either suffices.
pub async fn load<T: DeserializeOwned>(
    storage: &GenericRepoStorage,
    path: &RepoPath,
    cancel: &CancellationToken,
) -> Result<Option<T>> {
    for candidate in [path.clone(), copy_path(path)] {
        match storage.read(&candidate, None, true, cancel).await {
            Ok(Some(download)) => {
                let bytes = repo_storage::download_to_vec(download)
                    .await
                    .map_err(Error::from)?;
                match parse(&bytes) {
                    Ok(value) => return Ok(Some(value)),
                    Err(e) => {
                        tracing::warn!("invalid info file '{candidate}': {e}, trying the copy")
                    }
                }
            }
            Ok(None) => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(None)
}

/// Save a registry: main file first, then the `.copy`; both carry identical
/// contents so a reader can accept either.
pub async fn save<T: Serialize>(
    storage: &GenericRepoStorage,
    path: &RepoPath,
    data: &T,
    cancel: &CancellationToken,
) -> Result<()> {
    let bytes = render(data)?;
    for target in [path.clone(), copy_path(path)] {
        storage
            .write_bytes(&target, bytes::Bytes::from(bytes.clone()), cancel)
            .await
            .map_err(|e| Error::FileWrite(format!("info file '{target}': {e:#}")))?;
    }
    Ok(())
}

/// Dual-write pre-rendered bytes (manifests reuse the envelope but render
/// once to keep the checksum stable across the two copies).
pub(crate) async fn save_raw(
    storage: &GenericRepoStorage,
    path: &RepoPath,
    bytes: &[u8],
    cancel: &CancellationToken,
) -> Result<()> {
    for target in [path.clone(), copy_path(path)] {
        storage
            .write_bytes(&target, bytes::Bytes::copy_from_slice(bytes), cancel)
            .await
            .map_err(|e| Error::FileWrite(format!("'{target}': {e:#}")))?;
    }
    Ok(())
}

/// Read raw bytes, trying `path` then `path.copy`.
pub(crate) async fn load_raw(
    storage: &GenericRepoStorage,
    path: &RepoPath,
    cancel: &CancellationToken,
) -> Result<Option<Vec<u8>>> {
    for candidate in [path.clone(), copy_path(path)] {
        match storage.read(&candidate, None, true, cancel).await {
            Ok(Some(download)) => {
                return Ok(Some(
                    repo_storage::download_to_vec(download)
                        .await
                        .map_err(Error::from)?,
                ))
            }
            Ok(None) => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(None)
}

fn copy_path(path: &RepoPath) -> RepoPath {
    let mut name = path.get_path().to_string();
    name.push('.');
    name.push_str(COPY_EXT);
    RepoPath::new(Utf8PathBuf::from(name).as_path()).expect("copy path stays relative")
}

/// Archive-id of the form `<display-version>-<sequence>`, e.g. `9.6-1`,
/// `16-2`. The sequence bumps on stanza-upgrade.
pub fn archive_id(version: PgVersion, sequence: u32) -> String {
    format!("{version}-{sequence}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        value: u32,
    }

    #[test]
    fn render_parse_roundtrip() {
        let sample = Sample {
            name: "alpha".into(),
            value: 7,
        };
        let bytes = render(&sample).unwrap();
        let parsed: Sample = parse(&bytes).unwrap();
        assert_eq!(parsed, sample);
    }

    #[test]
    fn checksum_mismatch_is_rejected() {
        let sample = Sample {
            name: "alpha".into(),
            value: 7,
        };
        let mut bytes = render(&sample).unwrap();
        // corrupt the payload without touching the stored checksum
        let pos = bytes.windows(5).position(|w| w == b"alpha").unwrap();
        bytes[pos] = b'o';
        assert!(matches!(parse::<Sample>(&bytes), Err(Error::Format(_))));
    }

    #[test]
    fn archive_id_format() {
        assert_eq!(archive_id(PgVersion(90600), 1), "9.6-1");
        assert_eq!(archive_id(PgVersion(160000), 3), "16-3");
    }

    #[test]
    fn copy_path_appends_extension() {
        let path = RepoPath::from_string("archive/main/archive.info").unwrap();
        assert_eq!(
            copy_path(&path).get_path().as_str(),
            "archive/main/archive.info.copy"
        );
    }
}

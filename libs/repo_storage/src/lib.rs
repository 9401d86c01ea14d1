//! A uniform repository interface over posix filesystems, S3, Azure Blob,
//! Google Cloud Storage, and SFTP.
//!
//! Every backend exposes the same small capability set: `info`, `list`,
//! `read`, `write`, `remove`, `remove_prefix`. Writes are atomic: the
//! destination becomes visible only after full content commit, by rename on
//! filesystem-like backends and by discrete upload or multipart-complete on
//! object stores. Dispatch is by enum tag, not trait objects, so the set of
//! backends is closed and visible at every call site.

use std::collections::HashMap;
use std::fmt::Debug;
use std::num::NonZeroU32;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

mod azure_blob;
pub mod bundle;
pub mod error;
pub mod filter;
mod gcs_bucket;
mod local_fs;
mod s3_bucket;
mod sftp;

pub use self::azure_blob::AzureBlobStorage;
pub use self::error::{Cancelled, DownloadError, WriteErrorKind};
pub use self::gcs_bucket::GcsBucket;
pub use self::local_fs::LocalFs;
pub use self::s3_bucket::S3Bucket;
pub use self::sftp::SftpStorage;

/// Path separator of repository keys on every backend.
pub const REPO_PATH_SEPARATOR: char = '/';

/// Default limit for a single listing response, for backends that page.
pub const DEFAULT_MAX_KEYS_PER_LIST_RESPONSE: Option<i32> = Some(1000);

/// Suffix of temp objects on rename-atomic backends; a leftover is a crashed
/// prior attempt and is deleted on retry.
pub const TMP_SUFFIX: &str = "pgvault.tmp";

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Relative path of an object inside a repository. Always `/`-separated,
/// never absolute, never containing `..`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RepoPath(Utf8PathBuf);

impl std::fmt::Display for RepoPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl RepoPath {
    pub fn new(relative_path: &Utf8Path) -> anyhow::Result<Self> {
        anyhow::ensure!(
            relative_path.is_relative(),
            "repository path '{relative_path}' is not relative"
        );
        anyhow::ensure!(
            !relative_path
                .components()
                .any(|c| matches!(c, camino::Utf8Component::ParentDir)),
            "repository path '{relative_path}' contains '..'"
        );
        Ok(Self(relative_path.to_path_buf()))
    }

    pub fn from_string(relative_path: &str) -> anyhow::Result<Self> {
        Self::new(Utf8Path::new(relative_path))
    }

    pub fn with_base(&self, base_path: &Utf8Path) -> Utf8PathBuf {
        base_path.join(&self.0)
    }

    pub fn get_path(&self) -> &Utf8PathBuf {
        &self.0
    }

    pub fn join(&self, path: impl AsRef<Utf8Path>) -> Self {
        Self(self.0.join(path))
    }

    /// Base name of the object, e.g. the segment file name.
    pub fn object_name(&self) -> Option<&str> {
        self.0.file_name()
    }

    pub fn extension(&self) -> Option<&str> {
        self.0.extension()
    }
}

/// Which attributes of an object `info`/`list` must populate. Cheaper levels
/// let backends skip stat calls or extra head requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum InfoLevel {
    /// Existence and type only.
    Exists,
    /// Plus size and mtime.
    Basic,
    /// Plus mode, user, group, link destination (posix/sftp only).
    Detail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    File,
    Path,
    Link,
    Special,
}

/// Attributes of one repository object. Which fields are populated depends on
/// the requested [`InfoLevel`] and the backend's capabilities; object stores
/// have neither modes nor owners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub exists: bool,
    pub kind: ObjectKind,
    pub size: Option<u64>,
    pub mtime: Option<SystemTime>,
    pub mode: Option<u32>,
    pub user: Option<String>,
    pub group: Option<String>,
    pub link_dest: Option<Utf8PathBuf>,
}

impl ObjectInfo {
    pub fn missing() -> Self {
        ObjectInfo {
            exists: false,
            kind: ObjectKind::Special,
            size: None,
            mtime: None,
            mode: None,
            user: None,
            group: None,
            link_dest: None,
        }
    }

    pub fn file(size: u64, mtime: Option<SystemTime>) -> Self {
        ObjectInfo {
            exists: true,
            kind: ObjectKind::File,
            size: Some(size),
            mtime,
            mode: None,
            user: None,
            group: None,
            link_dest: None,
        }
    }
}

/// One entry of a listing.
#[derive(Debug, Clone)]
pub struct ListEntry {
    pub path: RepoPath,
    pub info: ObjectInfo,
}

/// Options controlling a write. Backends ignore what they cannot express.
#[derive(Debug, Clone)]
pub struct WriteOptions {
    /// Create missing parent paths. Object stores have no paths; always true
    /// there.
    pub create_path: bool,
    /// Mode for the file (posix/sftp).
    pub mode_file: Option<u32>,
    /// Mode for created parents (posix/sftp).
    pub mode_path: Option<u32>,
    /// Fsync the file before rename (posix).
    pub sync_file: bool,
    /// Fsync the parent after rename (posix).
    pub sync_path: bool,
    /// Hint that the content is already compressed or encrypted, so
    /// transport-level compression would be wasted.
    pub compressible: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        WriteOptions {
            create_path: true,
            mode_file: None,
            mode_path: None,
            sync_file: true,
            sync_path: true,
            compressible: true,
        }
    }
}

/// Streamed object content with its length when known up front.
pub struct Download {
    pub stream: DownloadStream,
    /// Total bytes the stream will yield, when the backend knows.
    pub size: Option<u64>,
}

pub type DownloadStream =
    Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send + Sync + 'static>>;

/// Collect a download into memory. Info files, manifests and status files
/// are small; segment and backup file transfer goes through the stream.
pub async fn download_to_vec(download: Download) -> Result<Vec<u8>, DownloadError> {
    use futures::StreamExt;
    let mut stream = download.stream;
    let mut result = Vec::with_capacity(download.size.unwrap_or(0) as usize);
    while let Some(chunk) = stream.next().await {
        result.extend_from_slice(&chunk.map_err(|e| DownloadError::Other(e.into()))?);
    }
    Ok(result)
}

/// Wrap a buffer as a one-chunk download stream.
pub fn stream_from_bytes(bytes: Bytes) -> DownloadStream {
    Box::pin(futures::stream::once(futures::future::ready(Ok(bytes))))
}

/// Byte range of a read: `(offset, optional length)`.
pub type ReadRange = (u64, Option<u64>);

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct S3Config {
    pub bucket_name: String,
    pub bucket_region: String,
    pub prefix_in_bucket: Option<String>,
    pub endpoint: Option<String>,
    pub concurrency_limit: NonZeroU32,
    pub max_keys_per_list_response: Option<i32>,
    pub upload_storage_class: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct AzureConfig {
    pub account: String,
    pub container: String,
    pub prefix_in_container: Option<String>,
    pub concurrency_limit: NonZeroU32,
    pub max_keys_per_list_response: Option<i32>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct GcsConfig {
    pub bucket_name: String,
    pub prefix_in_bucket: Option<String>,
    pub concurrency_limit: NonZeroU32,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct SftpConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub base_path: Utf8PathBuf,
    /// Private key file; password auth is intentionally unsupported.
    pub key_file: Utf8PathBuf,
    pub known_hosts_check: bool,
}

/// Where a repository lives.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RepoStorageKind {
    Posix { path: Utf8PathBuf },
    S3(S3Config),
    Azure(AzureConfig),
    Gcs(GcsConfig),
    Sftp(SftpConfig),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RepoStorageConfig {
    pub storage: RepoStorageKind,
    /// Per-operation timeout; every suspension point in a backend honors it.
    #[serde(
        with = "humantime_serde_approx",
        default = "RepoStorageConfig::default_timeout"
    )]
    pub timeout: Duration,
}

impl RepoStorageConfig {
    fn default_timeout() -> Duration {
        DEFAULT_TIMEOUT
    }
}

/// (De)serialize `Duration` in the humantime format used across the config.
mod humantime_serde_approx {
    use super::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&humantime::format_duration(*d).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(de)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

/// The runtime sum of backends. Cloning is cheap; the inner clients are
/// behind `Arc`.
#[derive(Clone)]
pub enum GenericRepoStorage {
    LocalFs(Arc<LocalFs>),
    AwsS3(Arc<S3Bucket>),
    AzureBlob(Arc<AzureBlobStorage>),
    Gcs(Arc<GcsBucket>),
    Sftp(Arc<SftpStorage>),
}

impl Debug for GenericRepoStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LocalFs(s) => write!(f, "LocalFs({})", s.root()),
            Self::AwsS3(s) => write!(f, "AwsS3({})", s.bucket_name()),
            Self::AzureBlob(s) => write!(f, "AzureBlob({})", s.container_name()),
            Self::Gcs(s) => write!(f, "Gcs({})", s.bucket_name()),
            Self::Sftp(s) => write!(f, "Sftp({})", s.location()),
        }
    }
}

impl GenericRepoStorage {
    pub async fn from_config(config: &RepoStorageConfig) -> anyhow::Result<Self> {
        let timeout = config.timeout;
        Ok(match &config.storage {
            RepoStorageKind::Posix { path } => {
                tracing::info!("Using fs root '{path}' as a repository");
                Self::LocalFs(Arc::new(LocalFs::new(path.clone(), timeout)?))
            }
            RepoStorageKind::S3(s3_config) => {
                tracing::info!(
                    "Using s3 bucket '{}' in region '{}' as a repository, prefix in bucket: '{:?}'",
                    s3_config.bucket_name,
                    s3_config.bucket_region,
                    s3_config.prefix_in_bucket
                );
                Self::AwsS3(Arc::new(S3Bucket::new(s3_config, timeout)?))
            }
            RepoStorageKind::Azure(azure_config) => {
                tracing::info!(
                    "Using azure container '{}' in account '{}' as a repository, prefix in container: '{:?}'",
                    azure_config.container,
                    azure_config.account,
                    azure_config.prefix_in_container
                );
                Self::AzureBlob(Arc::new(AzureBlobStorage::new(azure_config, timeout)?))
            }
            RepoStorageKind::Gcs(gcs_config) => {
                tracing::info!(
                    "Using gcs bucket '{}' as a repository, prefix in bucket: '{:?}'",
                    gcs_config.bucket_name,
                    gcs_config.prefix_in_bucket
                );
                Self::Gcs(Arc::new(GcsBucket::new(gcs_config, timeout).await?))
            }
            RepoStorageKind::Sftp(sftp_config) => {
                tracing::info!(
                    "Using sftp host '{}' path '{}' as a repository",
                    sftp_config.host,
                    sftp_config.base_path
                );
                Self::Sftp(Arc::new(SftpStorage::new(sftp_config, timeout).await?))
            }
        })
    }

    /// Attributes of one object.
    pub async fn info(
        &self,
        path: &RepoPath,
        level: InfoLevel,
        cancel: &CancellationToken,
    ) -> anyhow::Result<ObjectInfo> {
        match self {
            Self::LocalFs(s) => s.info(path, level).await,
            Self::AwsS3(s) => s.info(path, cancel).await,
            Self::AzureBlob(s) => s.info(path, cancel).await,
            Self::Gcs(s) => s.info(path, cancel).await,
            Self::Sftp(s) => s.info(path, level).await,
        }
    }

    /// List objects under a prefix. `expression` filters by object name.
    pub async fn list(
        &self,
        prefix: Option<&RepoPath>,
        level: InfoLevel,
        recurse: bool,
        expression: Option<&regex::Regex>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Vec<ListEntry>> {
        let mut entries = match self {
            Self::LocalFs(s) => s.list(prefix, level, recurse).await?,
            Self::AwsS3(s) => s.list(prefix, recurse, cancel).await?,
            Self::AzureBlob(s) => s.list(prefix, recurse, cancel).await?,
            Self::Gcs(s) => s.list(prefix, recurse, cancel).await?,
            Self::Sftp(s) => s.list(prefix, level, recurse).await?,
        };
        if let Some(expression) = expression {
            entries.retain(|e| {
                e.path
                    .object_name()
                    .map(|name| expression.is_match(name))
                    .unwrap_or(false)
            });
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    /// Open an object for reading, optionally from an offset with a length
    /// limit. `ignore_missing` turns absence into `Ok(None)`.
    pub async fn read(
        &self,
        path: &RepoPath,
        range: Option<ReadRange>,
        ignore_missing: bool,
        cancel: &CancellationToken,
    ) -> Result<Option<Download>, DownloadError> {
        let res = match self {
            Self::LocalFs(s) => s.read(path, range).await,
            Self::AwsS3(s) => s.read(path, range, cancel).await,
            Self::AzureBlob(s) => s.read(path, range, cancel).await,
            Self::Gcs(s) => s.read(path, range, cancel).await,
            Self::Sftp(s) => s.read(path, range).await,
        };
        match res {
            Ok(download) => Ok(Some(download)),
            Err(DownloadError::NotFound) if ignore_missing => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Write an object atomically: it becomes visible under `path` only once
    /// all `data` has been committed.
    pub async fn write(
        &self,
        path: &RepoPath,
        data: DownloadStream,
        size_hint: Option<usize>,
        opts: &WriteOptions,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        match self {
            Self::LocalFs(s) => s.write(path, data, opts).await,
            Self::AwsS3(s) => s.write(path, data, size_hint, opts, cancel).await,
            Self::AzureBlob(s) => s.write(path, data, size_hint, cancel).await,
            Self::Gcs(s) => s.write(path, data, size_hint, cancel).await,
            Self::Sftp(s) => s.write(path, data, opts).await,
        }
    }

    /// Convenience for small objects already in memory.
    pub async fn write_bytes(
        &self,
        path: &RepoPath,
        bytes: Bytes,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        let size = bytes.len();
        self.write(
            path,
            stream_from_bytes(bytes),
            Some(size),
            &WriteOptions::default(),
            cancel,
        )
        .await
    }

    pub async fn remove(
        &self,
        path: &RepoPath,
        error_on_missing: bool,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        let res = match self {
            Self::LocalFs(s) => s.remove(path).await,
            Self::AwsS3(s) => s.remove(path, cancel).await,
            Self::AzureBlob(s) => s.remove(path, cancel).await,
            Self::Gcs(s) => s.remove(path, cancel).await,
            Self::Sftp(s) => s.remove(path).await,
        };
        match res {
            Err(e) if !error_on_missing && is_not_found(&e) => Ok(()),
            other => other,
        }
    }

    /// Remove everything under a prefix.
    pub async fn remove_prefix(
        &self,
        prefix: &RepoPath,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        match self {
            Self::LocalFs(s) => s.remove_prefix(prefix).await,
            Self::AwsS3(s) => s.remove_prefix(prefix, cancel).await,
            Self::AzureBlob(s) => s.remove_prefix(prefix, cancel).await,
            Self::Gcs(s) => s.remove_prefix(prefix, cancel).await,
            Self::Sftp(s) => s.remove_prefix(prefix).await,
        }
    }

    /// True when object versioning protects overwrites on this backend, so
    /// deletes are markers rather than destruction.
    pub fn is_versioning_capable(&self) -> bool {
        matches!(self, Self::AwsS3(_) | Self::Gcs(_) | Self::AzureBlob(_))
    }
}

fn is_not_found(e: &anyhow::Error) -> bool {
    e.chain().any(|cause| {
        cause
            .downcast_ref::<std::io::Error>()
            .map(|io| io.kind() == std::io::ErrorKind::NotFound)
            .unwrap_or(false)
            || cause.downcast_ref::<DownloadError>().is_some_and(|d| matches!(d, DownloadError::NotFound))
    })
}

/// Extra object metadata some backends can attach to uploads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageMetadata(pub HashMap<String, String>);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repo_path_validation() {
        RepoPath::from_string("archive/main/wal").unwrap();
        assert!(RepoPath::from_string("/absolute").is_err());
        assert!(RepoPath::from_string("up/../../and/away").is_err());
    }

    #[test]
    fn repo_path_parts() {
        let path = RepoPath::from_string("backup/main/manifest.json").unwrap();
        assert_eq!(path.object_name(), Some("manifest.json"));
        assert_eq!(path.extension(), Some("json"));
        assert_eq!(
            path.with_base(Utf8Path::new("/repo")),
            Utf8PathBuf::from("/repo/backup/main/manifest.json")
        );
        assert_eq!(
            path.join("x").get_path().as_str(),
            "backup/main/manifest.json/x"
        );
    }

    #[test]
    fn storage_kind_serde() {
        let config = RepoStorageConfig {
            storage: RepoStorageKind::Posix {
                path: Utf8PathBuf::from("/var/lib/walvault"),
            },
            timeout: Duration::from_secs(10),
        };
        let json = serde_json::to_string(&config).unwrap();
        let parsed: RepoStorageConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }
}

//! Repository layout and shared helpers for the WAL archive.
//!
//! Archived segments are content-addressed: the repository object name is
//! `<segment>-<sha1>[.<compress-ext>]` under
//! `archive/<stanza>/<archive-id>/<tli+log>/`. The hash in the name is what
//! makes duplicate detection and last-writer-wins safe.

pub mod get;
pub mod push;
pub mod queue;
pub mod spool;

use pg_wal::WalSegment;
use repo_storage::filter::{
    CompressFilter, DecompressFilter, DecryptFilter, EncryptFilter, SizeHashFilter, StreamFilter,
    TapHandle,
};
use repo_storage::{GenericRepoStorage, InfoLevel, RepoPath};
use tokio_util::sync::CancellationToken;

use crate::config::RepoConfig;
use crate::errors::{Error, Result};

pub fn archive_path(stanza: &str) -> RepoPath {
    RepoPath::from_string(&format!("archive/{stanza}")).expect("stanza names are path-safe")
}

pub fn archive_info_path(stanza: &str) -> RepoPath {
    archive_path(stanza).join(crate::info::ARCHIVE_INFO_FILE)
}

pub fn backup_path(stanza: &str) -> RepoPath {
    RepoPath::from_string(&format!("backup/{stanza}")).expect("stanza names are path-safe")
}

pub fn backup_info_path(stanza: &str) -> RepoPath {
    backup_path(stanza).join(crate::info::BACKUP_INFO_FILE)
}

/// Directory holding one log file's worth of segments.
pub fn wal_log_path(stanza: &str, archive_id: &str, segment: &WalSegment) -> RepoPath {
    archive_path(stanza)
        .join(archive_id)
        .join(segment.log_group())
}

/// Full object path of an archived segment with a known content hash.
pub fn wal_segment_path(
    stanza: &str,
    archive_id: &str,
    segment: &WalSegment,
    sha1: &str,
    compress_ext: Option<&str>,
) -> RepoPath {
    let mut name = format!("{segment}-{sha1}");
    if let Some(ext) = compress_ext {
        name.push('.');
        name.push_str(ext);
    }
    wal_log_path(stanza, archive_id, segment).join(name)
}

/// Timeline history files live at the archive-id root, uncompressed name
/// preserved.
pub fn wal_history_path(stanza: &str, archive_id: &str, name: &str) -> RepoPath {
    archive_path(stanza).join(archive_id).join(name)
}

/// Bundle objects of one backup.
pub fn bundle_path(stanza: &str, label: &str, bundle_id: u64) -> RepoPath {
    backup_path(stanza)
        .join(label)
        .join("bundle")
        .join(bundle_id.to_string())
}

/// Locate an archived segment by listing its log group for names starting
/// with the segment name. Returns the object name (`<segment>-<hash>[.ext]`)
/// when exactly one exists.
pub async fn wal_segment_find(
    storage: &GenericRepoStorage,
    stanza: &str,
    archive_id: &str,
    segment: &WalSegment,
    cancel: &CancellationToken,
) -> Result<Option<String>> {
    let dir = wal_log_path(stanza, archive_id, segment);
    let expression = regex::Regex::new(&format!("^{segment}-[0-9a-f]{{40}}(\\.[a-z0-9]+)?$"))
        .expect("segment names are regex-safe");

    let entries = storage
        .list(Some(&dir), InfoLevel::Exists, false, Some(&expression), cancel)
        .await
        .map_err(|e| Error::FileRead(format!("unable to list '{dir}': {e:#}")))?;

    let mut names: Vec<String> = entries
        .iter()
        .filter_map(|e| e.path.object_name().map(str::to_string))
        .collect();

    match names.len() {
        0 => Ok(None),
        1 => Ok(Some(names.pop().expect("len checked"))),
        _ => Err(Error::ArchiveDuplicate(format!(
            "duplicates found in archive for WAL segment {segment}: {}",
            names.join(", ")
        ))),
    }
}

/// The write-side filter stack of one repository:
/// `size/hash tap -> compress? -> encrypt?`. The tap sees raw bytes, so the
/// hash recorded in object names and manifests is always of the plaintext.
pub fn write_filters(repo: &RepoConfig) -> (Vec<Box<dyn StreamFilter>>, TapHandle) {
    let (tap, handle) = SizeHashFilter::new();
    let mut filters: Vec<Box<dyn StreamFilter>> = vec![Box::new(tap)];
    if let Some(compress) = CompressFilter::new(repo.compress_type, repo.compress_level) {
        filters.push(compress);
    }
    if let Some(key) = &repo.cipher_key {
        filters.push(EncryptFilter::new(key));
    }
    (filters, handle)
}

/// The read-side inverse: `decrypt? -> decompress? -> size/hash tap`.
pub fn read_filters(repo: &RepoConfig) -> (Vec<Box<dyn StreamFilter>>, TapHandle) {
    let mut filters: Vec<Box<dyn StreamFilter>> = Vec::new();
    if let Some(key) = &repo.cipher_key {
        filters.push(DecryptFilter::new(key));
    }
    if let Some(decompress) = DecompressFilter::new(repo.compress_type) {
        filters.push(decompress);
    }
    let (tap, handle) = SizeHashFilter::new();
    filters.push(Box::new(tap));
    (filters, handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths() {
        let seg: WalSegment = "000000010000000200000003".parse().unwrap();
        assert_eq!(
            archive_info_path("main").get_path().as_str(),
            "archive/main/archive.info"
        );
        assert_eq!(
            wal_segment_path("main", "16-1", &seg, "ab".repeat(20).as_str(), Some("gz"))
                .get_path()
                .as_str(),
            format!(
                "archive/main/16-1/0000000100000002/000000010000000200000003-{}.gz",
                "ab".repeat(20)
            )
        );
        assert_eq!(
            wal_history_path("main", "16-1", "00000002.history")
                .get_path()
                .as_str(),
            "archive/main/16-1/00000002.history"
        );
        assert_eq!(
            backup_info_path("main").get_path().as_str(),
            "backup/main/backup.info"
        );
    }
}

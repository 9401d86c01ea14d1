//! Local filesystem repository backend.
//!
//! The atomic-write contract is met with a temp file, optional fsync, rename
//! and parent fsync. Listings recurse with an explicit stack rather than
//! following symlinks.

use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::time::Duration;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use futures::StreamExt;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use utils::crashsafe;

use crate::{
    Download, DownloadError, DownloadStream, InfoLevel, ListEntry, ObjectInfo, ObjectKind,
    ReadRange, RepoPath, WriteOptions, TMP_SUFFIX,
};

pub struct LocalFs {
    root: Utf8PathBuf,
    #[allow(unused)]
    timeout: Duration,
}

impl LocalFs {
    /// Attempts to create local FS storage, along with its root directory.
    pub fn new(root: Utf8PathBuf, timeout: Duration) -> anyhow::Result<Self> {
        if !root.exists() {
            std::fs::create_dir_all(&root)
                .with_context(|| format!("Failed to create all directories in the given root path {root:?}"))?;
        }
        Ok(Self { root, timeout })
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn resolve(&self, path: &RepoPath) -> Utf8PathBuf {
        path.with_base(&self.root)
    }

    async fn metadata_to_info(
        target: &Utf8Path,
        metadata: std::fs::Metadata,
        level: InfoLevel,
    ) -> anyhow::Result<ObjectInfo> {
        let kind = if metadata.is_dir() {
            ObjectKind::Path
        } else if metadata.is_symlink() {
            ObjectKind::Link
        } else if metadata.is_file() {
            ObjectKind::File
        } else {
            ObjectKind::Special
        };

        let mut info = ObjectInfo {
            exists: true,
            kind,
            size: None,
            mtime: None,
            mode: None,
            user: None,
            group: None,
            link_dest: None,
        };

        if level >= InfoLevel::Basic {
            if kind == ObjectKind::File {
                info.size = Some(metadata.len());
            }
            info.mtime = metadata.modified().ok();
        }

        if level >= InfoLevel::Detail {
            info.mode = Some(metadata.permissions().mode() & 0o7777);
            info.user = nix::unistd::User::from_uid(metadata.uid().into())
                .ok()
                .flatten()
                .map(|u| u.name);
            info.group = nix::unistd::Group::from_gid(metadata.gid().into())
                .ok()
                .flatten()
                .map(|g| g.name);
            if kind == ObjectKind::Link {
                let dest = fs::read_link(target)
                    .await
                    .with_context(|| format!("Failed to read link '{target}'"))?;
                info.link_dest = Utf8PathBuf::from_path_buf(dest).ok();
            }
        }

        Ok(info)
    }

    pub async fn info(&self, path: &RepoPath, level: InfoLevel) -> anyhow::Result<ObjectInfo> {
        let target = self.resolve(path);
        match fs::symlink_metadata(&target).await {
            Ok(metadata) => Self::metadata_to_info(&target, metadata, level).await,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ObjectInfo::missing()),
            Err(e) => Err(e).with_context(|| format!("Failed to stat '{target}'")),
        }
    }

    pub async fn list(
        &self,
        prefix: Option<&RepoPath>,
        level: InfoLevel,
        recurse: bool,
    ) -> anyhow::Result<Vec<ListEntry>> {
        let base = match prefix {
            Some(prefix) => self.resolve(prefix),
            None => self.root.clone(),
        };

        let mut entries = Vec::new();
        if !base.exists() {
            return Ok(entries);
        }

        // Client-side BFS; object-store backends get recursion from the
        // server instead.
        let mut pending = vec![base.clone()];
        while let Some(dir) = pending.pop() {
            let mut read_dir = fs::read_dir(&dir)
                .await
                .with_context(|| format!("Failed to list directory '{dir}'"))?;
            while let Some(entry) = read_dir
                .next_entry()
                .await
                .with_context(|| format!("Failed to list directory '{dir}'"))?
            {
                let entry_path = Utf8PathBuf::from_path_buf(entry.path())
                    .map_err(|p| anyhow::anyhow!("non-utf8 path in repository: {p:?}"))?;
                let metadata = entry
                    .metadata()
                    .await
                    .with_context(|| format!("Failed to stat '{entry_path}'"))?;
                let relative = entry_path
                    .strip_prefix(&self.root)
                    .expect("listed path is always under the root");

                if metadata.is_dir() && recurse {
                    pending.push(entry_path.clone());
                }

                let info = Self::metadata_to_info(&entry_path, metadata, level).await?;
                entries.push(ListEntry {
                    path: RepoPath::new(relative)?,
                    info,
                });
            }
        }

        Ok(entries)
    }

    pub async fn read(
        &self,
        path: &RepoPath,
        range: Option<ReadRange>,
    ) -> Result<Download, DownloadError> {
        use tokio::io::AsyncSeekExt;

        let target = self.resolve(path);
        let mut file = match fs::File::open(&target).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(DownloadError::NotFound)
            }
            Err(e) => {
                return Err(DownloadError::Other(
                    anyhow::Error::new(e).context(format!("Failed to open '{target}'")),
                ))
            }
        };

        let full_size = file
            .metadata()
            .await
            .map_err(|e| DownloadError::Other(e.into()))?
            .len();

        let (offset, limit) = range.unwrap_or((0, None));
        if offset > 0 {
            file.seek(std::io::SeekFrom::Start(offset))
                .await
                .map_err(|e| DownloadError::Other(e.into()))?;
        }

        let remaining = full_size.saturating_sub(offset);
        let size = limit.map_or(remaining, |l| l.min(remaining));

        let reader = tokio::io::AsyncReadExt::take(file, size);
        let stream = tokio_util::io::ReaderStream::with_capacity(reader, 64 * 1024);

        Ok(Download {
            stream: Box::pin(stream),
            size: Some(size),
        })
    }

    pub async fn write(
        &self,
        path: &RepoPath,
        mut data: DownloadStream,
        opts: &WriteOptions,
    ) -> anyhow::Result<()> {
        let target = self.resolve(path);
        let parent = target
            .parent()
            .ok_or_else(|| anyhow::anyhow!("object path '{target}' has no parent"))?;

        if opts.create_path && !parent.exists() {
            crashsafe::create_dir_all(parent)
                .with_context(|| format!("Failed to create '{parent}'"))?;
            if let Some(mode) = opts.mode_path {
                let perms = std::fs::Permissions::from_mode(mode);
                fs::set_permissions(parent.as_std_path(), perms).await?;
            }
        }

        let temp_path = crashsafe::path_with_suffix_extension(&target, TMP_SUFFIX);
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("Failed to create '{temp_path}'"))?;

        let result: anyhow::Result<()> = async {
            while let Some(chunk) = data.next().await {
                file.write_all(&chunk?).await?;
            }
            if opts.sync_file {
                file.sync_all().await?;
            }
            Ok(())
        }
        .await;

        if let Err(e) = result {
            drop(file);
            // the temp file is a crashed attempt now; best effort removal
            if let Err(cleanup) = fs::remove_file(&temp_path).await {
                tracing::warn!("Failed to remove temp file '{temp_path}': {cleanup}");
            }
            return Err(e.context(format!("Failed to write '{target}'")));
        }
        drop(file);

        if let Some(mode) = opts.mode_file {
            fs::set_permissions(temp_path.as_std_path(), std::fs::Permissions::from_mode(mode))
                .await?;
        }

        fs::rename(&temp_path, &target)
            .await
            .with_context(|| format!("Failed to rename '{temp_path}' to '{target}'"))?;
        if opts.sync_path {
            crashsafe::fsync_async(parent)
                .await
                .with_context(|| format!("Failed to sync '{parent}'"))?;
        }

        Ok(())
    }

    pub async fn remove(&self, path: &RepoPath) -> anyhow::Result<()> {
        let target = self.resolve(path);
        fs::remove_file(&target)
            .await
            .with_context(|| format!("Failed to remove '{target}'"))
    }

    pub async fn remove_prefix(&self, prefix: &RepoPath) -> anyhow::Result<()> {
        let target = self.resolve(prefix);
        match fs::remove_dir_all(&target).await {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            other => other.with_context(|| format!("Failed to remove '{target}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::Duration;

    fn storage() -> (camino_tempfile::Utf8TempDir, LocalFs) {
        let dir = camino_tempfile::tempdir().unwrap();
        let fs = LocalFs::new(dir.path().to_path_buf(), Duration::from_secs(10)).unwrap();
        (dir, fs)
    }

    async fn write_all(fs: &LocalFs, path: &str, content: &[u8]) {
        fs.write(
            &RepoPath::from_string(path).unwrap(),
            crate::stream_from_bytes(Bytes::copy_from_slice(content)),
            &WriteOptions::default(),
        )
        .await
        .unwrap()
    }

    async fn read_all(fs: &LocalFs, path: &str, range: Option<ReadRange>) -> Vec<u8> {
        let download = fs
            .read(&RepoPath::from_string(path).unwrap(), range)
            .await
            .unwrap();
        crate::download_to_vec(download).await.unwrap()
    }

    #[tokio::test]
    async fn write_read_roundtrip() {
        let (_dir, fs) = storage();
        write_all(&fs, "a/b/object", b"hello world").await;
        assert_eq!(read_all(&fs, "a/b/object", None).await, b"hello world");
    }

    #[tokio::test]
    async fn ranged_read() {
        let (_dir, fs) = storage();
        write_all(&fs, "object", b"0123456789").await;
        assert_eq!(read_all(&fs, "object", Some((2, Some(3)))).await, b"234");
        assert_eq!(read_all(&fs, "object", Some((7, None))).await, b"789");
        // limit past the end is clamped
        assert_eq!(read_all(&fs, "object", Some((8, Some(100)))).await, b"89");
    }

    #[tokio::test]
    async fn missing_read_is_not_found() {
        let (_dir, fs) = storage();
        let err = fs
            .read(&RepoPath::from_string("nope").unwrap(), None)
            .await
            .map(|_| ())
            .unwrap_err();
        assert!(matches!(err, DownloadError::NotFound));
    }

    #[tokio::test]
    async fn info_levels() {
        let (_dir, fs) = storage();
        write_all(&fs, "object", b"abc").await;

        let info = fs
            .info(&RepoPath::from_string("object").unwrap(), InfoLevel::Exists)
            .await
            .unwrap();
        assert!(info.exists);
        assert_eq!(info.kind, ObjectKind::File);
        assert_eq!(info.size, None);

        let info = fs
            .info(&RepoPath::from_string("object").unwrap(), InfoLevel::Detail)
            .await
            .unwrap();
        assert_eq!(info.size, Some(3));
        assert!(info.mode.is_some());

        let missing = fs
            .info(&RepoPath::from_string("nope").unwrap(), InfoLevel::Exists)
            .await
            .unwrap();
        assert!(!missing.exists);
    }

    #[tokio::test]
    async fn listing_recursive_and_flat() {
        let (_dir, fs) = storage();
        write_all(&fs, "top", b"x").await;
        write_all(&fs, "dir/nested", b"y").await;

        let flat = fs.list(None, InfoLevel::Exists, false).await.unwrap();
        let names: Vec<_> = flat.iter().map(|e| e.path.get_path().as_str()).collect();
        assert!(names.contains(&"top"));
        assert!(names.contains(&"dir"));
        assert!(!names.iter().any(|n| n.contains("nested")));

        let deep = fs.list(None, InfoLevel::Exists, true).await.unwrap();
        assert!(deep
            .iter()
            .any(|e| e.path.get_path().as_str() == "dir/nested"));
    }

    #[tokio::test]
    async fn no_temp_left_behind() {
        let (dir, fs) = storage();
        write_all(&fs, "object", b"x").await;
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(TMP_SUFFIX))
            .collect();
        assert!(leftovers.is_empty());
    }
}

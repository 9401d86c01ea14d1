//! Durable file writes: the on-disk state must survive a crash at any point,
//! so everything goes through a temp file, fsync, rename, parent fsync.

use std::fs::{self, File};
use std::io::{self, Write};

use camino::{Utf8Path, Utf8PathBuf};

/// Adds a suffix to the file(directory) name, either appending the suffix to the end of its extension,
/// or if there's no extension, creates one and puts a suffix there.
pub fn path_with_suffix_extension(original_path: impl AsRef<Utf8Path>, suffix: &str) -> Utf8PathBuf {
    let new_extension = match original_path.as_ref().extension() {
        Some(extension) => format!("{extension}.{suffix}"),
        None => suffix.to_string(),
    };
    original_path.as_ref().with_extension(new_extension)
}

/// Similar to [`std::fs::create_dir`], except we fsync the created directory
/// and its parent.
pub fn create_dir(path: impl AsRef<Utf8Path>) -> io::Result<()> {
    let path = path.as_ref();
    fs::create_dir(path)?;
    fsync_file_and_parent(path)
}

/// Similar to [`std::fs::create_dir_all`], except we fsync all newly created
/// directories and the pre-existing parent.
pub fn create_dir_all(path: impl AsRef<Utf8Path>) -> io::Result<()> {
    let mut path = path.as_ref();

    let mut dirs_to_create = Vec::new();

    // Figure out which directories we need to create.
    loop {
        match path.metadata() {
            Ok(metadata) if metadata.is_dir() => break,
            Ok(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("non-directory found in path: {path}"),
                ));
            }
            Err(ref e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        dirs_to_create.push(path);

        match path.parent() {
            Some(parent) => path = parent,
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("can't find parent of path '{path}'"),
                ));
            }
        }
    }

    // Create directories from parent to child.
    for &path in dirs_to_create.iter().rev() {
        fs::create_dir(path)?;
    }

    // Fsync the created directories from child to parent.
    for &path in dirs_to_create.iter() {
        fsync(path)?;
    }

    // If we created any new directories, fsync the parent.
    if !dirs_to_create.is_empty() {
        fsync(path)?;
    }

    Ok(())
}

/// Write a file atomically: contents land in `<path>.<tmp_suffix>` first, the
/// temp file is fsynced, renamed over `path`, and the parent is fsynced.
pub fn overwrite_file(path: &Utf8Path, tmp_suffix: &str, contents: &[u8]) -> io::Result<()> {
    let tmp_path = path_with_suffix_extension(path, tmp_suffix);
    {
        let mut file = File::create(&tmp_path)?;
        file.write_all(contents)?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    if let Some(parent) = path.parent() {
        fsync(parent)?;
    }
    Ok(())
}

pub fn fsync_file_and_parent(file_path: &Utf8Path) -> io::Result<()> {
    let parent = file_path.parent().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("File {file_path} has no parent"),
        )
    })?;

    fsync(file_path)?;
    fsync(parent)?;
    Ok(())
}

pub fn fsync(path: &Utf8Path) -> io::Result<()> {
    File::open(path)
        .map_err(|e| io::Error::new(e.kind(), format!("Failed to open the file {path}: {e}")))
        .and_then(|file| {
            file.sync_all().map_err(|e| {
                io::Error::new(e.kind(), format!("Failed to sync file {path} data: {e}"))
            })
        })
}

pub async fn fsync_async(path: impl AsRef<Utf8Path>) -> Result<(), std::io::Error> {
    tokio::fs::File::open(path.as_ref()).await?.sync_all().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_with_suffix_extension() {
        let p = Utf8PathBuf::from("/foo/bar");
        assert_eq!(
            &path_with_suffix_extension(p, "temp").to_string(),
            "/foo/bar.temp"
        );
        let p = Utf8PathBuf::from("/foo/bar.baz");
        assert_eq!(
            &path_with_suffix_extension(p, "temp_temp").to_string(),
            "/foo/bar.baz.temp_temp"
        );
        let p = Utf8PathBuf::from("/foo/bar.baz");
        assert_eq!(
            &path_with_suffix_extension(p, "..temp").to_string(),
            "/foo/bar.baz...temp"
        );
    }

    #[test]
    fn overwrite_file_is_visible_under_final_name_only() {
        let dir = camino_tempfile::tempdir().unwrap();
        let target = dir.path().join("state");

        overwrite_file(&target, "tmp", b"first").unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"first");
        assert!(!path_with_suffix_extension(&target, "tmp").exists());

        overwrite_file(&target, "tmp", b"second").unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"second");
    }

    #[test]
    fn create_dir_all_creates_missing_chain() {
        let dir = camino_tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b/c");
        create_dir_all(&nested).unwrap();
        assert!(nested.is_dir());
        // a second call is a no-op
        create_dir_all(&nested).unwrap();
    }
}

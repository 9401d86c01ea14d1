//! Per-stanza command locks.
//!
//! A mutating command holds an exclusive advisory lock on a file keyed by
//! (data path, stanza, command family). The lock file carries the holder's
//! pid and exec-id; acquiring with the exec-id already in the file succeeds,
//! so subprocesses of a single invocation share the lock.

use std::fs::{self, OpenOptions};
use std::io::{Read, Write};

use camino::{Utf8Path, Utf8PathBuf};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("unable to acquire lock on file '{0}': lock is held by {1}")]
    Held(Utf8PathBuf, String),
    #[error("lock file '{0}' error: {1}")]
    Io(Utf8PathBuf, #[source] std::io::Error),
}

/// Families of commands that exclude each other per stanza.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::AsRefStr)]
#[strum(serialize_all = "kebab-case")]
pub enum LockFamily {
    Archive,
    Backup,
    Restore,
    Stanza,
}

#[derive(Debug, Serialize, Deserialize)]
struct LockContent {
    pid: u32,
    exec_id: String,
}

/// An acquired lock. Dropping releases the advisory lock; the file is left
/// behind and reused by later acquisitions.
#[derive(Debug)]
pub struct Lock {
    file: fs::File,
    path: Utf8PathBuf,
}

impl Lock {
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn unlock(self) {
        // try_clone + unlock not needed, dropping the file releases flock
        drop(self)
    }
}

fn lock_file_path(lock_path: &Utf8Path, stanza: &str, family: LockFamily) -> Utf8PathBuf {
    lock_path.join(format!("{stanza}-{}.lock", family.as_ref()))
}

/// Acquire the lock without blocking. `exec_id` re-entrance: when the file
/// already records our exec-id, the caller is a subprocess of the holder and
/// acquisition succeeds.
pub fn lock_acquire(
    lock_path: &Utf8Path,
    stanza: &str,
    family: LockFamily,
    exec_id: &str,
) -> Result<Lock, LockError> {
    let path = lock_file_path(lock_path, stanza, family);
    let io_err = |e| LockError::Io(path.clone(), e);

    fs::create_dir_all(lock_path).map_err(io_err)?;

    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(&path)
        .map_err(io_err)?;

    if file.try_lock_exclusive().is_err() {
        // Lock is held. Same exec-id means the holder is our own invocation.
        let mut content = String::new();
        file.read_to_string(&mut content).map_err(io_err)?;
        if let Ok(held) = serde_json::from_str::<LockContent>(&content) {
            if held.exec_id == exec_id {
                return Ok(Lock { file, path });
            }
            return Err(LockError::Held(
                path,
                format!("pid {} exec-id {}", held.pid, held.exec_id),
            ));
        }
        return Err(LockError::Held(path, "unknown holder".to_string()));
    }

    let content = LockContent {
        pid: std::process::id(),
        exec_id: exec_id.to_string(),
    };
    file.set_len(0).map_err(io_err)?;
    file.write_all(serde_json::to_string(&content).unwrap().as_bytes())
        .map_err(io_err)?;
    file.sync_all().map_err(io_err)?;

    Ok(Lock { file, path })
}

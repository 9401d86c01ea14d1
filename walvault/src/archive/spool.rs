//! The spool: local scratch bridging the database's synchronous
//! archive_command and the asynchronous workers.
//!
//! Layout per stanza:
//!
//! ```text
//! <spool-path>/archive/<stanza>/in/<segment>          staged segment (get)
//! <spool-path>/archive/<stanza>/in/<segment>.ok       found, possibly with warnings
//! <spool-path>/archive/<stanza>/in/<segment>.error    fetch failed
//! <spool-path>/archive/<stanza>/out/<segment>.ok      pushed
//! <spool-path>/archive/<stanza>/out/<segment>.error   push failed
//! <spool-path>/archive/<stanza>/out/global.error      async worker died early
//! ```
//!
//! Status files follow `code \n message \n warning*`; presence carries the
//! meaning, content is the diagnostic. A `*.pgvault.tmp` anywhere here is a
//! crashed prior attempt and is swept on the next async run.

use camino::{Utf8Path, Utf8PathBuf};
use utils::crashsafe;

use crate::errors::{Error, Result};

pub const OK_EXT: &str = "ok";
pub const ERROR_EXT: &str = "error";
pub const GLOBAL_ERROR_FILE: &str = "global.error";
const TMP_SUFFIX: &str = "pgvault.tmp";

/// Outcome recorded in a status file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    /// `.ok` with optional warnings; code 0 is informational.
    Ok { warnings: Vec<String> },
    /// `.error` carrying the error code and message, plus warnings.
    Error {
        code: i32,
        message: String,
        warnings: Vec<String>,
    },
}

/// Spool directories of one stanza.
#[derive(Debug, Clone)]
pub struct Spool {
    in_dir: Utf8PathBuf,
    out_dir: Utf8PathBuf,
}

impl Spool {
    pub fn new(spool_path: &Utf8Path, stanza: &str) -> Result<Spool> {
        let base = spool_path.join("archive").join(stanza);
        let spool = Spool {
            in_dir: base.join("in"),
            out_dir: base.join("out"),
        };
        for dir in [&spool.in_dir, &spool.out_dir] {
            crashsafe::create_dir_all(dir)
                .map_err(|e| Error::PathOpen(format!("unable to create spool '{dir}': {e}")))?;
        }
        Ok(spool)
    }

    pub fn in_dir(&self) -> &Utf8Path {
        &self.in_dir
    }

    pub fn out_dir(&self) -> &Utf8Path {
        &self.out_dir
    }

    /// Path of a staged inbound segment.
    pub fn staged(&self, name: &str) -> Utf8PathBuf {
        self.in_dir.join(name)
    }

    fn status_path(dir: &Utf8Path, name: &str, ext: &str) -> Utf8PathBuf {
        dir.join(format!("{name}.{ext}"))
    }

    /// Read the status of `name` in `dir`, `.error` winning over `.ok` so a
    /// failed retry after a stale success is not missed.
    pub fn status(&self, dir: &Utf8Path, name: &str) -> Result<Option<Status>> {
        let error_path = Self::status_path(dir, name, ERROR_EXT);
        if error_path.exists() {
            return Ok(Some(parse_status(&read(&error_path)?, true)?));
        }
        let ok_path = Self::status_path(dir, name, OK_EXT);
        if ok_path.exists() {
            return Ok(Some(parse_status(&read(&ok_path)?, false)?));
        }
        Ok(None)
    }

    /// Write a status file atomically, clearing the opposite outcome first so
    /// readers never see both.
    pub fn write_status(&self, dir: &Utf8Path, name: &str, status: &Status) -> Result<()> {
        let (ext, stale_ext) = match status {
            Status::Ok { .. } => (OK_EXT, ERROR_EXT),
            Status::Error { .. } => (ERROR_EXT, OK_EXT),
        };

        let stale = Self::status_path(dir, name, stale_ext);
        if stale.exists() {
            std::fs::remove_file(&stale)
                .map_err(|e| Error::FileRemove(format!("'{stale}': {e}")))?;
        }

        let path = Self::status_path(dir, name, ext);
        crashsafe::overwrite_file(&path, TMP_SUFFIX, render_status(status).as_bytes())
            .map_err(|e| Error::FileWrite(format!("'{path}': {e}")))
    }

    pub fn write_global_error(&self, code: i32, message: &str) -> Result<()> {
        let path = self.out_dir.join(GLOBAL_ERROR_FILE);
        let status = Status::Error {
            code,
            message: message.to_string(),
            warnings: Vec::new(),
        };
        crashsafe::overwrite_file(&path, TMP_SUFFIX, render_status(&status).as_bytes())
            .map_err(|e| Error::FileWrite(format!("'{path}': {e}")))
    }

    pub fn global_error(&self) -> Result<Option<Status>> {
        let path = self.out_dir.join(GLOBAL_ERROR_FILE);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(parse_status(&read(&path)?, true)?))
    }

    pub fn clear_global_error(&self) -> Result<()> {
        let path = self.out_dir.join(GLOBAL_ERROR_FILE);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::FileRemove(format!("'{path}': {e}"))),
        }
    }

    /// Remove a status pair, e.g. when the segment is consumed.
    pub fn clear_status(&self, dir: &Utf8Path, name: &str) -> Result<()> {
        for ext in [OK_EXT, ERROR_EXT] {
            let path = Self::status_path(dir, name, ext);
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::FileRemove(format!("'{path}': {e}"))),
            }
        }
        Ok(())
    }

    /// Sweep `*.pgvault.tmp` leftovers from a crashed prior attempt.
    pub fn sweep_temp(&self) -> Result<()> {
        for dir in [&self.in_dir, &self.out_dir] {
            let entries = std::fs::read_dir(dir)
                .map_err(|e| Error::PathOpen(format!("unable to read spool '{dir}': {e}")))?;
            for entry in entries.flatten() {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if name.ends_with(TMP_SUFFIX) {
                    let path = entry.path();
                    tracing::warn!("removing crashed temp file '{}'", path.display());
                    std::fs::remove_file(&path).map_err(|e| {
                        Error::FileRemove(format!("'{}': {e}", path.display()))
                    })?;
                }
            }
        }
        Ok(())
    }

    /// Names in `in/` that are staged segments (no status extension).
    pub fn staged_segments(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let entries = std::fs::read_dir(&self.in_dir)
            .map_err(|e| Error::PathOpen(format!("unable to read spool '{}': {e}", self.in_dir)))?;
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.ends_with(&format!(".{OK_EXT}"))
                && !name.ends_with(&format!(".{ERROR_EXT}"))
                && !name.ends_with(TMP_SUFFIX)
            {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }
}

fn read(path: &Utf8Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| Error::FileRead(format!("'{path}': {e}")))
}

fn render_status(status: &Status) -> String {
    match status {
        Status::Ok { warnings } if warnings.is_empty() => String::new(),
        Status::Ok { warnings } => {
            let mut out = String::from("0\n");
            for warning in warnings {
                out.push_str(warning);
                out.push('\n');
            }
            out.pop();
            out
        }
        Status::Error {
            code,
            message,
            warnings,
        } => {
            let mut out = format!("{code}\n{message}");
            for warning in warnings {
                out.push('\n');
                out.push_str(warning);
            }
            out
        }
    }
}

fn parse_status(contents: &str, is_error: bool) -> Result<Status> {
    if contents.is_empty() {
        if is_error {
            return Err(Error::Format("error status file is empty".into()));
        }
        return Ok(Status::Ok {
            warnings: Vec::new(),
        });
    }

    let mut lines = contents.lines();
    let code: i32 = lines
        .next()
        .expect("non-empty contents have a first line")
        .trim()
        .parse()
        .map_err(|_| Error::Format("status file code is not an integer".into()))?;

    if is_error {
        let message = lines
            .next()
            .ok_or_else(|| Error::Format("error status file has no message".into()))?
            .to_string();
        Ok(Status::Error {
            code,
            message,
            warnings: lines.map(str::to_string).collect(),
        })
    } else {
        Ok(Status::Ok {
            warnings: lines.map(str::to_string).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spool() -> (camino_tempfile::Utf8TempDir, Spool) {
        let dir = camino_tempfile::tempdir().unwrap();
        let spool = Spool::new(dir.path(), "main").unwrap();
        (dir, spool)
    }

    #[test]
    fn ok_status_roundtrip() {
        let (_dir, spool) = spool();
        let out = spool.out_dir().to_path_buf();

        spool
            .write_status(
                &out,
                "000000010000000100000001",
                &Status::Ok {
                    warnings: Vec::new(),
                },
            )
            .unwrap();
        assert_eq!(
            spool.status(&out, "000000010000000100000001").unwrap(),
            Some(Status::Ok {
                warnings: Vec::new()
            })
        );
        // an empty ok file carries no code line at all
        let raw =
            std::fs::read_to_string(out.join("000000010000000100000001.ok")).unwrap();
        assert_eq!(raw, "");
    }

    #[test]
    fn ok_with_warnings_keeps_the_grammar() {
        let (_dir, spool) = spool();
        let out = spool.out_dir().to_path_buf();

        let status = Status::Ok {
            warnings: vec!["dropped due to full queue".to_string()],
        };
        spool.write_status(&out, "seg", &status).unwrap();
        let raw = std::fs::read_to_string(out.join("seg.ok")).unwrap();
        assert_eq!(raw, "0\ndropped due to full queue");
        assert_eq!(spool.status(&out, "seg").unwrap(), Some(status));
    }

    #[test]
    fn error_status_roundtrip() {
        let (_dir, spool) = spool();
        let in_dir = spool.in_dir().to_path_buf();

        let status = Status::Error {
            code: 103,
            message: "repo1 unreachable".to_string(),
            warnings: vec!["repo2: checksum mismatch".to_string()],
        };
        spool.write_status(&in_dir, "seg", &status).unwrap();
        let raw = std::fs::read_to_string(in_dir.join("seg.error")).unwrap();
        assert_eq!(raw, "103\nrepo1 unreachable\nrepo2: checksum mismatch");
        assert_eq!(spool.status(&in_dir, "seg").unwrap(), Some(status));
    }

    #[test]
    fn opposite_status_is_cleared() {
        let (_dir, spool) = spool();
        let out = spool.out_dir().to_path_buf();

        spool
            .write_status(
                &out,
                "seg",
                &Status::Error {
                    code: 1,
                    message: "boom".into(),
                    warnings: Vec::new(),
                },
            )
            .unwrap();
        spool
            .write_status(
                &out,
                "seg",
                &Status::Ok {
                    warnings: Vec::new(),
                },
            )
            .unwrap();

        assert!(!out.join("seg.error").exists());
        assert!(matches!(
            spool.status(&out, "seg").unwrap(),
            Some(Status::Ok { .. })
        ));
    }

    #[test]
    fn temp_files_are_swept() {
        let (_dir, spool) = spool();
        let stale = spool.in_dir().join("seg.pgvault.tmp");
        std::fs::write(&stale, b"partial").unwrap();

        spool.sweep_temp().unwrap();
        assert!(!stale.exists());
    }

    #[test]
    fn staged_segments_exclude_status_files() {
        let (_dir, spool) = spool();
        std::fs::write(spool.staged("000000010000000100000002"), b"wal").unwrap();
        std::fs::write(spool.in_dir().join("000000010000000100000001.ok"), b"").unwrap();

        assert_eq!(
            spool.staged_segments().unwrap(),
            vec!["000000010000000100000002".to_string()]
        );
    }

    #[test]
    fn global_error_lifecycle() {
        let (_dir, spool) = spool();
        assert!(spool.global_error().unwrap().is_none());

        spool.write_global_error(102, "async worker terminated").unwrap();
        assert_eq!(
            spool.global_error().unwrap(),
            Some(Status::Error {
                code: 102,
                message: "async worker terminated".into(),
                warnings: Vec::new(),
            })
        );

        spool.clear_global_error().unwrap();
        assert!(spool.global_error().unwrap().is_none());
    }
}

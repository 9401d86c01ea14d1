//! SFTP repository backend over libssh2.
//!
//! The session is synchronous, so every operation hops to the blocking pool
//! and the session is shared behind a mutex. Semantics mirror the posix
//! backend: rename-atomic writes, stat-based info, readdir-based listing.

use std::io::{Read, Seek, SeekFrom, Write};
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use anyhow::Context;
use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use futures::StreamExt;
use ssh2::{OpenFlags, OpenType, Session, Sftp};

use crate::{
    Download, DownloadError, DownloadStream, InfoLevel, ListEntry, ObjectInfo, ObjectKind,
    ReadRange, RepoPath, SftpConfig, WriteOptions, TMP_SUFFIX,
};

pub struct SftpStorage {
    sftp: Arc<Mutex<Sftp>>,
    // Keeps the ssh transport alive for as long as the sftp channel is used.
    // libssh2 sessions are not safe for unsynchronized sharing, hence the
    // mutex even though nothing ever locks it after setup.
    _session: Mutex<Session>,
    base_path: Utf8PathBuf,
    location: String,
    timeout: Duration,
}

impl SftpStorage {
    pub async fn new(config: &SftpConfig, timeout: Duration) -> anyhow::Result<Self> {
        let config = config.clone();
        let location = format!("{}@{}:{}", config.user, config.host, config.base_path);

        // Session setup is all blocking libssh2 calls.
        let (session, sftp) = tokio::task::spawn_blocking(move || {
            let stream = TcpStream::connect((config.host.as_str(), config.port))
                .with_context(|| format!("connect to sftp host '{}'", config.host))?;
            stream.set_read_timeout(Some(timeout))?;
            stream.set_write_timeout(Some(timeout))?;

            let mut session = Session::new().context("create ssh session")?;
            session.set_tcp_stream(stream);
            session.handshake().context("ssh handshake")?;
            session
                .userauth_pubkey_file(
                    &config.user,
                    None,
                    config.key_file.as_std_path(),
                    None,
                )
                .with_context(|| format!("authenticate as '{}'", config.user))?;

            let sftp = session.sftp().context("open sftp channel")?;
            anyhow::Ok((session, sftp))
        })
        .await
        .context("sftp setup task")??;

        Ok(Self {
            sftp: Arc::new(Mutex::new(sftp)),
            _session: Mutex::new(session),
            base_path: config.base_path.clone(),
            location,
            timeout,
        })
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    fn resolve(&self, path: &RepoPath) -> PathBuf {
        path.with_base(&self.base_path).into_std_path_buf()
    }

    /// Run a blocking sftp closure on the blocking pool under the timeout.
    async fn blocking<R, F>(&self, op_name: &'static str, op: F) -> anyhow::Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&Sftp) -> anyhow::Result<R> + Send + 'static,
    {
        let sftp = Arc::clone(&self.sftp);
        let task = tokio::task::spawn_blocking(move || {
            let sftp = sftp.lock().expect("sftp mutex poisoned");
            op(&sftp)
        });
        tokio::time::timeout(self.timeout, task)
            .await
            .map_err(|_| anyhow::anyhow!("timed out in sftp {op_name}"))?
            .with_context(|| format!("sftp {op_name} task"))?
    }

    fn stat_to_info(stat: &ssh2::FileStat, level: InfoLevel) -> ObjectInfo {
        let kind = if stat.is_dir() {
            ObjectKind::Path
        } else if stat.file_type().is_symlink() {
            ObjectKind::Link
        } else if stat.is_file() {
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
                info.size = stat.size;
            }
            info.mtime = stat
                .mtime
                .map(|m| SystemTime::UNIX_EPOCH + Duration::from_secs(m));
        }
        if level >= InfoLevel::Detail {
            info.mode = stat.perm.map(|p| p & 0o7777);
            info.user = stat.uid.map(|uid| uid.to_string());
            info.group = stat.gid.map(|gid| gid.to_string());
        }
        info
    }

    pub async fn info(&self, path: &RepoPath, level: InfoLevel) -> anyhow::Result<ObjectInfo> {
        let target = self.resolve(path);
        self.blocking("stat", move |sftp| match sftp.lstat(&target) {
            Ok(stat) => Ok(Self::stat_to_info(&stat, level)),
            Err(e) if is_sftp_not_found(&e) => Ok(ObjectInfo::missing()),
            Err(e) => Err(anyhow::Error::new(e).context(format!("stat '{}'", target.display()))),
        })
        .await
    }

    pub async fn list(
        &self,
        prefix: Option<&RepoPath>,
        level: InfoLevel,
        recurse: bool,
    ) -> anyhow::Result<Vec<ListEntry>> {
        let base = match prefix {
            Some(prefix) => self.resolve(prefix),
            None => self.base_path.clone().into_std_path_buf(),
        };
        let root = self.base_path.clone();

        self.blocking("readdir", move |sftp| {
            let mut entries = Vec::new();
            let mut pending = vec![base];
            while let Some(dir) = pending.pop() {
                let listed = match sftp.readdir(&dir) {
                    Ok(listed) => listed,
                    Err(e) if is_sftp_not_found(&e) => continue,
                    Err(e) => {
                        return Err(anyhow::Error::new(e)
                            .context(format!("list directory '{}'", dir.display())))
                    }
                };
                for (entry_path, stat) in listed {
                    if stat.is_dir() && recurse {
                        pending.push(entry_path.clone());
                    }
                    let utf8 = Utf8PathBuf::from_path_buf(entry_path)
                        .map_err(|p| anyhow::anyhow!("non-utf8 sftp path: {p:?}"))?;
                    let relative = utf8
                        .strip_prefix(&root)
                        .expect("listed path is always under the base");
                    entries.push(ListEntry {
                        path: RepoPath::new(relative)?,
                        info: Self::stat_to_info(&stat, level),
                    });
                }
            }
            Ok(entries)
        })
        .await
    }

    pub async fn read(
        &self,
        path: &RepoPath,
        range: Option<ReadRange>,
    ) -> Result<Download, DownloadError> {
        let target = self.resolve(path);
        let result = self
            .blocking("read", move |sftp| {
                let mut file = match sftp.open(&target) {
                    Ok(file) => file,
                    Err(e) if is_sftp_not_found(&e) => return Ok(None),
                    Err(e) => {
                        return Err(anyhow::Error::new(e)
                            .context(format!("open '{}'", target.display())))
                    }
                };

                let (offset, limit) = range.unwrap_or((0, None));
                if offset > 0 {
                    file.seek(SeekFrom::Start(offset))
                        .context("seek sftp file")?;
                }

                let mut data = Vec::new();
                match limit {
                    Some(limit) => {
                        let mut taken = file.take(limit);
                        taken.read_to_end(&mut data).context("read sftp file")?;
                    }
                    None => {
                        file.read_to_end(&mut data).context("read sftp file")?;
                    }
                }
                Ok(Some(data))
            })
            .await;

        match result {
            Ok(Some(data)) => {
                let size = data.len() as u64;
                Ok(Download {
                    stream: crate::stream_from_bytes(Bytes::from(data)),
                    size: Some(size),
                })
            }
            Ok(None) => Err(DownloadError::NotFound),
            Err(e) => Err(DownloadError::Other(e)),
        }
    }

    pub async fn write(
        &self,
        path: &RepoPath,
        mut data: DownloadStream,
        opts: &WriteOptions,
    ) -> anyhow::Result<()> {
        let mut body = Vec::new();
        while let Some(chunk) = data.next().await {
            body.extend_from_slice(&chunk.context("read upload stream")?);
        }

        let target = self.resolve(path);
        let create_path = opts.create_path;
        let mode_file = opts.mode_file.unwrap_or(0o640) as i32;
        let mode_path = opts.mode_path.unwrap_or(0o750) as i32;
        let base = self.base_path.clone().into_std_path_buf();

        self.blocking("write", move |sftp| {
            let parent = target
                .parent()
                .ok_or_else(|| anyhow::anyhow!("object path has no parent"))?;

            if create_path && sftp.lstat(parent).is_err() {
                // create the chain of missing parents from the base down
                let mut current = base.clone();
                for component in parent.strip_prefix(&base).unwrap().components() {
                    current.push(component);
                    if sftp.lstat(&current).is_err() {
                        sftp.mkdir(&current, mode_path).with_context(|| {
                            format!("create directory '{}'", current.display())
                        })?;
                    }
                }
            }

            let temp = target.with_extension(format!(
                "{}{}{TMP_SUFFIX}",
                target.extension().map(|e| e.to_string_lossy()).unwrap_or_default(),
                if target.extension().is_some() { "." } else { "" },
            ));
            let mut file = sftp
                .open_mode(
                    &temp,
                    OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
                    mode_file,
                    OpenType::File,
                )
                .with_context(|| format!("create '{}'", temp.display()))?;
            file.write_all(&body)
                .with_context(|| format!("write '{}'", temp.display()))?;
            drop(file);

            // overwrite-on-rename needs the flag set, plain rename refuses
            sftp.rename(&temp, &target, Some(ssh2::RenameFlags::OVERWRITE))
                .with_context(|| {
                    format!("rename '{}' to '{}'", temp.display(), target.display())
                })?;
            Ok(())
        })
        .await
    }

    pub async fn remove(&self, path: &RepoPath) -> anyhow::Result<()> {
        let target = self.resolve(path);
        self.blocking("unlink", move |sftp| {
            sftp.unlink(&target)
                .map_err(|e| {
                    if is_sftp_not_found(&e) {
                        anyhow::Error::new(std::io::Error::new(
                            std::io::ErrorKind::NotFound,
                            e.to_string(),
                        ))
                    } else {
                        anyhow::Error::new(e)
                    }
                })
                .with_context(|| format!("remove '{}'", target.display()))
        })
        .await
    }

    pub async fn remove_prefix(&self, prefix: &RepoPath) -> anyhow::Result<()> {
        let entries = self.list(Some(prefix), InfoLevel::Exists, true).await?;
        let base = self.base_path.clone();
        let root = self.resolve(prefix);

        // remove files first, then directories bottom-up
        let mut dirs: Vec<PathBuf> = vec![root.clone()];
        for entry in &entries {
            let absolute = entry.path.with_base(Utf8Path::new(base.as_str()));
            if entry.info.kind == ObjectKind::Path {
                dirs.push(absolute.into_std_path_buf());
            } else {
                self.remove(&entry.path).await?;
            }
        }
        dirs.sort_by_key(|d| std::cmp::Reverse(d.components().count()));

        self.blocking("rmdir", move |sftp| {
            for dir in dirs {
                match sftp.rmdir(&dir) {
                    Ok(()) => {}
                    Err(e) if is_sftp_not_found(&e) => {}
                    Err(e) => {
                        return Err(anyhow::Error::new(e)
                            .context(format!("remove directory '{}'", dir.display())))
                    }
                }
            }
            Ok(())
        })
        .await
    }
}

/// libssh2 signals a missing file with `SFTP_NO_SUCH_FILE` (error code 2).
fn is_sftp_not_found(e: &ssh2::Error) -> bool {
    e.code() == ssh2::ErrorCode::SFTP(2)
}

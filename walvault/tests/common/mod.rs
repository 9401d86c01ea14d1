//! Shared fixtures: a throwaway stanza over posix repositories and a
//! scripted database standing in for a live cluster.

#![allow(dead_code)] // each test binary uses a subset of the fixture

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use pg_wal::{PgVersion, WalSegment, WalSegmentHeader, WAL_SEGMENT_SIZE_MIN};
use sha1::{Digest, Sha1};
use utils::lsn::Lsn;
use walvault::config::{Config, RepoConfig};
use walvault::db::{DbClient, StopBackupResult};
use walvault::errors::Result;
use walvault::info::{save, ArchiveInfo, BackupInfo};
use walvault::Context;

pub const PG_VERSION: PgVersion = PgVersion(160000);
pub const SYSTEM_ID: u64 = 0x1122_3344_5566_7788;
pub const SEG_SIZE: usize = WAL_SEGMENT_SIZE_MIN;

pub struct Fixture {
    pub dir: camino_tempfile::Utf8TempDir,
    pub ctx: Arc<Context>,
}

impl Fixture {
    /// A stanza `main` with `repo_count` posix repositories, a pg data
    /// directory, and seeded info files.
    pub async fn new(repo_count: usize) -> Fixture {
        let dir = camino_tempfile::tempdir().unwrap();

        let pg_path = dir.path().join("pg");
        std::fs::create_dir_all(pg_path.join("pg_wal/archive_status")).unwrap();
        std::fs::create_dir_all(pg_path.join("base/1")).unwrap();
        std::fs::create_dir_all(pg_path.join("global")).unwrap();

        let repos = (1..=repo_count)
            .map(|i| RepoConfig::posix(i, dir.path().join(format!("repo{i}"))))
            .collect();

        let config = Config {
            stanza: "main".to_string(),
            pg_path,
            pg_port: 5432,
            pg_host: None,
            pg_user: None,
            pg_database: "postgres".to_string(),
            repos,
            spool_path: dir.path().join("spool"),
            lock_path: dir.path().join("lock"),
            process_max: 2,
            archive_timeout: Duration::from_secs(5),
            db_timeout: Duration::from_secs(30),
            protocol_timeout: Duration::from_secs(30),
            io_timeout: Duration::from_secs(30),
            job_retry: 1,
            job_retry_interval: Duration::from_millis(10),
            archive_async: false,
            archive_header_check: true,
            archive_push_queue_max: None,
            archive_get_queue_max: 4 * SEG_SIZE as u64,
            start_fast: true,
            backup_standby: false,
            block_incr: false,
            exec_id: "test-exec".to_string(),
        };

        let ctx = Context::new(config).await.unwrap();
        for (_, storage) in ctx.repos() {
            save(
                storage,
                &walvault::archive::archive_info_path("main"),
                &ArchiveInfo::new(PG_VERSION, SYSTEM_ID, SEG_SIZE),
                &ctx.cancel,
            )
            .await
            .unwrap();
            save(
                storage,
                &walvault::archive::backup_info_path("main"),
                &BackupInfo::new(PG_VERSION, SYSTEM_ID, false),
                &ctx.cancel,
            )
            .await
            .unwrap();
        }

        Fixture { dir, ctx }
    }

    pub fn pg_path(&self) -> Utf8PathBuf {
        self.ctx.config.pg_path.clone()
    }

    pub fn wal_dir(&self) -> Utf8PathBuf {
        self.pg_path().join("pg_wal")
    }

    /// Write a well-formed WAL segment into pg_wal, with a `.ready` marker.
    pub fn craft_segment(&self, name: &str, fill: u8) -> Vec<u8> {
        let bytes = craft_segment_bytes(name, fill);
        let path = self.wal_dir().join(name);
        std::fs::write(&path, &bytes).unwrap();
        std::fs::write(
            self.wal_dir().join(format!("archive_status/{name}.ready")),
            b"",
        )
        .unwrap();
        bytes
    }

    /// Place a segment object directly in a repository's archive, the way a
    /// prior push would have.
    pub async fn seed_archived_segment(&self, repo_index: usize, name: &str, bytes: &[u8]) {
        let (_, storage) = self.ctx.repo(repo_index);
        let segment: WalSegment = name.parse().unwrap();
        let path = walvault::archive::wal_segment_path(
            "main",
            "16-1",
            &segment,
            &sha1_hex(bytes),
            None,
        );
        storage
            .write_bytes(&path, bytes::Bytes::copy_from_slice(bytes), &self.ctx.cancel)
            .await
            .unwrap();
    }
}

pub fn craft_segment_bytes(name: &str, fill: u8) -> Vec<u8> {
    let segment: WalSegment = name.parse().unwrap();
    let header = WalSegmentHeader {
        magic: PG_VERSION.wal_page_magic(),
        timeline: segment.timeline,
        system_id: SYSTEM_ID,
        seg_size: SEG_SIZE as u32,
    };
    let mut bytes = header.to_bytes();
    bytes.resize(SEG_SIZE, fill);
    bytes
}

pub fn sha1_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// A scripted cluster: fixed identity, scripted WAL positions, and files on
/// disk under the fixture's pg path.
pub struct ScriptedDb {
    pub wal_start: String,
    pub wal_stop: String,
    pub start_lsn: Lsn,
    pub stop_lsn: Lsn,
}

impl ScriptedDb {
    pub fn new(wal_start: &str, wal_stop: &str) -> ScriptedDb {
        ScriptedDb {
            wal_start: wal_start.to_string(),
            wal_stop: wal_stop.to_string(),
            start_lsn: Lsn(0x0100_0000),
            stop_lsn: Lsn(0x0200_0000),
        }
    }
}

#[async_trait]
impl DbClient for ScriptedDb {
    async fn version(&self) -> Result<PgVersion> {
        Ok(PG_VERSION)
    }

    async fn system_id(&self) -> Result<u64> {
        Ok(SYSTEM_ID)
    }

    async fn is_in_recovery(&self) -> Result<bool> {
        Ok(false)
    }

    async fn wal_segment_size(&self) -> Result<usize> {
        Ok(SEG_SIZE)
    }

    async fn checkpoint_timeout(&self) -> Result<Duration> {
        Ok(Duration::from_secs(300))
    }

    async fn start_backup(&self, _label: &str, _start_fast: bool) -> Result<(Lsn, String)> {
        Ok((self.start_lsn, self.wal_start.clone()))
    }

    async fn stop_backup(&self) -> Result<StopBackupResult> {
        Ok(StopBackupResult {
            lsn: self.stop_lsn,
            wal_file: self.wal_stop.clone(),
            backup_label: Some("START WAL LOCATION: scripted".to_string()),
            tablespace_map: None,
        })
    }

    async fn switch_wal(&self) -> Result<String> {
        Ok(self.wal_stop.clone())
    }

    async fn last_archived_wal(&self) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Write a cluster file under the fixture's data directory.
pub fn write_cluster_file(pg_path: &Utf8Path, relative: &str, contents: &[u8]) {
    let path = pg_path.join(relative);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, contents).unwrap();
}

//! Option resolution: CLI > environment > config file > default.
//!
//! The CLI arguments are declared with clap (env fallback included via
//! `PGVAULT_*`); the optional TOML config file contributes `[global]` and
//! `[stanza.<name>]` tables, with the stanza table winning over global.

use std::num::NonZeroU32;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use clap::Args;
use repo_storage::bundle::BundleLimits;
use repo_storage::filter::{CipherKey, CipherType, CompressType};
use repo_storage::{
    AzureConfig, GcsConfig, RepoStorageConfig, RepoStorageKind, S3Config, SftpConfig,
};
use serde::Deserialize;

use crate::errors::{Error, Result};

pub mod defaults {
    use std::time::Duration;

    pub const DEFAULT_PROCESS_MAX: usize = 1;
    pub const DEFAULT_ARCHIVE_TIMEOUT: Duration = Duration::from_secs(60);
    pub const DEFAULT_DB_TIMEOUT: Duration = Duration::from_secs(1800);
    pub const DEFAULT_PROTOCOL_TIMEOUT: Duration = Duration::from_secs(1830);
    pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(60);
    pub const DEFAULT_JOB_RETRY: u32 = 1;
    pub const DEFAULT_JOB_RETRY_INTERVAL: Duration = Duration::from_secs(15);
    pub const DEFAULT_COMPRESS_LEVEL: i32 = 6;
    pub const DEFAULT_PG_PORT: u16 = 5432;
    pub const DEFAULT_PG_DATABASE: &str = "postgres";
    pub const DEFAULT_SPOOL_PATH: &str = "/var/spool/walvault";
    pub const DEFAULT_LOCK_PATH: &str = "/tmp/walvault";
}

/// Options shared by every command, resolved against file + defaults into
/// [`Config`].
#[derive(Debug, Clone, Args)]
pub struct GlobalOpts {
    /// Stanza to operate on.
    #[arg(long, env = "PGVAULT_STANZA", global = true)]
    pub stanza: Option<String>,

    /// Path to the TOML configuration file.
    #[arg(long, env = "PGVAULT_CONFIG", global = true)]
    pub config: Option<Utf8PathBuf>,

    /// PostgreSQL data directory.
    #[arg(long, env = "PGVAULT_PG_PATH", global = true)]
    pub pg_path: Option<Utf8PathBuf>,

    #[arg(long, env = "PGVAULT_PG_PORT", global = true)]
    pub pg_port: Option<u16>,

    #[arg(long, env = "PGVAULT_PG_HOST", global = true)]
    pub pg_host: Option<String>,

    #[arg(long, env = "PGVAULT_PG_USER", global = true)]
    pub pg_user: Option<String>,

    /// Max worker processes for parallel transfer.
    #[arg(long, env = "PGVAULT_PROCESS_MAX", global = true)]
    pub process_max: Option<usize>,

    /// Spool directory for asynchronous archiving.
    #[arg(long, env = "PGVAULT_SPOOL_PATH", global = true)]
    pub spool_path: Option<Utf8PathBuf>,

    /// Directory holding command locks.
    #[arg(long, env = "PGVAULT_LOCK_PATH", global = true)]
    pub lock_path: Option<Utf8PathBuf>,

    /// Seconds to wait for asynchronous archive operations.
    #[arg(long, env = "PGVAULT_ARCHIVE_TIMEOUT", global = true)]
    pub archive_timeout: Option<u64>,

    /// Log format, plain or json.
    #[arg(long, env = "PGVAULT_LOG_FORMAT", global = true)]
    pub log_format: Option<utils::logging::LogFormat>,
}

/// `[global]` / `[stanza.<name>]` table contents in the config file. Every
/// field is optional so the tables can be sparse.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct FileSection {
    pg_path: Option<Utf8PathBuf>,
    pg_port: Option<u16>,
    pg_host: Option<String>,
    pg_user: Option<String>,
    pg_database: Option<String>,
    process_max: Option<usize>,
    spool_path: Option<Utf8PathBuf>,
    lock_path: Option<Utf8PathBuf>,
    archive_timeout_secs: Option<u64>,
    db_timeout_secs: Option<u64>,
    protocol_timeout_secs: Option<u64>,
    io_timeout_secs: Option<u64>,
    job_retry: Option<u32>,
    job_retry_interval_secs: Option<u64>,
    archive_async: Option<bool>,
    archive_header_check: Option<bool>,
    archive_push_queue_max: Option<u64>,
    archive_get_queue_max: Option<u64>,
    start_fast: Option<bool>,
    backup_standby: Option<bool>,
    block_incr: Option<bool>,
    #[serde(default)]
    repo: Vec<FileRepo>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct FileRepo {
    #[serde(flatten)]
    storage: FileRepoStorage,
    compress_type: Option<String>,
    compress_level: Option<i32>,
    cipher_type: Option<String>,
    cipher_key: Option<String>,
    bundle: Option<bool>,
    bundle_size: Option<u64>,
    bundle_limit: Option<u64>,
    retention_full: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "kebab-case")]
enum FileRepoStorage {
    Posix {
        path: Utf8PathBuf,
    },
    S3 {
        bucket: String,
        region: String,
        endpoint: Option<String>,
        prefix: Option<String>,
    },
    Azure {
        account: String,
        container: String,
        prefix: Option<String>,
    },
    Gcs {
        bucket: String,
        prefix: Option<String>,
    },
    Sftp {
        host: String,
        port: Option<u16>,
        user: String,
        path: Utf8PathBuf,
        key_file: Utf8PathBuf,
    },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    #[serde(default)]
    global: FileSection,
    #[serde(default)]
    stanza: std::collections::HashMap<String, FileSection>,
}

/// Fully resolved per-repository options.
#[derive(Debug, Clone)]
pub struct RepoConfig {
    /// 1-based repository index; order is failover order.
    pub index: usize,
    pub storage: RepoStorageConfig,
    pub compress_type: CompressType,
    pub compress_level: i32,
    pub cipher_type: CipherType,
    pub cipher_key: Option<CipherKey>,
    pub bundle: Option<BundleLimits>,
    pub retention_full: Option<u32>,
}

impl RepoConfig {
    pub fn posix(index: usize, path: Utf8PathBuf) -> Self {
        RepoConfig {
            index,
            storage: RepoStorageConfig {
                storage: RepoStorageKind::Posix { path },
                timeout: repo_storage::DEFAULT_TIMEOUT,
            },
            compress_type: CompressType::None,
            compress_level: defaults::DEFAULT_COMPRESS_LEVEL,
            cipher_type: CipherType::None,
            cipher_key: None,
            bundle: None,
            retention_full: None,
        }
    }
}

/// The resolved configuration every command runs with.
#[derive(Debug, Clone)]
pub struct Config {
    pub stanza: String,
    pub pg_path: Utf8PathBuf,
    pub pg_port: u16,
    pub pg_host: Option<String>,
    pub pg_user: Option<String>,
    pub pg_database: String,
    pub repos: Vec<RepoConfig>,
    pub spool_path: Utf8PathBuf,
    pub lock_path: Utf8PathBuf,
    pub process_max: usize,
    pub archive_timeout: Duration,
    pub db_timeout: Duration,
    pub protocol_timeout: Duration,
    pub io_timeout: Duration,
    pub job_retry: u32,
    pub job_retry_interval: Duration,
    pub archive_async: bool,
    pub archive_header_check: bool,
    /// Ready bytes beyond which async push drops segments. `None` disables
    /// the drop policy; zero means always drop.
    pub archive_push_queue_max: Option<u64>,
    /// Prefetch budget in bytes for async get; zero disables prefetch.
    pub archive_get_queue_max: u64,
    pub start_fast: bool,
    pub backup_standby: bool,
    /// Store changed files as per-block deltas against the prior backup.
    pub block_incr: bool,
    /// Identifies this invocation across its subprocesses for lock
    /// re-entrance.
    pub exec_id: String,
}

impl Config {
    /// Resolve CLI + env options against the config file and defaults.
    pub fn resolve(opts: &GlobalOpts) -> Result<Config> {
        let stanza = opts
            .stanza
            .clone()
            .ok_or_else(|| Error::OptionRequired("stanza".into()))?;

        let file = match &opts.config {
            Some(path) => load_config_file(path)?,
            None => ConfigFile::default(),
        };
        let global = &file.global;
        let section = file.stanza.get(&stanza).cloned().unwrap_or_default();

        // stanza section wins over global; CLI/env wins over both
        macro_rules! pick {
            ($cli:expr, $field:ident) => {
                $cli.clone()
                    .or_else(|| section.$field.clone())
                    .or_else(|| global.$field.clone())
            };
        }

        let pg_path = pick!(opts.pg_path, pg_path)
            .ok_or_else(|| Error::OptionRequired("pg-path".into()))?;

        let archive_timeout = Duration::from_secs(
            opts.archive_timeout
                .or(section.archive_timeout_secs)
                .or(global.archive_timeout_secs)
                .unwrap_or(defaults::DEFAULT_ARCHIVE_TIMEOUT.as_secs()),
        );
        if archive_timeout.is_zero() {
            return Err(Error::ParamInvalid(
                "archive-timeout must be greater than zero".into(),
            ));
        }

        let mut repos = Vec::new();
        let file_repos = if section.repo.is_empty() {
            &global.repo
        } else {
            &section.repo
        };
        for (i, repo) in file_repos.iter().enumerate() {
            repos.push(resolve_repo(i + 1, repo)?);
        }

        Ok(Config {
            stanza,
            pg_path,
            pg_port: opts
                .pg_port
                .or(section.pg_port)
                .or(global.pg_port)
                .unwrap_or(defaults::DEFAULT_PG_PORT),
            pg_host: pick!(opts.pg_host, pg_host),
            pg_user: pick!(opts.pg_user, pg_user),
            pg_database: section
                .pg_database
                .clone()
                .or_else(|| global.pg_database.clone())
                .unwrap_or_else(|| defaults::DEFAULT_PG_DATABASE.to_string()),
            repos,
            spool_path: pick!(opts.spool_path, spool_path)
                .unwrap_or_else(|| Utf8PathBuf::from(defaults::DEFAULT_SPOOL_PATH)),
            lock_path: pick!(opts.lock_path, lock_path)
                .unwrap_or_else(|| Utf8PathBuf::from(defaults::DEFAULT_LOCK_PATH)),
            process_max: opts
                .process_max
                .or(section.process_max)
                .or(global.process_max)
                .unwrap_or(defaults::DEFAULT_PROCESS_MAX)
                .max(1),
            archive_timeout,
            db_timeout: Duration::from_secs(
                section
                    .db_timeout_secs
                    .or(global.db_timeout_secs)
                    .unwrap_or(defaults::DEFAULT_DB_TIMEOUT.as_secs()),
            ),
            protocol_timeout: Duration::from_secs(
                section
                    .protocol_timeout_secs
                    .or(global.protocol_timeout_secs)
                    .unwrap_or(defaults::DEFAULT_PROTOCOL_TIMEOUT.as_secs()),
            ),
            io_timeout: Duration::from_secs(
                section
                    .io_timeout_secs
                    .or(global.io_timeout_secs)
                    .unwrap_or(defaults::DEFAULT_IO_TIMEOUT.as_secs()),
            ),
            job_retry: section
                .job_retry
                .or(global.job_retry)
                .unwrap_or(defaults::DEFAULT_JOB_RETRY),
            job_retry_interval: Duration::from_secs(
                section
                    .job_retry_interval_secs
                    .or(global.job_retry_interval_secs)
                    .unwrap_or(defaults::DEFAULT_JOB_RETRY_INTERVAL.as_secs()),
            ),
            archive_async: section
                .archive_async
                .or(global.archive_async)
                .unwrap_or(false),
            archive_header_check: section
                .archive_header_check
                .or(global.archive_header_check)
                .unwrap_or(true),
            archive_push_queue_max: section
                .archive_push_queue_max
                .or(global.archive_push_queue_max),
            archive_get_queue_max: section
                .archive_get_queue_max
                .or(global.archive_get_queue_max)
                .unwrap_or(128 * 1024 * 1024),
            start_fast: section.start_fast.or(global.start_fast).unwrap_or(false),
            backup_standby: section
                .backup_standby
                .or(global.backup_standby)
                .unwrap_or(false),
            block_incr: section.block_incr.or(global.block_incr).unwrap_or(false),
            exec_id: uuid::Uuid::new_v4().to_string(),
        })
    }

    /// At least one repository must be configured for anything that touches
    /// the archive.
    pub fn require_repos(&self) -> Result<&[RepoConfig]> {
        if self.repos.is_empty() {
            return Err(Error::OptionRequired("repo1-path".into()));
        }
        Ok(&self.repos)
    }

    pub fn wal_dir(&self, version: pg_wal::PgVersion) -> Utf8PathBuf {
        self.pg_path.join(version.wal_dir())
    }
}

fn load_config_file(path: &Utf8Path) -> Result<ConfigFile> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| Error::FileOpen(format!("config file '{path}': {e}")))?;
    toml_edit::de::from_str(&contents)
        .map_err(|e| Error::Format(format!("config file '{path}': {e}")))
}

fn resolve_repo(index: usize, repo: &FileRepo) -> Result<RepoConfig> {
    let storage_kind = match &repo.storage {
        FileRepoStorage::Posix { path } => RepoStorageKind::Posix { path: path.clone() },
        FileRepoStorage::S3 {
            bucket,
            region,
            endpoint,
            prefix,
        } => RepoStorageKind::S3(S3Config {
            bucket_name: bucket.clone(),
            bucket_region: region.clone(),
            prefix_in_bucket: prefix.clone(),
            endpoint: endpoint.clone(),
            concurrency_limit: NonZeroU32::new(100).unwrap(),
            max_keys_per_list_response: repo_storage::DEFAULT_MAX_KEYS_PER_LIST_RESPONSE,
            upload_storage_class: None,
        }),
        FileRepoStorage::Azure {
            account,
            container,
            prefix,
        } => RepoStorageKind::Azure(AzureConfig {
            account: account.clone(),
            container: container.clone(),
            prefix_in_container: prefix.clone(),
            concurrency_limit: NonZeroU32::new(100).unwrap(),
            max_keys_per_list_response: repo_storage::DEFAULT_MAX_KEYS_PER_LIST_RESPONSE,
        }),
        FileRepoStorage::Gcs { bucket, prefix } => RepoStorageKind::Gcs(GcsConfig {
            bucket_name: bucket.clone(),
            prefix_in_bucket: prefix.clone(),
            concurrency_limit: NonZeroU32::new(100).unwrap(),
        }),
        FileRepoStorage::Sftp {
            host,
            port,
            user,
            path,
            key_file,
        } => RepoStorageKind::Sftp(SftpConfig {
            host: host.clone(),
            port: port.unwrap_or(22),
            user: user.clone(),
            base_path: path.clone(),
            key_file: key_file.clone(),
            known_hosts_check: true,
        }),
    };

    let compress_type = match &repo.compress_type {
        Some(s) => s
            .parse::<CompressType>()
            .map_err(|e| Error::ParamInvalid(format!("repo{index}-compress-type: {e}")))?,
        None => CompressType::None,
    };

    let cipher_type = match &repo.cipher_type {
        Some(s) => s
            .parse::<CipherType>()
            .map_err(|e| Error::ParamInvalid(format!("repo{index}-cipher-type: {e}")))?,
        None => CipherType::None,
    };
    let cipher_key = match (cipher_type, &repo.cipher_key) {
        (CipherType::None, _) => None,
        (CipherType::Aes256Gcm, Some(key)) => Some(
            CipherKey::from_hex(key)
                .map_err(|e| Error::ParamInvalid(format!("repo{index}-cipher-key: {e}")))?,
        ),
        (CipherType::Aes256Gcm, None) => {
            return Err(Error::OptionRequired(format!("repo{index}-cipher-key")))
        }
    };

    let bundle = repo.bundle.unwrap_or(false).then(|| {
        let defaults = BundleLimits::default();
        BundleLimits {
            bundle_size: repo.bundle_size.unwrap_or(defaults.bundle_size),
            bundle_limit: repo.bundle_limit.unwrap_or(defaults.bundle_limit),
        }
    });

    Ok(RepoConfig {
        index,
        storage: RepoStorageConfig {
            storage: storage_kind,
            timeout: repo
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(repo_storage::DEFAULT_TIMEOUT),
        },
        compress_type,
        compress_level: repo
            .compress_level
            .unwrap_or(defaults::DEFAULT_COMPRESS_LEVEL),
        cipher_type,
        cipher_key,
        bundle,
        retention_full: repo.retention_full,
    })
}

//! The recovery resolver: from a requested target to a concrete
//! (repository, backup set, WAL range).
//!
//! The resolver never interprets WAL contents; it reasons over backup
//! registry entries and archived segment names only. Replay to the exact
//! target is the database's job.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use pg_wal::WalSegment;
use utils::lsn::Lsn;

use crate::archive::{backup_info_path, wal_segment_find};
use crate::backup::label::BackupLabel;
use crate::errors::{Error, Result};
use crate::info::{load, BackupEntry, BackupInfo};
use crate::Context;

/// What the operator asked to recover to.
#[derive(Debug, Clone, PartialEq)]
pub enum TargetType {
    /// Stop as soon as consistency is reached.
    Immediate,
    /// Stop at a commit time.
    Time(DateTime<Utc>),
    /// Stop at a transaction id.
    Xid(String),
    /// Stop at an LSN.
    Lsn(Lsn),
    /// Stop at a named restore point.
    Name(String),
    /// Recover to the end of the archive.
    Default,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryTarget {
    pub target: TargetType,
    pub inclusive: bool,
    /// Timeline to follow; `None` means the database default (latest from
    /// 12 on, current before).
    pub timeline: Option<String>,
}

impl Default for RecoveryTarget {
    fn default() -> Self {
        RecoveryTarget {
            target: TargetType::Default,
            inclusive: true,
            timeline: None,
        }
    }
}

/// The resolver's answer.
#[derive(Debug, Clone)]
pub struct ResolvedTarget {
    /// Repository to restore from.
    pub repo_index: usize,
    pub entry: BackupEntry,
    /// First segment the database will request.
    pub wal_start: String,
    /// Last segment known to be needed; replay may continue past it for
    /// time/xid/name targets.
    pub wal_stop: String,
}

/// Pick the backup and repository for a target, preferring earlier-indexed
/// repositories when several qualify.
pub async fn resolve(
    ctx: &Context,
    target: &RecoveryTarget,
    requested: Option<&BackupLabel>,
) -> Result<ResolvedTarget> {
    ctx.config.require_repos()?;

    // Gather candidates from every repository; the same label must agree
    // across repositories or the registry is inconsistent.
    let mut candidates: BTreeMap<BackupLabel, (BackupEntry, Vec<usize>)> = BTreeMap::new();
    for (repo, storage) in ctx.repos() {
        let Some(info) =
            load::<BackupInfo>(storage, &backup_info_path(&ctx.config.stanza), &ctx.cancel).await?
        else {
            continue;
        };
        for entry in info.backups {
            match candidates.get_mut(&entry.label) {
                Some((existing, repos)) => {
                    if existing.manifest_checksum != entry.manifest_checksum {
                        return Err(Error::RepoInvalid(format!(
                            "backup '{}' differs between repo{} and repo{} \
                             (manifest checksum mismatch)",
                            entry.label,
                            repos.first().copied().unwrap_or(0),
                            repo.index
                        )));
                    }
                    repos.push(repo.index);
                }
                None => {
                    candidates.insert(entry.label.clone(), (entry, vec![repo.index]));
                }
            }
        }
    }
    if candidates.is_empty() {
        return Err(Error::FileMissing(format!(
            "no backup exists for stanza '{}'",
            ctx.config.stanza
        )));
    }

    // Filter by the target; candidates iterate in label (chronological)
    // order, so the last acceptable one is the newest.
    let chosen: Option<&(BackupEntry, Vec<usize>)> = if let Some(label) = requested {
        candidates.get(label).map(|c| {
            // explicit set requests bypass target filtering
            c
        })
    } else {
        match &target.target {
            TargetType::Time(time) => candidates
                .values()
                .filter(|(entry, _)| &entry.timestamp_stop <= time)
                .next_back(),
            // Immediate, xid, name, lsn, default: the newest backup serves;
            // replay stops at the target during recovery.
            _ => candidates.values().next_back(),
        }
    };
    let Some((entry, repos)) = chosen else {
        return Err(Error::FileMissing(match (&target.target, requested) {
            (_, Some(label)) => format!("backup set '{label}' does not exist"),
            (TargetType::Time(time), _) => {
                format!("no backup completed before the requested time {time}")
            }
            _ => "no backup satisfies the recovery target".to_string(),
        }));
    };

    // Of the repositories holding this backup, pick the first whose archive
    // actually covers the needed WAL range.
    let mut unavailable = Vec::new();
    for &repo_index in repos {
        match wal_range_complete(ctx, repo_index, entry).await {
            Ok(true) => {
                return Ok(ResolvedTarget {
                    repo_index,
                    entry: entry.clone(),
                    wal_start: entry.wal_start.clone(),
                    wal_stop: entry.wal_stop.clone(),
                });
            }
            Ok(false) => unavailable.push(format!("repo{repo_index}: WAL range incomplete")),
            Err(e) => unavailable.push(format!("repo{repo_index}: {e}")),
        }
    }

    Err(Error::FileMissing(format!(
        "backup '{}' exists but no repository has its full WAL range\n{}",
        entry.label,
        unavailable.join("\n")
    )))
}

/// Whether `repo_index` holds every segment from the backup's start to stop.
async fn wal_range_complete(ctx: &Context, repo_index: usize, entry: &BackupEntry) -> Result<bool> {
    let (_, storage) = ctx.repo(repo_index);

    let start: WalSegment = entry
        .wal_start
        .parse()
        .map_err(|e| Error::Format(format!("{e:#}")))?;
    let stop: WalSegment = entry
        .wal_stop
        .parse()
        .map_err(|e| Error::Format(format!("{e:#}")))?;

    let archive: crate::info::ArchiveInfo = load(
        storage,
        &crate::archive::archive_info_path(&ctx.config.stanza),
        &ctx.cancel,
    )
    .await?
    .ok_or_else(|| Error::RepoInvalid(format!("repo{repo_index}: archive.info is missing")))?;
    let seg_size = archive.current()?.wal_segment_size;
    let version = archive.current()?.version;

    let mut current = start;
    loop {
        if wal_segment_find(
            storage,
            &ctx.config.stanza,
            &entry.archive_id,
            &current,
            &ctx.cancel,
        )
        .await?
        .is_none()
        {
            return Ok(false);
        }
        if current >= stop {
            return Ok(true);
        }
        current = current.next(seg_size, version);
    }
}

/// Parse a `--target` value for the given `--type`.
pub fn parse_target(
    target_type: &str,
    value: Option<&str>,
    inclusive: bool,
    timeline: Option<String>,
) -> Result<RecoveryTarget> {
    let target = match target_type {
        "default" => TargetType::Default,
        "immediate" => TargetType::Immediate,
        "time" => {
            let value = value.ok_or_else(|| Error::OptionRequired("target".into()))?;
            let time = DateTime::parse_from_rfc3339(value)
                .map(|t| t.with_timezone(&Utc))
                .or_else(|_| {
                    chrono::NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S")
                        .map(|t| t.and_utc())
                })
                .map_err(|e| Error::ParamInvalid(format!("target time '{value}': {e}")))?;
            TargetType::Time(time)
        }
        "xid" => TargetType::Xid(
            value
                .ok_or_else(|| Error::OptionRequired("target".into()))?
                .to_string(),
        ),
        "lsn" => TargetType::Lsn(
            value
                .ok_or_else(|| Error::OptionRequired("target".into()))?
                .parse()
                .map_err(|e| Error::ParamInvalid(format!("target lsn: {e:#}")))?,
        ),
        "name" => TargetType::Name(
            value
                .ok_or_else(|| Error::OptionRequired("target".into()))?
                .to_string(),
        ),
        other => {
            return Err(Error::ParamInvalid(format!(
                "'{other}' is not a recovery target type"
            )))
        }
    };
    Ok(RecoveryTarget {
        target,
        inclusive,
        timeline,
    })
}

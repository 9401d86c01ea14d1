//! The backup engine: start/stop protocol, manifest construction, parallel
//! copy, WAL-archived verification.

pub mod block_incr;
pub mod copy;
pub mod label;
pub mod manifest;
pub mod page_verify;

use std::collections::BTreeMap;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::sync::Arc;
use std::time::Instant;

use camino::Utf8Path;
use chrono::Utc;
use futures::stream::FuturesOrdered;
use futures::StreamExt;
use pg_wal::{PgVersion, WalSegment, PG_PAGE_SIZE_DEFAULT};
use tracing::{info, warn};

use crate::archive::{archive_info_path, backup_info_path, backup_path};
use crate::db::DbClient;
use crate::errors::{Error, Result};
use crate::info::{load, save, ArchiveInfo, BackupEntry, BackupInfo};
use crate::Context;
use copy::{CopyJob, CopyResult};
use label::{BackupLabel, BackupType};
use manifest::{FileEntry, LinkEntry, Manifest, PathEntry};

/// Directories whose contents are never backed up; the directories
/// themselves are recreated empty on restore.
const EXCLUDED_DIR_CONTENT: &[&str] = &[
    "pg_wal",
    "pg_xlog",
    "pg_replslot",
    "pg_dynshmem",
    "pg_notify",
    "pg_serial",
    "pg_snapshots",
    "pg_stat_tmp",
    "pg_subtrans",
];

/// Files never backed up.
const EXCLUDED_FILES: &[&str] = &[
    "postmaster.pid",
    "postmaster.opts",
    "pg_internal.init",
    "recovery.signal",
    "standby.signal",
];

#[derive(Debug)]
pub struct BackupOutcome {
    pub label: BackupLabel,
    pub warnings: Vec<String>,
}

/// Run one backup end to end. The caller holds the stanza backup lock.
pub async fn run_backup(
    ctx: &Arc<Context>,
    db: &dyn DbClient,
    standby: Option<&dyn DbClient>,
    backup_type: BackupType,
) -> Result<BackupOutcome> {
    let config = &ctx.config;
    ctx.config.require_repos()?;

    let version = db.version().await?;
    let system_id = db.system_id().await?;
    let mut warnings = Vec::new();

    if config.backup_standby && standby.is_none() {
        return Err(Error::OptionRequired("pg-host-standby".into()));
    }

    // Validate cluster identity against every repository; repositories that
    // mismatch are dropped from this run with a warning, as long as at
    // least one matches.
    let mut matching = Vec::new();
    let mut archive_ids = Vec::new();
    for (repo, storage) in ctx.repos() {
        let archive: Option<ArchiveInfo> =
            load(storage, &archive_info_path(&config.stanza), &ctx.cancel).await?;
        let backup: Option<BackupInfo> =
            load(storage, &backup_info_path(&config.stanza), &ctx.cancel).await?;
        match (archive, backup) {
            (Some(archive), Some(backup)) => {
                match archive
                    .check(version, system_id)
                    .and_then(|entry| backup.check(version, system_id).map(|()| entry))
                {
                    Ok(entry) => {
                        archive_ids.push(entry.archive_id.clone());
                        matching.push(repo.index);
                    }
                    Err(e) => {
                        warn!("repo{}: skipped for this backup: {e}", repo.index);
                        warnings.push(format!("repo{}: {e}", repo.index));
                    }
                }
            }
            _ => {
                return Err(Error::RepoInvalid(format!(
                    "repo{}: stanza info is missing -- has 'stanza-create' been run?",
                    repo.index
                )))
            }
        }
    }
    if matching.is_empty() {
        return Err(Error::DbMismatch(
            "no repository matches the cluster version and system-id".into(),
        ));
    }
    let ctx = ctx.filtered(&matching);
    let config = &ctx.config;

    // On a lazy checkpoint the start can take up to checkpoint_timeout.
    if !config.start_fast {
        let checkpoint_timeout = db.checkpoint_timeout().await?;
        if config.db_timeout <= checkpoint_timeout {
            warn!(
                "db-timeout {:?} is less than the PostgreSQL checkpoint_timeout {:?}; \
                 consider enabling start-fast",
                config.db_timeout, checkpoint_timeout
            );
        }
    }

    // Aborted prior attempts leave a label directory without a registry
    // entry; clean them up before we add more.
    cleanup_aborted(&ctx).await?;

    // Dependent backups chain off the registry of the first matching repo.
    let (_, first_storage) = ctx.repo(config.repos[0].index);
    let backup_info: BackupInfo = load(
        first_storage,
        &backup_info_path(&config.stanza),
        &ctx.cancel,
    )
    .await?
    .expect("checked above");

    let (prior_entry, prior_manifest) = match backup_type {
        BackupType::Full => (None, None),
        BackupType::Diff => {
            let full = backup_info
                .backups
                .iter()
                .rev()
                .find(|b| b.backup_type() == BackupType::Full)
                .ok_or_else(|| {
                    Error::FileMissing("no full backup exists for the differential".into())
                })?;
            let m = Manifest::load(first_storage, &config.stanza, &full.label, &ctx.cancel).await?;
            (Some(full.clone()), Some(m))
        }
        BackupType::Incr => {
            let latest = backup_info.latest().ok_or_else(|| {
                Error::FileMissing("no backup exists for the incremental".into())
            })?;
            let m =
                Manifest::load(first_storage, &config.stanza, &latest.label, &ctx.cancel).await?;
            (Some(latest.clone()), Some(m))
        }
    };

    let parent_full = prior_entry
        .as_ref()
        .map(|e| -> Result<BackupLabel> { Ok(e.label.full_part().parse()?) })
        .transpose()?;
    let new_label = BackupLabel::generate(backup_type, Utc::now(), parent_full.as_ref());
    info!("new backup label = {new_label}");

    // Record the last segment archived before start; after stop this proves
    // the archiver is alive and the range is complete.
    let wal_check = db.last_archived_wal().await?;

    let timestamp_start = Utc::now();
    let (start_lsn, wal_start) = db
        .start_backup(&format!("walvault backup {new_label}"), config.start_fast)
        .await?;
    info!("backup start archive = {wal_start}, lsn = {start_lsn}");

    // Walk the cluster while the backup is open.
    let (walk_files, paths, links) = walk_cluster(&config.pg_path, version)?;

    // Partition into referenced (unchanged since prior) and copy jobs.
    let mut files: BTreeMap<String, FileEntry> = BTreeMap::new();
    let mut jobs = Vec::new();
    for wf in walk_files {
        let prior = prior_manifest
            .as_ref()
            .and_then(|m| m.files.get(&wf.manifest_path));

        if let Some(prior_file) = prior {
            if prior_file.size == wf.size && prior_file.mtime == wf.mtime {
                // Unchanged: reference the backup that actually stores the
                // bytes, which may itself be a reference.
                let reference = prior_file
                    .reference
                    .clone()
                    .unwrap_or_else(|| prior_manifest.as_ref().unwrap().label.clone());
                files.insert(
                    wf.manifest_path.clone(),
                    FileEntry {
                        size: wf.size,
                        mtime: wf.mtime,
                        mode: wf.mode,
                        user: wf.user.clone(),
                        group: wf.group.clone(),
                        checksum: prior_file.checksum.clone(),
                        repo_size: prior_file.repo_size,
                        reference: Some(reference),
                        bundle: None,
                        block_incr: prior_file.block_incr.clone(),
                        page_check: None,
                    },
                );
                continue;
            }
        }

        // With block-incremental on, a file without a prior map deltas
        // against an empty map: everything stored, map recorded for the
        // next backup to delta against.
        let prior_blocks = config.block_incr.then(|| {
            prior
                .and_then(|p| p.block_incr.clone())
                .unwrap_or(block_incr::BlockIncrMap {
                    block_size: block_incr::BLOCK_SIZE_DEFAULT,
                    hashes: Vec::new(),
                    changed: Vec::new(),
                })
        });

        jobs.push((
            wf.clone(),
            CopyJob {
                manifest_path: wf.manifest_path.clone(),
                cluster_path: wf.cluster_path.clone(),
                source: wf.source.clone(),
                size: wf.size,
                prior_blocks,
            },
        ));
    }

    // Bundling applies with a single repository only: bundle offsets are
    // positions in that repo's filtered payloads and cannot be shared.
    let bundle_limits = match (&config.repos[..], config.repos[0].bundle) {
        ([repo], Some(limits)) => {
            debug_assert_eq!(repo.index, config.repos[0].index);
            Some(limits)
        }
        (_, Some(_)) => {
            warn!("file bundling is disabled when multiple repositories are configured");
            None
        }
        _ => None,
    };

    let (bundle_jobs, copy_jobs): (Vec<_>, Vec<_>) = jobs.into_iter().partition(|(_, j)| {
        bundle_limits.is_some_and(|limits| j.size <= limits.bundle_limit)
    });

    // Small files are packed into bundles by the controller; order within a
    // bundle does not matter, sequential filtering keeps offsets stable.
    if let Some(limits) = bundle_limits {
        bundle_files(&ctx, &new_label, start_lsn, limits, &bundle_jobs, &mut files).await?;
    }

    // Everything else copies in parallel, largest file first.
    let planned = copy::plan(copy_jobs.iter().map(|(_, j)| j.clone()).collect());
    let walk_meta: BTreeMap<String, WalkFile> = copy_jobs
        .into_iter()
        .map(|(wf, _)| (wf.manifest_path.clone(), wf))
        .collect();

    let results = run_copy_jobs(&ctx, &new_label, start_lsn, planned).await?;
    for result in results {
        let wf = &walk_meta[&result.manifest_path];
        for warning in &result.warnings {
            warn!("{warning}");
            warnings.push(warning.clone());
        }
        if let Some(page_check) = &result.page_check {
            if !page_check.valid {
                warn!(
                    "invalid page checksum(s) found in '{}': {:?}",
                    result.manifest_path, page_check.invalid_pages
                );
            }
        }
        files.insert(
            result.manifest_path.clone(),
            FileEntry {
                size: result.size,
                mtime: wf.mtime,
                mode: wf.mode,
                user: wf.user.clone(),
                group: wf.group.clone(),
                checksum: result.checksum,
                repo_size: result.repo_size,
                reference: None,
                bundle: None,
                block_incr: result.block_incr,
                page_check: result.page_check,
            },
        );
    }

    // Stop protocol.
    let stop = db.stop_backup().await?;
    info!("backup stop archive = {}, lsn = {}", stop.wal_file, stop.lsn);

    // A standby-driven backup must force the segment closed itself; the
    // primary's stop-backup does not switch WAL for it.
    if let Some(standby) = standby {
        let switched = standby.switch_wal().await?;
        info!("standby switched WAL, closing {switched}");
    }
    if let Some(check) = wal_check {
        tracing::debug!("segment to check before backup = {check}");
    }

    // All WAL between start and stop must be archived before the backup is
    // usable.
    let seg_size = archive_segment_size(&ctx).await?;
    let range = wal_range(&wal_start, &stop.wal_file, seg_size, version)?;
    wait_for_wal(&ctx, &archive_ids, &range).await?;

    let manifest = Manifest {
        label: new_label.clone(),
        backup_type,
        prior: prior_entry.as_ref().map(|e| e.label.clone()),
        version,
        system_id,
        start_lsn,
        stop_lsn: stop.lsn,
        wal_start: wal_start.clone(),
        wal_stop: stop.wal_file.clone(),
        timestamp_start,
        timestamp_stop: Utc::now(),
        backup_label: stop.backup_label,
        tablespace_map: stop.tablespace_map,
        files,
        paths,
        links,
    };
    manifest.validate()?;

    // Save the manifest and register the backup on every repository that
    // took part.
    let mut manifest_checksum = String::new();
    for (i, (repo, storage)) in ctx.repos().enumerate() {
        manifest_checksum = manifest.save(storage, &config.stanza, &ctx.cancel).await?;
        let mut info: BackupInfo = load(storage, &backup_info_path(&config.stanza), &ctx.cancel)
            .await?
            .expect("checked above");
        info.add(BackupEntry {
            label: new_label.clone(),
            prior: manifest.prior.clone(),
            archive_id: archive_ids[i].clone(),
            start_lsn,
            stop_lsn: stop.lsn,
            wal_start: wal_start.clone(),
            wal_stop: stop.wal_file.clone(),
            timestamp_start,
            timestamp_stop: manifest.timestamp_stop,
            manifest_checksum: manifest_checksum.clone(),
        });
        save(storage, &backup_info_path(&config.stanza), &info, &ctx.cancel).await?;
        info!("repo{}: backup {new_label} registered", repo.index);
    }

    info!(
        "{backup_type} backup {new_label} complete, {} file(s)",
        manifest.files.len()
    );
    Ok(BackupOutcome {
        label: new_label,
        warnings,
    })
}

/// Pack small files into bounded-size bundle objects on the single
/// configured repository, recording `(bundle_id, offset, size)` per file.
async fn bundle_files(
    ctx: &Context,
    label: &BackupLabel,
    start_lsn: utils::lsn::Lsn,
    limits: repo_storage::bundle::BundleLimits,
    jobs: &[(WalkFile, CopyJob)],
    files: &mut BTreeMap<String, FileEntry>,
) -> Result<()> {
    use repo_storage::bundle::BundleWriter;
    use repo_storage::filter::FilterPipeline;

    let (repo, storage) = ctx.repo(ctx.config.repos[0].index);
    let mut writer = BundleWriter::new(limits);
    let mut pending: Vec<(String, FileEntry)> = Vec::new();

    for (wf, job) in jobs {
        let content = tokio::fs::read(&job.source)
            .await
            .map_err(|e| Error::FileOpen(format!("unable to read '{}': {e}", job.source)))?;

        let page_check = if crate::backup::page_verify::is_relation_file(&job.cluster_path) {
            let mut verifier =
                crate::backup::page_verify::PageVerifier::new(PG_PAGE_SIZE_DEFAULT, start_lsn);
            verifier.update(&content)?;
            Some(verifier.finish())
        } else {
            None
        };

        let (filters, tap) = crate::archive::write_filters(repo);
        let mut pipeline = FilterPipeline::new(filters);
        let stored = pipeline
            .process(&content)
            .map_err(|e| Error::Format(format!("filter '{}': {e:#}", job.manifest_path)))?;

        let bundle_ref = writer.add(&stored);
        pending.push((
            job.manifest_path.clone(),
            FileEntry {
                size: content.len() as u64,
                mtime: wf.mtime,
                mode: wf.mode,
                user: wf.user.clone(),
                group: wf.group.clone(),
                checksum: (!content.is_empty())
                    .then(|| tap.sha1().expect("pipeline flush finalizes the tap")),
                repo_size: stored.len() as u64,
                reference: None,
                bundle: Some(bundle_ref),
                block_incr: None,
                page_check,
            },
        ));

        if let Some((bundle_id, bytes)) = writer.cut_if_full() {
            upload_bundle(ctx, storage, label, bundle_id, bytes).await?;
            files.extend(pending.drain(..));
        }
    }

    if let Some((bundle_id, bytes)) = writer.cut() {
        upload_bundle(ctx, storage, label, bundle_id, bytes).await?;
    }
    files.extend(pending);
    Ok(())
}

async fn upload_bundle(
    ctx: &Context,
    storage: &repo_storage::GenericRepoStorage,
    label: &BackupLabel,
    bundle_id: u64,
    bytes: Vec<u8>,
) -> Result<()> {
    let path = crate::archive::bundle_path(&ctx.config.stanza, label.as_str(), bundle_id);
    storage
        .write_bytes(&path, bytes::Bytes::from(bytes), &ctx.cancel)
        .await
        .map_err(|e| Error::FileWrite(format!("bundle '{path}': {e:#}")))
}

async fn run_copy_jobs(
    ctx: &Arc<Context>,
    label: &BackupLabel,
    start_lsn: utils::lsn::Lsn,
    planned: Vec<CopyJob>,
) -> Result<Vec<CopyResult>> {
    let mut results = Vec::with_capacity(planned.len());
    let mut jobs = FuturesOrdered::new();
    let mut iter = planned.into_iter();
    loop {
        let added = match iter.next() {
            Some(job) => {
                let ctx = Arc::clone(ctx);
                let label = label.as_str().to_string();
                jobs.push_back(async move {
                    copy::copy_file(&ctx, &label, start_lsn, PG_PAGE_SIZE_DEFAULT, &job).await
                });
                true
            }
            None => false,
        };
        if !added || jobs.len() >= ctx.config.process_max {
            match jobs.next().await {
                Some(result) => results.push(result?),
                None => break,
            }
        }
    }
    Ok(results)
}

#[derive(Debug, Clone)]
struct WalkFile {
    manifest_path: String,
    cluster_path: String,
    source: camino::Utf8PathBuf,
    size: u64,
    mtime: i64,
    mode: u32,
    user: Option<String>,
    group: Option<String>,
}

type WalkOutput = (
    Vec<WalkFile>,
    BTreeMap<String, PathEntry>,
    BTreeMap<String, LinkEntry>,
);

/// Enumerate the cluster contents to back up.
fn walk_cluster(pg_path: &Utf8Path, version: PgVersion) -> Result<WalkOutput> {
    let mut files = Vec::new();
    let mut paths = BTreeMap::new();
    let mut links = BTreeMap::new();

    let wal_dir = version.wal_dir();

    for entry in walkdir::WalkDir::new(pg_path).follow_links(false) {
        let entry =
            entry.map_err(|e| Error::PathOpen(format!("unable to walk '{pg_path}': {e}")))?;
        let path = Utf8Path::from_path(entry.path())
            .ok_or_else(|| Error::Format(format!("non-utf8 path {:?}", entry.path())))?;
        if path == pg_path {
            continue;
        }
        let relative = path
            .strip_prefix(pg_path)
            .expect("walked path is under the root")
            .as_str()
            .to_string();

        // Contents of excluded directories are skipped; WAL is restored
        // from the archive, not from the backup.
        let top = relative.split('/').next().unwrap_or(&relative);
        if EXCLUDED_DIR_CONTENT.contains(&top) && relative != top {
            continue;
        }
        if top == wal_dir && relative != top {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if EXCLUDED_FILES.contains(&name.as_ref()) || name.starts_with("pgsql_tmp") {
            continue;
        }

        let metadata = entry
            .metadata()
            .map_err(|e| Error::FileOpen(format!("unable to stat '{path}': {e}")))?;
        let manifest_path = format!("pg_data/{relative}");

        if metadata.is_dir() {
            paths.insert(
                manifest_path,
                PathEntry {
                    mode: metadata.permissions().mode() & 0o7777,
                    user: user_name(metadata.uid()),
                    group: group_name(metadata.gid()),
                },
            );
        } else if metadata.is_symlink() {
            let dest = std::fs::read_link(path)
                .map_err(|e| Error::FileRead(format!("unable to read link '{path}': {e}")))?;
            links.insert(
                manifest_path,
                LinkEntry {
                    destination: camino::Utf8PathBuf::from_path_buf(dest)
                        .map_err(|p| Error::Format(format!("non-utf8 link target {p:?}")))?,
                    user: user_name(metadata.uid()),
                    group: group_name(metadata.gid()),
                },
            );
        } else if metadata.is_file() {
            files.push(WalkFile {
                manifest_path,
                cluster_path: relative,
                source: path.to_path_buf(),
                size: metadata.len(),
                mtime: metadata.mtime(),
                mode: metadata.permissions().mode() & 0o7777,
                user: user_name(metadata.uid()),
                group: group_name(metadata.gid()),
            });
        }
        // sockets and other specials are not backed up
    }

    Ok((files, paths, links))
}

fn user_name(uid: u32) -> Option<String> {
    nix::unistd::User::from_uid(uid.into())
        .ok()
        .flatten()
        .map(|u| u.name)
}

fn group_name(gid: u32) -> Option<String> {
    nix::unistd::Group::from_gid(gid.into())
        .ok()
        .flatten()
        .map(|g| g.name)
}

/// Enumerate the segment names between two WAL files, inclusive.
fn wal_range(
    start: &str,
    stop: &str,
    seg_size: usize,
    version: PgVersion,
) -> Result<Vec<WalSegment>> {
    let start: WalSegment = start
        .parse()
        .map_err(|e| Error::Format(format!("{e:#}")))?;
    let stop: WalSegment = stop.parse().map_err(|e| Error::Format(format!("{e:#}")))?;
    if stop < start {
        return Err(Error::Assert(format!(
            "stop segment {stop} precedes start segment {start}"
        )));
    }

    let mut range = vec![start];
    let mut current = start;
    while current < stop {
        current = current.next(seg_size, version);
        range.push(current);
    }
    Ok(range)
}

/// Segment size from archive.info of the first repository.
async fn archive_segment_size(ctx: &Context) -> Result<usize> {
    let (_, storage) = ctx.repo(ctx.config.repos[0].index);
    let info: ArchiveInfo = load(storage, &archive_info_path(&ctx.config.stanza), &ctx.cancel)
        .await?
        .expect("validated at backup start");
    Ok(info.current()?.wal_segment_size)
}

/// Block until every segment in `range` is archived on at least one
/// repository, bounded by `archive-timeout`.
async fn wait_for_wal(ctx: &Context, archive_ids: &[String], range: &[WalSegment]) -> Result<()> {
    let deadline = Instant::now() + ctx.config.archive_timeout;
    let mut missing: Vec<WalSegment> = range.to_vec();

    loop {
        let mut still_missing = Vec::new();
        for segment in &missing {
            let mut found = false;
            for (i, (_, storage)) in ctx.repos().enumerate() {
                if crate::archive::wal_segment_find(
                    storage,
                    &ctx.config.stanza,
                    &archive_ids[i],
                    segment,
                    &ctx.cancel,
                )
                .await?
                .is_some()
                {
                    found = true;
                    break;
                }
            }
            if !found {
                still_missing.push(*segment);
            }
        }

        if still_missing.is_empty() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(Error::ArchiveTimeout(format!(
                "WAL segment(s) {} were not archived before the {:?} timeout\n\
                 HINT: check that archive_command is configured and running.",
                still_missing
                    .iter()
                    .map(|s| s.to_string())
                    .collect::<Vec<_>>()
                    .join(", "),
                ctx.config.archive_timeout
            )));
        }
        missing = still_missing;
        tokio::time::sleep(std::time::Duration::from_millis(250)).await;
    }
}

/// Remove label directories that have no registry entry (aborted runs).
async fn cleanup_aborted(ctx: &Context) -> Result<()> {
    for (repo, storage) in ctx.repos() {
        let registered: BackupInfo = load(
            storage,
            &backup_info_path(&ctx.config.stanza),
            &ctx.cancel,
        )
        .await?
        .unwrap_or_default();

        let prefix = backup_path(&ctx.config.stanza);
        let entries = storage
            .list(
                Some(&prefix),
                repo_storage::InfoLevel::Exists,
                false,
                None,
                &ctx.cancel,
            )
            .await
            .map_err(|e| Error::FileRead(format!("{e:#}")))?;

        for entry in entries {
            let Some(name) = entry.path.object_name() else {
                continue;
            };
            let Ok(label) = name.parse::<BackupLabel>() else {
                continue; // backup.info and friends
            };
            if registered.find(&label).is_none() {
                warn!(
                    "repo{}: removing aborted backup directory '{label}'",
                    repo.index
                );
                storage
                    .remove_prefix(&prefix.join(label.as_str()), &ctx.cancel)
                    .await
                    .map_err(|e| Error::FileRemove(format!("{e:#}")))?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pg_wal::WAL_SEGMENT_SIZE_DEFAULT;

    #[test]
    fn wal_range_enumerates_inclusively() {
        let range = wal_range(
            "000000010000000100000001",
            "000000010000000100000003",
            WAL_SEGMENT_SIZE_DEFAULT,
            PgVersion(160000),
        )
        .unwrap();
        let names: Vec<String> = range.iter().map(|s| s.to_string()).collect();
        assert_eq!(
            names,
            vec![
                "000000010000000100000001",
                "000000010000000100000002",
                "000000010000000100000003",
            ]
        );
    }

    #[test]
    fn wal_range_rejects_reversed() {
        assert!(wal_range(
            "000000010000000100000003",
            "000000010000000100000001",
            WAL_SEGMENT_SIZE_DEFAULT,
            PgVersion(160000),
        )
        .is_err());
    }

    #[test]
    fn single_segment_range() {
        let range = wal_range(
            "000000010000000100000001",
            "000000010000000100000001",
            WAL_SEGMENT_SIZE_DEFAULT,
            PgVersion(160000),
        )
        .unwrap();
        assert_eq!(range.len(), 1);
    }
}

//! check, info, verify, expire.

use std::sync::Arc;

use serde_json::json;
use tracing::{info, warn};
use utils::lock::LockFamily;

use crate::archive::{archive_info_path, backup_info_path, backup_path, wal_segment_find};
use crate::backup::manifest::Manifest;
use crate::db::{discover_primary, DbClient};
use crate::errors::{Error, Result, EXIT_OK};
use crate::info::{load, save, ArchiveInfo, BackupInfo};
use crate::Context;

/// check: prove the configuration can actually archive and be restored
/// from. Validates info files against the live cluster, forces a WAL
/// switch, and waits for the closed segment to reach a repository.
pub async fn check(ctx: &Arc<Context>) -> Result<i32> {
    ctx.config.require_repos()?;
    let db = discover_primary(&ctx.config).await?;
    let version = db.version().await?;
    let system_id = db.system_id().await?;

    let mut archive_ids = Vec::new();
    for (repo, storage) in ctx.repos() {
        let archive: ArchiveInfo =
            load(storage, &archive_info_path(&ctx.config.stanza), &ctx.cancel)
                .await?
                .ok_or_else(|| {
                    Error::RepoInvalid(format!(
                        "repo{}: archive.info is missing -- has 'stanza-create' been run?",
                        repo.index
                    ))
                })?;
        let entry = archive.check(version, system_id)?;
        let backup: BackupInfo =
            load(storage, &backup_info_path(&ctx.config.stanza), &ctx.cancel)
                .await?
                .ok_or_else(|| {
                    Error::RepoInvalid(format!("repo{}: backup.info is missing", repo.index))
                })?;
        backup.check(version, system_id)?;
        archive_ids.push(entry.archive_id.clone());
        info!("repo{}: stanza info valid (archive-id {})", repo.index, entry.archive_id);
    }

    // Round trip: close the current segment and wait for the archiver to
    // land it on some repository.
    let switched = db.switch_wal().await?;
    info!("WAL segment {switched} switched, waiting for archive");
    let segment = switched
        .parse()
        .map_err(|e| Error::Format(format!("{e:#}")))?;

    let deadline = std::time::Instant::now() + ctx.config.archive_timeout;
    loop {
        for (i, (_, storage)) in ctx.repos().enumerate() {
            if wal_segment_find(storage, &ctx.config.stanza, &archive_ids[i], &segment, &ctx.cancel)
                .await?
                .is_some()
            {
                info!("WAL segment {switched} successfully archived");
                return Ok(EXIT_OK);
            }
        }
        if std::time::Instant::now() >= deadline {
            return Err(Error::ArchiveTimeout(format!(
                "WAL segment {switched} was not archived within {:?}\n\
                 HINT: check that archive_command is configured and running.",
                ctx.config.archive_timeout
            )));
        }
        tokio::time::sleep(std::time::Duration::from_millis(250)).await;
    }
}

/// info: machine-readable stanza state across repositories.
pub async fn stanza_info(ctx: &Arc<Context>) -> Result<i32> {
    ctx.config.require_repos()?;
    let mut repos = Vec::new();

    for (repo, storage) in ctx.repos() {
        let archive: Option<ArchiveInfo> =
            load(storage, &archive_info_path(&ctx.config.stanza), &ctx.cancel).await?;
        let backup: Option<BackupInfo> =
            load(storage, &backup_info_path(&ctx.config.stanza), &ctx.cancel).await?;

        let backups: Vec<serde_json::Value> = backup
            .as_ref()
            .map(|b| {
                b.backups
                    .iter()
                    .map(|entry| {
                        json!({
                            "label": entry.label,
                            "type": entry.backup_type(),
                            "prior": entry.prior,
                            "timestamp-start": entry.timestamp_start,
                            "timestamp-stop": entry.timestamp_stop,
                            "wal-start": entry.wal_start,
                            "wal-stop": entry.wal_stop,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        repos.push(json!({
            "repo": repo.index,
            "archive-id": archive
                .as_ref()
                .and_then(|a| a.current().ok().map(|e| e.archive_id.clone())),
            "backups": backups,
        }));
    }

    let output = json!({ "stanza": ctx.config.stanza, "repos": repos });
    println!("{}", serde_json::to_string_pretty(&output).expect("json renders"));
    Ok(EXIT_OK)
}

/// verify: manifest-vs-object existence and hash checks for every
/// registered backup.
pub async fn verify(ctx: &Arc<Context>) -> Result<i32> {
    ctx.config.require_repos()?;
    let mut report = Vec::new();
    let mut failed = false;

    for (repo, storage) in ctx.repos() {
        let Some(backup_info) =
            load::<BackupInfo>(storage, &backup_info_path(&ctx.config.stanza), &ctx.cancel).await?
        else {
            continue;
        };

        for entry in &backup_info.backups {
            let manifest =
                match Manifest::load(storage, &ctx.config.stanza, &entry.label, &ctx.cancel).await {
                    Ok(manifest) => manifest,
                    Err(e) => {
                        failed = true;
                        report.push(json!({
                            "repo": repo.index,
                            "backup": entry.label,
                            "error": e.to_string(),
                        }));
                        continue;
                    }
                };

            let mut missing = Vec::new();
            let mut corrupt = Vec::new();
            for (path, file) in &manifest.files {
                if file.size == 0 || file.reference.is_some() {
                    continue;
                }
                // bundled files live at a byte range of their bundle object
                let (object, range) = match &file.bundle {
                    Some(bundle) => (
                        crate::archive::bundle_path(
                            &ctx.config.stanza,
                            entry.label.as_str(),
                            bundle.bundle_id,
                        ),
                        Some((bundle.offset, Some(bundle.size))),
                    ),
                    None => {
                        let object_name = match repo.compress_type.extension() {
                            Some(ext) => format!("{path}.{ext}"),
                            None => path.clone(),
                        };
                        (
                            backup_path(&ctx.config.stanza)
                                .join(entry.label.as_str())
                                .join(&object_name),
                            None,
                        )
                    }
                };

                match storage.read(&object, range, true, &ctx.cancel).await {
                    Ok(Some(download)) => {
                        let raw = repo_storage::download_to_vec(download)
                            .await
                            .map_err(Error::from)?;
                        let (filters, tap) = crate::archive::read_filters(repo);
                        let mut pipeline = repo_storage::filter::FilterPipeline::new(filters);
                        match pipeline.process(&raw) {
                            Ok(_) => {
                                // block deltas hash differently; only whole
                                // files are hash-comparable here
                                if file.block_incr.is_none()
                                    && tap.sha1() != file.checksum
                                {
                                    corrupt.push(path.clone());
                                }
                            }
                            Err(_) => corrupt.push(path.clone()),
                        }
                    }
                    Ok(None) => missing.push(path.clone()),
                    Err(e) => return Err(e.into()),
                }
            }

            if !missing.is_empty() || !corrupt.is_empty() {
                failed = true;
            }
            report.push(json!({
                "repo": repo.index,
                "backup": entry.label,
                "files": manifest.files.len(),
                "missing": missing,
                "corrupt": corrupt,
            }));
        }
    }

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({ "verify": report })).expect("json renders")
    );
    if failed {
        Err(Error::RepoInvalid("verification found damaged backups".into()))
    } else {
        Ok(EXIT_OK)
    }
}

/// expire: count-based full-backup retention plus removal of WAL below the
/// oldest kept backup.
pub async fn expire(ctx: &Arc<Context>) -> Result<i32> {
    ctx.config.require_repos()?;
    let _lock = super::command_lock(ctx, LockFamily::Backup)?;

    for (repo, storage) in ctx.repos() {
        let Some(retention) = repo.retention_full else {
            continue;
        };
        let Some(mut backup_info) =
            load::<BackupInfo>(storage, &backup_info_path(&ctx.config.stanza), &ctx.cancel).await?
        else {
            continue;
        };

        let expired: Vec<_> = backup_info
            .expired(retention)
            .into_iter()
            .cloned()
            .collect();
        if expired.is_empty() {
            info!("repo{}: nothing to expire", repo.index);
            continue;
        }

        for entry in &expired {
            info!("repo{}: expiring backup {}", repo.index, entry.label);
            storage
                .remove_prefix(
                    &backup_path(&ctx.config.stanza).join(entry.label.as_str()),
                    &ctx.cancel,
                )
                .await
                .map_err(|e| Error::FileRemove(format!("repo{}: {e:#}", repo.index)))?;
        }
        backup_info
            .backups
            .retain(|b| !expired.iter().any(|e| e.label == b.label));

        // WAL below the oldest kept backup's start is unreachable by any
        // restore and can go.
        if let Some(oldest) = backup_info.backups.first() {
            let archive_id = oldest.archive_id.clone();
            let wal_floor = oldest.wal_start.clone();
            let prefix = crate::archive::archive_path(&ctx.config.stanza).join(&archive_id);
            let entries = storage
                .list(
                    Some(&prefix),
                    repo_storage::InfoLevel::Exists,
                    true,
                    None,
                    &ctx.cancel,
                )
                .await
                .map_err(|e| Error::FileRead(format!("{e:#}")))?;
            let mut removed = 0u64;
            for object in entries {
                let Some(name) = object.path.object_name() else {
                    continue;
                };
                // segment objects sort by name; anything below the floor is
                // expired (history files never match the segment shape)
                if name.len() > 24
                    && name.as_bytes()[24] == b'-'
                    && name[..24].chars().all(|c| c.is_ascii_hexdigit())
                    && &name[..24] < wal_floor.as_str()
                {
                    storage
                        .remove(&object.path, false, &ctx.cancel)
                        .await
                        .map_err(|e| Error::FileRemove(format!("{e:#}")))?;
                    removed += 1;
                }
            }
            info!(
                "repo{}: expired {} backup(s) and {removed} WAL segment(s)",
                repo.index,
                expired.len()
            );
        }

        save(storage, &backup_info_path(&ctx.config.stanza), &backup_info, &ctx.cancel).await?;
    }
    Ok(EXIT_OK)
}

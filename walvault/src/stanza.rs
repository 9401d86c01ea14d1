//! Stanza lifecycle: create, upgrade, delete.
//!
//! A stanza is the per-cluster namespace in every repository. Creation
//! seeds `archive.info` and `backup.info` with the live cluster's identity;
//! upgrade renumbers the archive-id after a major version change; delete
//! removes everything the stanza owns.

use tracing::info;

use crate::archive::{archive_info_path, archive_path, backup_info_path, backup_path};
use crate::db::DbClient;
use crate::errors::{Error, Result};
use crate::info::{load, save, ArchiveInfo, BackupInfo};
use crate::Context;

/// stanza-create. Idempotent: existing info files that match the cluster
/// are left untouched; mismatching ones are an error.
pub async fn create(ctx: &Context, db: &dyn DbClient) -> Result<()> {
    ctx.config.require_repos()?;
    let version = db.version().await?;
    let system_id = db.system_id().await?;
    let wal_segment_size = db.wal_segment_size().await?;

    for (repo, storage) in ctx.repos() {
        let archive: Option<ArchiveInfo> =
            load(storage, &archive_info_path(&ctx.config.stanza), &ctx.cancel).await?;
        let backup: Option<BackupInfo> =
            load(storage, &backup_info_path(&ctx.config.stanza), &ctx.cancel).await?;

        match (archive, backup) {
            (Some(archive), Some(backup)) => {
                archive.check(version, system_id).map_err(|e| {
                    Error::RepoInvalid(format!(
                        "repo{}: stanza '{}' already exists for a different cluster: {e}",
                        repo.index, ctx.config.stanza
                    ))
                })?;
                backup.check(version, system_id)?;
                info!(
                    "repo{}: stanza '{}' already exists and matches the cluster",
                    repo.index, ctx.config.stanza
                );
            }
            (None, None) => {
                let archive = ArchiveInfo::new(version, system_id, wal_segment_size);
                let backup =
                    BackupInfo::new(version, system_id, storage.is_versioning_capable());
                save(storage, &archive_info_path(&ctx.config.stanza), &archive, &ctx.cancel)
                    .await?;
                save(storage, &backup_info_path(&ctx.config.stanza), &backup, &ctx.cancel)
                    .await?;
                info!(
                    "repo{}: stanza '{}' created (archive-id {})",
                    repo.index,
                    ctx.config.stanza,
                    archive.current()?.archive_id
                );
            }
            _ => {
                return Err(Error::RepoInvalid(format!(
                    "repo{}: stanza '{}' is half-created (one info file missing)\n\
                     HINT: run 'stanza-delete' and create again.",
                    repo.index, ctx.config.stanza
                )))
            }
        }
    }
    Ok(())
}

/// stanza-upgrade: register a new cluster identity after a major upgrade.
pub async fn upgrade(ctx: &Context, db: &dyn DbClient) -> Result<()> {
    ctx.config.require_repos()?;
    let version = db.version().await?;
    let system_id = db.system_id().await?;
    let wal_segment_size = db.wal_segment_size().await?;

    for (repo, storage) in ctx.repos() {
        let mut archive: ArchiveInfo =
            load(storage, &archive_info_path(&ctx.config.stanza), &ctx.cancel)
                .await?
                .ok_or_else(|| {
                    Error::RepoInvalid(format!(
                        "repo{}: stanza '{}' does not exist",
                        repo.index, ctx.config.stanza
                    ))
                })?;
        let mut backup: BackupInfo =
            load(storage, &backup_info_path(&ctx.config.stanza), &ctx.cancel)
                .await?
                .ok_or_else(|| {
                    Error::RepoInvalid(format!(
                        "repo{}: stanza '{}' does not exist",
                        repo.index, ctx.config.stanza
                    ))
                })?;

        if archive.check(version, system_id).is_ok() {
            info!(
                "repo{}: stanza '{}' is already at version {version}",
                repo.index, ctx.config.stanza
            );
            continue;
        }

        let entry = archive.upgrade(version, system_id, wal_segment_size);
        info!(
            "repo{}: stanza '{}' upgraded to archive-id {}",
            repo.index, ctx.config.stanza, entry.archive_id
        );
        backup.version = Some(version);
        backup.system_id = Some(system_id);

        save(storage, &archive_info_path(&ctx.config.stanza), &archive, &ctx.cancel).await?;
        save(storage, &backup_info_path(&ctx.config.stanza), &backup, &ctx.cancel).await?;
    }
    Ok(())
}

/// stanza-delete: remove the stanza from every repository and the local
/// spool.
pub async fn delete(ctx: &Context) -> Result<()> {
    ctx.config.require_repos()?;

    for (repo, storage) in ctx.repos() {
        storage
            .remove_prefix(&archive_path(&ctx.config.stanza), &ctx.cancel)
            .await
            .map_err(|e| Error::FileRemove(format!("repo{}: {e:#}", repo.index)))?;
        storage
            .remove_prefix(&backup_path(&ctx.config.stanza), &ctx.cancel)
            .await
            .map_err(|e| Error::FileRemove(format!("repo{}: {e:#}", repo.index)))?;
        info!("repo{}: stanza '{}' deleted", repo.index, ctx.config.stanza);
    }

    let spool = ctx
        .config
        .spool_path
        .join("archive")
        .join(&ctx.config.stanza);
    if spool.exists() {
        std::fs::remove_dir_all(&spool)
            .map_err(|e| Error::FileRemove(format!("'{spool}': {e}")))?;
    }
    Ok(())
}

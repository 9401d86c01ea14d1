//! The restore engine: manifest replay into a destination directory.

pub mod filter;
pub mod resolver;

use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use futures::stream::FuturesOrdered;
use futures::StreamExt;
use repo_storage::filter::FilterPipeline;
use repo_storage::GenericRepoStorage;
use tracing::info;
use utils::crashsafe;

use crate::backup::block_incr;
use crate::backup::label::BackupLabel;
use crate::backup::manifest::{FileEntry, Manifest};
use crate::config::RepoConfig;
use crate::errors::{Error, Result};
use crate::Context;
use filter::RestoreSelector;
use resolver::{RecoveryTarget, TargetType};

#[derive(Debug, Clone)]
pub struct RestoreOptions {
    pub target: RecoveryTarget,
    /// Explicit backup set; default is resolver's choice.
    pub set: Option<BackupLabel>,
    /// Reuse matching files in a non-empty destination.
    pub delta: bool,
    pub selector: Option<RestoreSelector>,
    /// recovery_target_action for the recovery configuration.
    pub target_action: Option<String>,
    /// Configure the restored cluster as a standby.
    pub standby: bool,
}

#[derive(Debug)]
pub struct RestoreOutcome {
    pub label: BackupLabel,
    pub files_restored: u64,
    pub files_skipped: u64,
}

/// Restore the resolved backup into `pg-path`. The caller holds the stanza
/// restore lock.
pub async fn run_restore(ctx: &Arc<Context>, options: &RestoreOptions) -> Result<RestoreOutcome> {
    let resolved = resolver::resolve(ctx, &options.target, options.set.as_ref()).await?;
    let (repo, storage) = ctx.repo(resolved.repo_index);
    info!(
        "restoring backup {} from repo{}",
        resolved.entry.label, resolved.repo_index
    );

    let manifest = Manifest::load(
        storage,
        &ctx.config.stanza,
        &resolved.entry.label,
        &ctx.cancel,
    )
    .await?;

    let pg_path = ctx.config.pg_path.clone();
    check_destination(&pg_path, options.delta)?;

    // Paths first, then links, then file payloads.
    for (manifest_path, entry) in &manifest.paths {
        let target = destination_path(&pg_path, manifest_path)?;
        if !target.exists() {
            crashsafe::create_dir_all(&target)
                .map_err(|e| Error::PathOpen(format!("unable to create '{target}': {e}")))?;
        }
        std::fs::set_permissions(
            target.as_std_path(),
            std::fs::Permissions::from_mode(entry.mode),
        )
        .map_err(|e| Error::FileMode(format!("'{target}': {e}")))?;
    }
    for (manifest_path, entry) in &manifest.links {
        let target = destination_path(&pg_path, manifest_path)?;
        if !target.exists() {
            std::os::unix::fs::symlink(&entry.destination, &target)
                .map_err(|e| Error::FileWrite(format!("unable to link '{target}': {e}")))?;
        }
    }

    // The WAL directory is recreated empty; recovery fills it from the
    // archive.
    let wal_dir = pg_path.join(manifest.version.wal_dir());
    if !wal_dir.exists() {
        crashsafe::create_dir_all(&wal_dir)
            .map_err(|e| Error::PathOpen(format!("unable to create '{wal_dir}': {e}")))?;
    }

    let mut restored = 0u64;
    let mut skipped = 0u64;
    let mut jobs = FuturesOrdered::new();
    let mut planned: Vec<(String, FileEntry)> = manifest
        .files
        .iter()
        .map(|(p, e)| (p.clone(), e.clone()))
        .collect();
    // Largest first, matching the backup scheduler.
    planned.sort_by(|a, b| b.1.size.cmp(&a.1.size).then_with(|| a.0.cmp(&b.0)));

    let manifest = Arc::new(manifest);
    let mut iter = planned.into_iter();
    loop {
        let added = match iter.next() {
            Some((manifest_path, entry)) => {
                let target = destination_path(&pg_path, &manifest_path)?;

                // Delta mode skips files that already match by size and
                // content checksum.
                if options.delta && file_matches(&target, &entry) {
                    skipped += 1;
                    continue;
                }

                // Selective restore zeroes out unselected relation data.
                let cluster_path = manifest_path
                    .strip_prefix("pg_data/")
                    .unwrap_or(&manifest_path)
                    .to_string();
                if let Some(selector) = &options.selector {
                    if !selector.restores_content(&cluster_path) {
                        write_file(&target, &[], entry.mode)?;
                        skipped += 1;
                        continue;
                    }
                }

                let ctx = Arc::clone(ctx);
                let manifest = Arc::clone(&manifest);
                let repo_index = resolved.repo_index;
                jobs.push_back(async move {
                    let (repo, storage) = ctx.repo(repo_index);
                    let result = fetch_file_content(
                        &ctx,
                        repo,
                        storage,
                        &manifest,
                        &manifest_path,
                        &entry,
                    )
                    .await;
                    (manifest_path, entry, target, result)
                });
                true
            }
            None => false,
        };

        if !added || jobs.len() >= ctx.config.process_max {
            match jobs.next().await {
                Some((manifest_path, entry, target, result)) => {
                    let content = result?;
                    if let (Some(expected), false) = (&entry.checksum, content.is_empty()) {
                        let actual = sha1_hex(&content);
                        if &actual != expected {
                            return Err(Error::Format(format!(
                                "restored file '{manifest_path}' has checksum {actual}, \
                                 expected {expected}"
                            )));
                        }
                    }
                    write_file(&target, &content, entry.mode)?;
                    set_mtime(&target, entry.mtime)?;
                    restored += 1;
                }
                None => break,
            }
        }
    }

    // Hand control to the database: recovery configuration plus signal
    // files appropriate to the version and target.
    write_recovery_config(ctx, &manifest, options)?;

    info!(
        "restore of backup {} complete: {restored} file(s) restored, {skipped} skipped",
        resolved.entry.label
    );
    Ok(RestoreOutcome {
        label: resolved.entry.label.clone(),
        files_restored: restored,
        files_skipped: skipped,
    })
}

/// Read one file's raw content, following references and block-incremental
/// maps through the backup chain.
fn fetch_file_content<'a>(
    ctx: &'a Context,
    repo: &'a RepoConfig,
    storage: &'a GenericRepoStorage,
    manifest: &'a Manifest,
    manifest_path: &'a str,
    entry: &'a FileEntry,
) -> futures::future::BoxFuture<'a, Result<Vec<u8>>> {
    Box::pin(async move {
        if entry.size == 0 {
            return Ok(Vec::new());
        }

        // A referenced file lives in an ancestor backup; restore reads the
        // ancestor's manifest entry so nested references and block maps
        // resolve correctly.
        if let Some(reference) = &entry.reference {
            let ancestor =
                Manifest::load(storage, &ctx.config.stanza, reference, &ctx.cancel).await?;
            let ancestor_entry = ancestor.files.get(manifest_path).ok_or_else(|| {
                Error::Format(format!(
                    "file '{manifest_path}' is referenced to backup '{reference}' \
                     but missing from its manifest"
                ))
            })?;
            return fetch_file_content(ctx, repo, storage, &ancestor, manifest_path, ancestor_entry)
                .await;
        }

        // Read this backup's stored payload: a ranged read of the bundle for
        // bundled files, the standalone object otherwise. Either way the
        // filter stack reverses per file.
        let (object, range) = match &entry.bundle {
            Some(bundle) => (
                crate::archive::bundle_path(
                    &ctx.config.stanza,
                    manifest.label.as_str(),
                    bundle.bundle_id,
                ),
                Some((bundle.offset, Some(bundle.size))),
            ),
            None => {
                let object_name = match repo.compress_type.extension() {
                    Some(ext) => format!("{manifest_path}.{ext}"),
                    None => manifest_path.to_string(),
                };
                (
                    crate::archive::backup_path(&ctx.config.stanza)
                        .join(manifest.label.as_str())
                        .join(object_name),
                    None,
                )
            }
        };

        let download = storage
            .read(&object, range, false, &ctx.cancel)
            .await
            .map_err(Error::from)?
            .expect("missing object surfaces as DownloadError::NotFound");
        let raw = repo_storage::download_to_vec(download)
            .await
            .map_err(Error::from)?;

        let (filters, _tap) = crate::archive::read_filters(repo);
        let mut pipeline = FilterPipeline::new(filters);
        let payload = pipeline
            .process(&raw)
            .map_err(|e| Error::Format(format!("decode '{object}': {e:#}")))?;

        // A block map means the payload is a delta over the prior backup's
        // content (or over nothing when every block changed).
        if let Some(map) = &entry.block_incr {
            let total_blocks = block_incr::BlockIncrMap::block_count(entry.size, map.block_size);
            let base = if map.changed.len() == total_blocks {
                Vec::new()
            } else {
                let prior_label = manifest.prior.as_ref().ok_or_else(|| {
                    Error::Format(format!(
                        "file '{manifest_path}' has a block delta but the backup has no prior"
                    ))
                })?;
                let prior =
                    Manifest::load(storage, &ctx.config.stanza, prior_label, &ctx.cancel).await?;
                let prior_entry = prior.files.get(manifest_path).ok_or_else(|| {
                    Error::Format(format!(
                        "file '{manifest_path}' has a block delta but no prior entry"
                    ))
                })?;
                fetch_file_content(ctx, repo, storage, &prior, manifest_path, prior_entry).await?
            };
            return block_incr::block_restore(&base, map, &payload, entry.size);
        }

        Ok(payload)
    })
}

fn check_destination(pg_path: &Utf8Path, delta: bool) -> Result<()> {
    if !pg_path.exists() {
        crashsafe::create_dir_all(pg_path)
            .map_err(|e| Error::PathOpen(format!("unable to create '{pg_path}': {e}")))?;
        return Ok(());
    }
    if pg_path.join("postmaster.pid").exists() {
        return Err(Error::Command(format!(
            "unable to restore while PostgreSQL is running on '{pg_path}'\n\
             HINT: stop the server before restoring."
        )));
    }
    if !delta {
        let occupied = pg_path
            .read_dir_utf8()
            .map_err(|e| Error::PathOpen(format!("unable to read '{pg_path}': {e}")))?
            .next()
            .is_some();
        if occupied {
            return Err(Error::PathOpen(format!(
                "unable to restore to non-empty path '{pg_path}'\n\
                 HINT: use --delta to reuse matching files."
            )));
        }
    }
    Ok(())
}

fn destination_path(pg_path: &Utf8Path, manifest_path: &str) -> Result<Utf8PathBuf> {
    let relative = manifest_path.strip_prefix("pg_data/").ok_or_else(|| {
        Error::Format(format!("manifest path '{manifest_path}' is not under pg_data"))
    })?;
    Ok(pg_path.join(relative))
}

/// Delta-mode presence check: size plus content checksum. Timestamps are
/// not trusted here; a file of the right size with the wrong bytes must be
/// restored.
fn file_matches(target: &Utf8Path, entry: &FileEntry) -> bool {
    let Ok(metadata) = std::fs::metadata(target.as_std_path()) else {
        return false;
    };
    if !metadata.is_file() || metadata.len() != entry.size {
        return false;
    }
    if entry.size == 0 {
        return true;
    }
    let Some(expected) = entry.checksum.as_deref() else {
        return false;
    };
    match std::fs::read(target.as_std_path()) {
        Ok(content) => sha1_hex(&content) == expected,
        Err(_) => false,
    }
}

fn write_file(target: &Utf8Path, content: &[u8], mode: u32) -> Result<()> {
    if let Some(parent) = target.parent() {
        if !parent.exists() {
            crashsafe::create_dir_all(parent)
                .map_err(|e| Error::PathOpen(format!("unable to create '{parent}': {e}")))?;
        }
    }
    crashsafe::overwrite_file(target, "pgvault.tmp", content)
        .map_err(|e| Error::FileWrite(format!("'{target}': {e}")))?;
    std::fs::set_permissions(target.as_std_path(), std::fs::Permissions::from_mode(mode))
        .map_err(|e| Error::FileMode(format!("'{target}': {e}")))
}

fn set_mtime(target: &Utf8Path, mtime: i64) -> Result<()> {
    let time = nix::sys::time::TimeVal::new(mtime, 0);
    nix::sys::stat::utimes(target.as_std_path(), &time, &time)
        .map_err(|e| Error::FileWrite(format!("unable to set mtime of '{target}': {e}")))
}

fn sha1_hex(content: &[u8]) -> String {
    use sha1::{Digest, Sha1};
    let mut hasher = Sha1::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}

/// Write the recovery configuration that hands WAL replay to the database.
fn write_recovery_config(
    ctx: &Context,
    manifest: &Manifest,
    options: &RestoreOptions,
) -> Result<()> {
    let pg_path = &ctx.config.pg_path;
    let mut settings = Vec::new();

    let exe = std::env::current_exe()
        .ok()
        .and_then(|p| p.to_str().map(str::to_string))
        .unwrap_or_else(|| "walvault".to_string());
    settings.push(format!(
        "restore_command = '{exe} --stanza={} archive-get %f \"%p\"'",
        ctx.config.stanza
    ));

    match &options.target.target {
        TargetType::Default => {}
        TargetType::Immediate => settings.push("recovery_target = 'immediate'".to_string()),
        TargetType::Time(time) => settings.push(format!(
            "recovery_target_time = '{}'",
            time.format("%Y-%m-%d %H:%M:%S%z")
        )),
        TargetType::Xid(xid) => settings.push(format!("recovery_target_xid = '{xid}'")),
        TargetType::Lsn(lsn) => settings.push(format!("recovery_target_lsn = '{lsn}'")),
        TargetType::Name(name) => settings.push(format!("recovery_target_name = '{name}'")),
    }
    if !options.target.inclusive {
        settings.push("recovery_target_inclusive = 'false'".to_string());
    }
    if let Some(timeline) = &options.target.timeline {
        settings.push(format!("recovery_target_timeline = '{timeline}'"));
    }
    if let Some(action) = &options.target_action {
        settings.push(format!("recovery_target_action = '{action}'"));
    }

    if manifest.version >= pg_wal::version::PG_VERSION_12 {
        // settings go to postgresql.auto.conf, recovery is signaled by file
        let auto_conf = pg_path.join("postgresql.auto.conf");
        let mut contents = std::fs::read_to_string(&auto_conf).unwrap_or_default();
        contents.push_str("\n# Recovery settings generated by walvault restore.\n");
        for setting in &settings {
            contents.push_str(setting);
            contents.push('\n');
        }
        crashsafe::overwrite_file(&auto_conf, "pgvault.tmp", contents.as_bytes())
            .map_err(|e| Error::FileWrite(format!("'{auto_conf}': {e}")))?;

        let signal = if options.standby {
            pg_path.join("standby.signal")
        } else {
            pg_path.join("recovery.signal")
        };
        crashsafe::overwrite_file(&signal, "pgvault.tmp", b"")
            .map_err(|e| Error::FileWrite(format!("'{signal}': {e}")))?;
    } else {
        let mut contents = String::new();
        for setting in &settings {
            contents.push_str(setting);
            contents.push('\n');
        }
        if options.standby {
            contents.push_str("standby_mode = 'on'\n");
        }
        let recovery_conf = pg_path.join("recovery.conf");
        crashsafe::overwrite_file(&recovery_conf, "pgvault.tmp", contents.as_bytes())
            .map_err(|e| Error::FileWrite(format!("'{recovery_conf}': {e}")))?;
    }

    // write out the label the database expects to find
    if let Some(backup_label) = &manifest.backup_label {
        let label_path = pg_path.join("backup_label");
        crashsafe::overwrite_file(&label_path, "pgvault.tmp", backup_label.as_bytes())
            .map_err(|e| Error::FileWrite(format!("'{label_path}': {e}")))?;
    }
    if let Some(tablespace_map) = &manifest.tablespace_map {
        let map_path = pg_path.join("tablespace_map");
        crashsafe::overwrite_file(&map_path, "pgvault.tmp", tablespace_map.as_bytes())
            .map_err(|e| Error::FileWrite(format!("'{map_path}': {e}")))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destination_paths_stay_under_pg_data() {
        let pg = Utf8Path::new("/restore");
        assert_eq!(
            destination_path(pg, "pg_data/base/1/1259").unwrap(),
            Utf8PathBuf::from("/restore/base/1/1259")
        );
        assert!(destination_path(pg, "elsewhere/file").is_err());
    }

    #[test]
    fn non_delta_requires_empty_destination() {
        let dir = camino_tempfile::tempdir().unwrap();
        check_destination(dir.path(), false).unwrap();

        std::fs::write(dir.path().join("leftover"), b"x").unwrap();
        assert!(check_destination(dir.path(), false).is_err());
        // delta mode accepts the occupied directory
        check_destination(dir.path(), true).unwrap();
    }

    #[test]
    fn delta_match_requires_size_and_checksum() {
        let dir = camino_tempfile::tempdir().unwrap();
        let target = dir.path().join("base_file");
        std::fs::write(&target, b"payload").unwrap();

        let entry = |size: u64, checksum: Option<&str>| FileEntry {
            size,
            mtime: 0,
            mode: 0o600,
            user: None,
            group: None,
            checksum: checksum.map(str::to_string),
            repo_size: size,
            reference: None,
            bundle: None,
            block_incr: None,
            page_check: None,
        };

        let good = sha1_hex(b"payload");
        assert!(file_matches(&target, &entry(7, Some(&good))));
        // same size, different content: must not match
        assert!(!file_matches(&target, &entry(7, Some(&sha1_hex(b"PAYLOAD")))));
        // size mismatch short-circuits
        assert!(!file_matches(&target, &entry(8, Some(&good))));
        // missing file never matches
        assert!(!file_matches(&dir.path().join("absent"), &entry(7, Some(&good))));

        // empty files have no checksum and match on size alone
        let empty = dir.path().join("empty");
        std::fs::write(&empty, b"").unwrap();
        assert!(file_matches(&empty, &entry(0, None)));
    }

    #[test]
    fn running_cluster_is_refused() {
        let dir = camino_tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("postmaster.pid"), b"1234").unwrap();
        assert!(matches!(
            check_destination(dir.path(), true),
            Err(Error::Command(_))
        ));
    }
}

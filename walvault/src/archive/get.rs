//! Archive get: delivering WAL segments back to a recovering database.
//!
//! Sync mode searches the repositories for one segment and writes it to the
//! destination the database named. Async mode serves from the spool and
//! prefetches ahead of the recovery position; repositories are tried in
//! index order and a failure on one is only a warning if a later one can
//! serve a valid copy.

use std::sync::Arc;

use camino::Utf8Path;
use futures::stream::FuturesOrdered;
use futures::StreamExt;
use pg_wal::{WalFileKind, WalSegment};
use repo_storage::filter::FilterPipeline;
use utils::crashsafe;

use super::spool::{Spool, Status};
use crate::errors::{Error, Result};
use crate::info::{load, ArchiveInfo};
use crate::Context;

/// What a repository search produced.
#[derive(Debug)]
pub enum Found {
    /// Decoded segment bytes and the warnings collected from repositories
    /// that could not serve it.
    Yes { bytes: Vec<u8>, warnings: Vec<String> },
    /// No repository has the file; warnings may still name broken repos.
    No { warnings: Vec<String> },
}

/// Search every repository in index order for a WAL file and decode it.
///
/// A repository that errors (unreachable, corrupt object, bad decrypt) adds
/// a warning and the search moves on; the error is only fatal when no
/// repository at all can serve the file and at least one errored.
pub async fn fetch_wal_file(ctx: &Context, name: &str) -> Result<Found> {
    let kind = WalFileKind::from_name(name).map_err(|e| Error::Format(format!("{e:#}")))?;
    let mut warnings = Vec::new();
    let mut hard_errors = Vec::new();

    for (repo, storage) in ctx.repos() {
        let attempt: Result<Option<Vec<u8>>> = async {
            let info: ArchiveInfo = load(
                storage,
                &super::archive_info_path(&ctx.config.stanza),
                &ctx.cancel,
            )
            .await?
            .ok_or_else(|| {
                Error::RepoInvalid(format!(
                    "repo{}: archive.info is missing -- has 'stanza-create' been run?",
                    repo.index
                ))
            })?;
            let current = info.current()?.clone();

            let object = match &kind {
                WalFileKind::Segment(segment) => {
                    match super::wal_segment_find(
                        storage,
                        &ctx.config.stanza,
                        &current.archive_id,
                        segment,
                        &ctx.cancel,
                    )
                    .await?
                    {
                        Some(object_name) => Some((
                            super::wal_log_path(&ctx.config.stanza, &current.archive_id, segment)
                                .join(&object_name),
                            object_name,
                        )),
                        None => None,
                    }
                }
                WalFileKind::History | WalFileKind::BackupHistory => {
                    let path =
                        super::wal_history_path(&ctx.config.stanza, &current.archive_id, name);
                    storage
                        .info(&path, repo_storage::InfoLevel::Exists, &ctx.cancel)
                        .await
                        .map_err(|e| Error::FileRead(format!("{e:#}")))?
                        .exists
                        .then(|| (path, name.to_string()))
                }
                WalFileKind::Partial(_) => {
                    return Err(Error::ParamInvalid(format!(
                        "partial WAL file '{name}' cannot be fetched"
                    )))
                }
            };

            let Some((path, object_name)) = object else {
                return Ok(None);
            };

            let download = storage
                .read(&path, None, false, &ctx.cancel)
                .await
                .map_err(Error::from)?
                .expect("missing object surfaces as DownloadError::NotFound");
            let raw = repo_storage::download_to_vec(download)
                .await
                .map_err(Error::from)?;

            // Reverse the filter stack; the tap now hashes the plaintext.
            let (filters, tap) = super::read_filters(repo);
            let mut pipeline = FilterPipeline::new(filters);
            let bytes = pipeline
                .process(&raw)
                .map_err(|e| Error::Format(format!("decode '{object_name}': {e:#}")))?;

            // Content addressing makes corruption detectable before the
            // bytes reach the database.
            if let WalFileKind::Segment(_) = &kind {
                let stored_hash = object_name
                    .split('-')
                    .nth(1)
                    .map(|h| h.split('.').next().unwrap_or(h))
                    .unwrap_or_default();
                let actual = tap.sha1().expect("pipeline flush finalizes the tap");
                if stored_hash != actual {
                    return Err(Error::Format(format!(
                        "checksum of '{object_name}' is {actual}, expected {stored_hash}"
                    )));
                }
            }

            Ok(Some(bytes))
        }
        .await;

        match attempt {
            Ok(Some(bytes)) => return Ok(Found::Yes { bytes, warnings }),
            Ok(None) => continue,
            Err(e) => {
                let warning = format!("repo{}: [{}] {e}", repo.index, e.kind_name());
                tracing::warn!("{warning}");
                warnings.push(warning.clone());
                hard_errors.push(warning);
            }
        }
    }

    if !hard_errors.is_empty() && hard_errors.len() == ctx.config.repos.len() {
        // every repository failed outright; surface the first failure
        return Err(Error::FileRead(format!(
            "unable to get WAL file '{name}' from any repository\n{}",
            hard_errors.join("\n")
        )));
    }

    Ok(Found::No { warnings })
}

/// Sync get: search, decode, write to the destination. `Ok(true)` means
/// delivered, `Ok(false)` means not found (exit code 1).
pub async fn get_file(ctx: &Context, name: &str, destination: &Utf8Path) -> Result<bool> {
    match fetch_wal_file(ctx, name).await? {
        Found::Yes { bytes, .. } => {
            write_destination(destination, &bytes)?;
            tracing::info!("found {name} in the archive");
            Ok(true)
        }
        Found::No { .. } => {
            tracing::info!("unable to find {name} in the archive");
            Ok(false)
        }
    }
}

fn write_destination(destination: &Utf8Path, bytes: &[u8]) -> Result<()> {
    crashsafe::overwrite_file(destination, "pgvault.tmp", bytes)
        .map_err(|e| Error::FileWrite(format!("'{destination}': {e}")))
}

/// Serve a segment from the spool if a prior prefetch staged it (or already
/// concluded it is missing or broken). Consumes the spool artifacts.
pub fn serve_from_spool(
    spool: &Spool,
    name: &str,
    destination: &Utf8Path,
) -> Result<Option<bool>> {
    let staged = spool.staged(name);
    if staged.exists() {
        let bytes = std::fs::read(&staged)
            .map_err(|e| Error::FileRead(format!("spooled WAL file '{staged}': {e}")))?;
        write_destination(destination, &bytes)?;
        if let Some(Status::Ok { warnings }) = spool.status(spool.in_dir(), name)? {
            for warning in warnings {
                tracing::warn!("{warning}");
            }
        }
        std::fs::remove_file(&staged)
            .map_err(|e| Error::FileRemove(format!("'{staged}': {e}")))?;
        spool.clear_status(spool.in_dir(), name)?;
        return Ok(Some(true));
    }

    match spool.status(spool.in_dir(), name)? {
        Some(Status::Ok { warnings }) => {
            // searched and not found
            for warning in warnings {
                tracing::warn!("{warning}");
            }
            spool.clear_status(spool.in_dir(), name)?;
            Ok(Some(false))
        }
        Some(Status::Error { code, message, .. }) => {
            spool.clear_status(spool.in_dir(), name)?;
            Err(Error::FileRead(format!(
                "async archive-get failed with code {code}: {message}"
            )))
        }
        None => Ok(None),
    }
}

/// The async prefetch worker: stage the requested segment and its successors
/// into the spool, `process_max` fetches in flight.
pub async fn get_async(ctx: Arc<Context>, spool: &Spool, current: &WalSegment) -> Result<()> {
    spool.sweep_temp()?;

    let (segment_size, version) = archive_geometry(&ctx).await?;
    let need = super::queue::queue_need(
        current,
        false,
        ctx.config.archive_get_queue_max,
        segment_size,
        version,
        spool,
    )?;
    if need.is_empty() {
        return Ok(());
    }

    tracing::info!(
        "prefetching {} WAL segment(s) starting at {current}",
        need.len()
    );

    let mut jobs = FuturesOrdered::new();
    let mut iter = need.into_iter();
    loop {
        let added = match iter.next() {
            Some(segment) => {
                let ctx = Arc::clone(&ctx);
                jobs.push_back(async move {
                    let name = segment.to_string();
                    let result = fetch_wal_file(&ctx, &name).await;
                    (name, result)
                });
                true
            }
            None => false,
        };

        if !added || jobs.len() >= ctx.config.process_max {
            match jobs.next().await {
                Some((name, result)) => stage_outcome(spool, &name, result)?,
                None => break,
            }
        }
    }

    Ok(())
}

/// Record one prefetch outcome in the spool.
fn stage_outcome(spool: &Spool, name: &str, result: Result<Found>) -> Result<()> {
    match result {
        Ok(Found::Yes { bytes, warnings }) => {
            let staged = spool.staged(name);
            crashsafe::overwrite_file(&staged, "pgvault.tmp", &bytes)
                .map_err(|e| Error::FileWrite(format!("'{staged}': {e}")))?;
            spool.write_status(spool.in_dir(), name, &Status::Ok { warnings })
        }
        Ok(Found::No { warnings }) => {
            // an .ok with no staged file means "searched, missing"
            spool.write_status(spool.in_dir(), name, &Status::Ok { warnings })
        }
        Err(e) => spool.write_status(
            spool.in_dir(),
            name,
            &Status::Error {
                code: e.code(),
                message: e.to_string(),
                warnings: Vec::new(),
            },
        ),
    }
}

/// Segment size and version from the first repository that has archive.info.
async fn archive_geometry(ctx: &Context) -> Result<(usize, pg_wal::PgVersion)> {
    let mut last_err = None;
    for (repo, storage) in ctx.repos() {
        match load::<ArchiveInfo>(
            storage,
            &super::archive_info_path(&ctx.config.stanza),
            &ctx.cancel,
        )
        .await
        {
            Ok(Some(info)) => {
                let current = info.current()?;
                return Ok((current.wal_segment_size, current.version));
            }
            Ok(None) => {
                last_err = Some(Error::RepoInvalid(format!(
                    "repo{}: archive.info is missing -- has 'stanza-create' been run?",
                    repo.index
                )))
            }
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| Error::OptionRequired("repo1-path".into())))
}

//! Archive push: moving closed WAL segments into the repositories.
//!
//! Sync mode pushes the one file the database named and reports through the
//! exit code. Async mode decouples the database from upload latency: the
//! foreground call only checks (or seeds) spool status files while a
//! detached worker drains `archive_status/*.ready` through the worker pool.

use std::sync::Arc;

use camino::Utf8Path;
use futures::stream::FuturesOrdered;
use futures::StreamExt;
use pg_wal::{WalFileKind, WalSegmentHeader};
use repo_storage::filter::FilterPipeline;
use repo_storage::GenericRepoStorage;
use utils::error_retry::ErrorRetry;

use super::spool::{Spool, Status};
use crate::config::RepoConfig;
use crate::errors::{Error, Result};
use crate::info::{load, ArchiveInfo};
use crate::Context;

/// Outcome of pushing one WAL file to every repository.
#[derive(Debug, Default)]
pub struct PushOutcome {
    pub warnings: Vec<String>,
}

/// Push one WAL file (segment, partial, history) to every configured
/// repository. Any repository failure is fatal; the database will retry the
/// whole file.
pub async fn push_file(ctx: &Context, wal_file: &Utf8Path) -> Result<PushOutcome> {
    let name = wal_file
        .file_name()
        .ok_or_else(|| Error::ParamInvalid(format!("'{wal_file}' has no file name")))?;
    let kind = WalFileKind::from_name(name).map_err(|e| Error::Format(format!("{e:#}")))?;

    let bytes = tokio::fs::read(wal_file)
        .await
        .map_err(|e| Error::FileOpen(format!("unable to read WAL file '{wal_file}': {e}")))?;

    let mut outcome = PushOutcome::default();
    for (repo, storage) in ctx.repos() {
        let mut retry = ErrorRetry::new();
        let mut attempt = 0;
        loop {
            match push_to_repo(ctx, repo, storage, &kind, name, &bytes).await {
                Ok(Some(warning)) => {
                    outcome.warnings.push(warning);
                    break;
                }
                Ok(None) => break,
                Err(e) => {
                    retry.add(Some(e.kind_name()), Some(&e.to_string()));
                    if attempt >= ctx.config.job_retry || !e.is_retryable() {
                        // a single attempt keeps the original error; after
                        // retries the aggregated history replaces the message
                        return Err(if retry.attempts() == 1 {
                            e
                        } else {
                            Error::FileWrite(retry.message())
                        });
                    }
                    attempt += 1;
                    tokio::time::sleep(ctx.config.job_retry_interval).await;
                }
            }
        }
        if retry.attempts() > 0 {
            tracing::warn!(
                "repo{}: WAL file {name} pushed: {}",
                repo.index,
                retry.success_message()
            );
        }
    }

    tracing::info!("pushed WAL file {name} to {} repo(s)", ctx.config.repos.len());
    Ok(outcome)
}

/// Push to a single repository; `Ok(Some(_))` is a success with a warning.
async fn push_to_repo(
    ctx: &Context,
    repo: &RepoConfig,
    storage: &GenericRepoStorage,
    kind: &WalFileKind,
    name: &str,
    bytes: &[u8],
) -> Result<Option<String>> {
    let stanza = &ctx.config.stanza;
    let info: ArchiveInfo = load(storage, &super::archive_info_path(stanza), &ctx.cancel)
        .await?
        .ok_or_else(|| {
            Error::RepoInvalid(format!(
                "repo{}: archive.info is missing -- has 'stanza-create' been run?",
                repo.index
            ))
        })?;
    let current = info.current()?.clone();

    // Header check proves the segment belongs to this stanza's cluster.
    if ctx.config.archive_header_check {
        if let Some(segment) = kind.segment() {
            let header = WalSegmentHeader::parse(bytes)
                .map_err(|e| Error::Format(format!("WAL segment {segment}: {e:#}")))?;
            header
                .check(current.version, current.system_id, current.wal_segment_size)
                .map_err(|e| Error::ArchiveMismatch(format!("repo{}: {e:#}", repo.index)))?;
        }
    }

    // Run the filter stack up front; the tap hash names the object.
    let (filters, tap) = super::write_filters(repo);
    let mut pipeline = FilterPipeline::new(filters);
    let filtered = pipeline
        .process(bytes)
        .map_err(|e| Error::Format(format!("filter WAL file {name}: {e:#}")))?;
    let sha1 = tap.sha1().expect("pipeline flush finalizes the tap");

    let target = match kind {
        WalFileKind::Segment(segment) => {
            // Duplicate policy: same content is an idempotent success with a
            // warning, different content is a hard error.
            if let Some(existing) =
                super::wal_segment_find(storage, stanza, &current.archive_id, segment, &ctx.cancel)
                    .await?
            {
                let existing_hash = existing
                    .split('-')
                    .nth(1)
                    .map(|h| h.split('.').next().unwrap_or(h))
                    .unwrap_or_default();
                if existing_hash == sha1 {
                    return Ok(Some(format!(
                        "WAL file '{name}' already exists in the repo{} archive with the same \
                         checksum\nHINT: this is valid in some recovery scenarios but may also \
                         indicate a problem.",
                        repo.index
                    )));
                }
                return Err(Error::ArchiveDuplicate(format!(
                    "WAL file '{name}' already exists in the repo{} archive with a different \
                     checksum",
                    repo.index
                )));
            }
            super::wal_segment_path(
                stanza,
                &current.archive_id,
                segment,
                &sha1,
                repo.compress_type.extension(),
            )
        }
        WalFileKind::Partial(segment) => {
            let mut partial_name = format!("{segment}.partial-{sha1}");
            if let Some(ext) = repo.compress_type.extension() {
                partial_name.push('.');
                partial_name.push_str(ext);
            }
            super::wal_log_path(stanza, &current.archive_id, segment).join(partial_name)
        }
        // History files keep their name and skip content addressing so the
        // database can fetch them without a listing.
        WalFileKind::History | WalFileKind::BackupHistory => {
            super::wal_history_path(stanza, &current.archive_id, name)
        }
    };

    storage
        .write_bytes(&target, bytes::Bytes::from(filtered), &ctx.cancel)
        .await
        .map_err(|e| Error::FileWrite(format!("repo{}: '{target}': {e:#}", repo.index)))?;

    Ok(None)
}

/// Ready-file names (without the `.ready` extension) in ascending order.
pub fn ready_list(wal_dir: &Utf8Path) -> Result<Vec<String>> {
    let status_dir = wal_dir.join("archive_status");
    let mut ready = Vec::new();
    let entries = std::fs::read_dir(&status_dir)
        .map_err(|e| Error::PathMissing(format!("'{status_dir}': {e}")))?;
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if let Some(stem) = name.strip_suffix(".ready") {
            ready.push(stem.to_string());
        }
    }
    ready.sort();
    Ok(ready)
}

/// The async worker: drain the ready list through `process_max` parallel
/// pushes, writing an `.ok`/`.error` per segment. Returns how many files
/// were processed.
pub async fn push_async(ctx: Arc<Context>, spool: &Spool) -> Result<u64> {
    spool.sweep_temp()?;
    spool.clear_global_error()?;

    let version = archive_version(&ctx).await?;
    let wal_dir = ctx.config.wal_dir(version);
    let mut processed = 0u64;

    loop {
        if ctx.cancel.is_cancelled() {
            return Err(Error::Command("archive-push worker cancelled".into()));
        }

        // Skip files a prior run already resolved.
        let mut pending = Vec::new();
        for name in ready_list(&wal_dir)? {
            if spool.status(spool.out_dir(), &name)?.is_none() {
                pending.push(name);
            }
        }
        if pending.is_empty() {
            return Ok(processed);
        }

        tracing::info!("pushing {} ready WAL file(s) asynchronously", pending.len());

        // Order is preserved so the WAL stream advances monotonically even
        // though uploads run in parallel.
        let mut jobs = FuturesOrdered::new();
        let mut iter = pending.into_iter();
        loop {
            let added = match iter.next() {
                Some(name) => {
                    let ctx = Arc::clone(&ctx);
                    let wal_path = wal_dir.join(&name);
                    jobs.push_back(async move {
                        let result = push_file(&ctx, &wal_path).await;
                        (name, result)
                    });
                    true
                }
                None => false,
            };

            if !added || jobs.len() >= ctx.config.process_max {
                match jobs.next().await {
                    Some((name, result)) => {
                        let status = match result {
                            Ok(outcome) => {
                                for warning in &outcome.warnings {
                                    tracing::warn!("{warning}");
                                }
                                Status::Ok {
                                    warnings: outcome.warnings,
                                }
                            }
                            Err(e) => {
                                tracing::warn!("unable to push WAL file {name}: {e}");
                                Status::Error {
                                    code: e.code(),
                                    message: e.to_string(),
                                    warnings: Vec::new(),
                                }
                            }
                        };
                        spool.write_status(spool.out_dir(), &name, &status)?;
                        processed += 1;
                    }
                    None => break,
                }
            }
        }
    }
}

/// Version recorded in the first reachable repository's archive.info; the
/// async worker needs it only to locate the WAL directory.
async fn archive_version(ctx: &Context) -> Result<pg_wal::PgVersion> {
    let mut last_err = None;
    for (repo, storage) in ctx.repos() {
        match load::<ArchiveInfo>(
            storage,
            &super::archive_info_path(&ctx.config.stanza),
            &ctx.cancel,
        )
        .await
        {
            Ok(Some(info)) => return Ok(info.current()?.version),
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

/// Foreground queue-full policy: when the ready backlog exceeds
/// `archive-push-queue-max`, drop this segment with a loud warning instead
/// of blocking the database.
pub fn drop_on_queue_full(
    config_queue_max: Option<u64>,
    ready: &[String],
    segment_size: usize,
) -> bool {
    let Some(queue_max) = config_queue_max else {
        return false;
    };
    let queued = ready.len() as u64 * segment_size as u64;
    queued > queue_max
}

/// The warning recorded in a synthetic `.ok` for a dropped segment.
pub fn drop_warning(name: &str, queue_max: u64) -> String {
    format!(
        "dropped WAL file '{name}' because archive queue exceeded {queue_max} bytes\n\
         HINT: the WAL archive stream is now incomplete; take a new full backup."
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_full_policy() {
        let ready: Vec<String> = (0..3).map(|i| format!("seg{i}")).collect();
        let seg = 16 * 1024 * 1024usize;

        // no limit configured: never drop
        assert!(!drop_on_queue_full(None, &ready, seg));
        // 3 segments of 16MiB against a 16MiB limit: drop
        assert!(drop_on_queue_full(Some(16 * 1024 * 1024), &ready, seg));
        // generous limit: keep
        assert!(!drop_on_queue_full(Some(64 * 1024 * 1024), &ready, seg));
        // zero limit means always drop once anything is queued
        assert!(drop_on_queue_full(Some(0), &ready, seg));
        assert!(!drop_on_queue_full(Some(0), &[], seg));
    }

    #[test]
    fn drop_warning_names_the_file() {
        let warning = drop_warning("000000010000000100000002", 16 * 1024 * 1024);
        assert!(warning.contains("dropped WAL file '000000010000000100000002'"));
        assert!(warning.contains("incomplete"));
    }
}

//! The copy scheduler: per-file transfer jobs, largest file first.
//!
//! Sorting by size balances tail latency across the worker pool: a huge
//! relation segment dispatched last would leave every other worker idle
//! behind it.

use camino::Utf8PathBuf;
use repo_storage::filter::FilterPipeline;
use utils::error_retry::ErrorRetry;
use utils::lsn::Lsn;

use super::block_incr::{self, BlockIncrMap};
use super::page_verify::{is_relation_file, PageCheckResult, PageVerifier};
use crate::errors::{Error, Result};
use crate::Context;

/// One file to copy into the repositories.
#[derive(Debug, Clone)]
pub struct CopyJob {
    /// Manifest key, e.g. `pg_data/base/16384/2619`.
    pub manifest_path: String,
    /// Path relative to the cluster root, for relation detection.
    pub cluster_path: String,
    /// Absolute source path on disk.
    pub source: Utf8PathBuf,
    pub size: u64,
    /// Prior block map when the file is stored block-incrementally.
    pub prior_blocks: Option<BlockIncrMap>,
}

/// Result of one copy job.
#[derive(Debug)]
pub struct CopyResult {
    pub manifest_path: String,
    /// SHA-1 of the raw content.
    pub checksum: Option<String>,
    pub size: u64,
    /// Stored size on the first repository, after filters.
    pub repo_size: u64,
    pub page_check: Option<PageCheckResult>,
    pub block_incr: Option<BlockIncrMap>,
    /// Repositories the file landed on.
    pub copied_repos: Vec<usize>,
    /// Per-repository warnings (failed repos when at least one succeeded).
    pub warnings: Vec<String>,
}

/// Order jobs for dispatch: largest first, then path for determinism.
pub fn plan(mut jobs: Vec<CopyJob>) -> Vec<CopyJob> {
    jobs.sort_by(|a, b| {
        b.size
            .cmp(&a.size)
            .then_with(|| a.manifest_path.cmp(&b.manifest_path))
    });
    jobs
}

/// Copy one file to every repository, with per-job retry. Failures on a
/// subset of repositories degrade to warnings as long as one repository
/// holds the file.
pub async fn copy_file(
    ctx: &Context,
    label: &str,
    backup_start_lsn: Lsn,
    page_size: usize,
    job: &CopyJob,
) -> Result<CopyResult> {
    // One read serves every repository. The file may legitimately shrink or
    // grow while the cluster runs; what we read is what the backup records.
    let content = tokio::fs::read(&job.source)
        .await
        .map_err(|e| Error::FileOpen(format!("unable to read '{}': {e}", job.source)))?;

    // Page verification runs on the raw bytes, once.
    let page_check = if is_relation_file(&job.cluster_path) {
        let mut verifier = PageVerifier::new(page_size, backup_start_lsn);
        verifier.update(&content)?;
        Some(verifier.finish())
    } else {
        None
    };

    // Block-incremental delta against the prior map, when present.
    let (block_incr, delta) = match &job.prior_blocks {
        Some(prior) => {
            let (map, delta) = block_incr::block_delta(&content, prior, prior.block_size);
            (Some(map), Some(delta))
        }
        None => (None, None),
    };
    let payload: &[u8] = delta.as_deref().unwrap_or(&content);

    let mut checksum = None;
    let mut repo_size = 0u64;
    let mut copied_repos = Vec::new();
    let mut warnings = Vec::new();

    for (repo, storage) in ctx.repos() {
        let mut retry = ErrorRetry::new();
        let mut attempt = 0;
        let outcome = loop {
            let result: Result<(String, u64)> = async {
                let (filters, tap) = crate::archive::write_filters(repo);
                let mut pipeline = FilterPipeline::new(filters);
                let stored = pipeline
                    .process(payload)
                    .map_err(|e| Error::Format(format!("filter '{}': {e:#}", job.manifest_path)))?;

                let object_name = match repo.compress_type.extension() {
                    Some(ext) => format!("{}.{ext}", job.manifest_path),
                    None => job.manifest_path.clone(),
                };
                let object = crate::archive::backup_path(&ctx.config.stanza)
                    .join(label)
                    .join(object_name);

                storage
                    .write_bytes(&object, bytes::Bytes::from(stored.clone()), &ctx.cancel)
                    .await
                    .map_err(|e| {
                        Error::FileWrite(format!("repo{}: '{object}': {e:#}", repo.index))
                    })?;

                Ok((
                    tap.sha1().expect("pipeline flush finalizes the tap"),
                    stored.len() as u64,
                ))
            }
            .await;

            match result {
                Ok(ok) => break Ok(ok),
                Err(e) => {
                    retry.add(Some(e.kind_name()), Some(&e.to_string()));
                    if attempt >= ctx.config.job_retry || !e.is_retryable() {
                        break Err(e);
                    }
                    attempt += 1;
                    tokio::time::sleep(ctx.config.job_retry_interval).await;
                }
            }
        };

        match outcome {
            Ok((payload_sha1, stored_size)) => {
                if copied_repos.is_empty() {
                    repo_size = stored_size;
                }
                // the payload hash is the content hash unless we stored a
                // block delta; the content hash then comes from the map
                checksum.get_or_insert(payload_sha1);
                copied_repos.push(repo.index);
            }
            Err(_) => {
                warnings.push(format!(
                    "repo{}: unable to copy '{}': {}",
                    repo.index,
                    job.manifest_path,
                    retry.message()
                ));
            }
        }
    }

    if copied_repos.is_empty() {
        return Err(Error::FileWrite(format!(
            "unable to copy '{}' to any repository:\n{}",
            job.manifest_path,
            warnings.join("\n")
        )));
    }

    // For whole-file storage the raw content hash is what the tap saw. For
    // block deltas, hash the raw content directly.
    let checksum = if block_incr.is_some() || checksum.is_none() {
        use sha1::{Digest, Sha1};
        let mut hasher = Sha1::new();
        hasher.update(&content);
        Some(hex::encode(hasher.finalize()))
    } else {
        checksum
    };

    Ok(CopyResult {
        manifest_path: job.manifest_path.clone(),
        checksum: if content.is_empty() { None } else { checksum },
        size: content.len() as u64,
        repo_size,
        page_check,
        block_incr,
        copied_repos,
        warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(path: &str, size: u64) -> CopyJob {
        CopyJob {
            manifest_path: format!("pg_data/{path}"),
            cluster_path: path.to_string(),
            source: Utf8PathBuf::from(format!("/pg/{path}")),
            size,
            prior_blocks: None,
        }
    }

    #[test]
    fn largest_first_then_path() {
        let planned = plan(vec![
            job("small", 10),
            job("big", 1 << 30),
            job("b-equal", 100),
            job("a-equal", 100),
        ]);
        let order: Vec<&str> = planned.iter().map(|j| j.cluster_path.as_str()).collect();
        assert_eq!(order, vec!["big", "a-equal", "b-equal", "small"]);
    }
}

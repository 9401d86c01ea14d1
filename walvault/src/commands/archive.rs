//! Foreground archive-push and archive-get, including the async handoff.
//!
//! The foreground invocations are what the database's `archive_command` and
//! `restore_command` run; they must return quickly and communicate only
//! through exit codes. The async workers are separate detached invocations
//! of this binary coordinating through the spool and the stanza archive
//! lock.

use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{info, warn};
use utils::lock::{lock_acquire, LockFamily};

use crate::archive::push::{drop_on_queue_full, drop_warning, push_async, push_file, ready_list};
use crate::archive::spool::{Spool, Status};
use crate::archive::{get, queue};
use crate::errors::{Error, Result, EXIT_NOT_FOUND, EXIT_NO_WAL, EXIT_OK};
use crate::Context;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// archive-push foreground.
pub async fn archive_push(ctx: &Arc<Context>, wal_path: &str) -> Result<i32> {
    ctx.config.require_repos()?;
    let wal_file = resolve_pg_relative(&ctx.config.pg_path, wal_path);
    let name = wal_file
        .file_name()
        .ok_or_else(|| Error::ParamInvalid(format!("'{wal_path}' has no file name")))?
        .to_string();

    if !ctx.config.archive_async {
        let outcome = push_file(ctx, &wal_file).await?;
        for warning in outcome.warnings {
            warn!("{warning}");
        }
        return Ok(EXIT_OK);
    }

    let spool = Spool::new(&ctx.config.spool_path, &ctx.config.stanza)?;

    // A status from a prior async run settles this call immediately.
    if let Some(code) = consume_push_status(&spool, &name)? {
        return Ok(code);
    }

    // Queue-full drop happens in the foreground so the database is never
    // blocked behind a backlog the workers cannot clear.
    let wal_dir = wal_file
        .parent()
        .map(Utf8Path::to_path_buf)
        .unwrap_or_else(|| ctx.config.pg_path.clone());
    if let Ok(ready) = ready_list(&wal_dir) {
        let seg_size = 16 * 1024 * 1024; // checked against archive.info by the worker
        if drop_on_queue_full(ctx.config.archive_push_queue_max, &ready, seg_size) {
            let queue_max = ctx.config.archive_push_queue_max.expect("checked in drop");
            let warning = drop_warning(&name, queue_max);
            warn!("{warning}");
            spool.write_status(
                spool.out_dir(),
                &name,
                &Status::Ok {
                    warnings: vec![warning],
                },
            )?;
            return Ok(EXIT_OK);
        }
    }

    ensure_async_worker(ctx, &["archive-push-async".to_string()])?;

    // Wait for the worker to settle our segment.
    let deadline = Instant::now() + ctx.config.archive_timeout;
    loop {
        if let Some(code) = consume_push_status(&spool, &name)? {
            return Ok(code);
        }
        if let Some(Status::Error { code, message, .. }) = spool.global_error()? {
            spool.clear_global_error()?;
            return Err(Error::FileWrite(format!(
                "async archive-push failed globally with code {code}: {message}"
            )));
        }
        if Instant::now() >= deadline {
            return Err(Error::ArchiveTimeout(format!(
                "WAL file '{name}' was not pushed within {:?}\n\
                 HINT: check the asynchronous archiving process.",
                ctx.config.archive_timeout
            )));
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

fn consume_push_status(spool: &Spool, name: &str) -> Result<Option<i32>> {
    match spool.status(spool.out_dir(), name)? {
        Some(Status::Ok { warnings }) => {
            for warning in warnings {
                warn!("{warning}");
            }
            spool.clear_status(spool.out_dir(), name)?;
            Ok(Some(EXIT_OK))
        }
        Some(Status::Error { code, message, .. }) => {
            spool.clear_status(spool.out_dir(), name)?;
            tracing::error!("async archive-push of '{name}' failed: {message}");
            Ok(Some(code))
        }
        None => Ok(None),
    }
}

/// The detached archive-push worker invocation.
pub async fn archive_push_async(ctx: &Arc<Context>) -> Result<i32> {
    let lock = lock_acquire(
        &ctx.config.lock_path,
        &ctx.config.stanza,
        LockFamily::Archive,
        &ctx.config.exec_id,
    )?;
    let spool = Spool::new(&ctx.config.spool_path, &ctx.config.stanza)?;

    let result = push_async(Arc::clone(ctx), &spool).await;
    match &result {
        Ok(0) => {
            info!("no WAL files ready to push");
            lock.unlock();
            return Ok(EXIT_NO_WAL);
        }
        Ok(count) => info!("async push processed {count} WAL file(s)"),
        Err(e) => {
            // dying without a per-segment verdict must still leave a reason
            // for the foreground to find
            spool.write_global_error(e.code(), &e.to_string())?;
        }
    }
    lock.unlock();
    result.map(|_| EXIT_OK)
}

/// archive-get foreground: deliver `wal_name` to `destination`.
pub async fn archive_get(ctx: &Arc<Context>, wal_name: &str, destination: &str) -> Result<i32> {
    ctx.config.require_repos()?;
    let destination = resolve_pg_relative(&ctx.config.pg_path, destination);

    if !ctx.config.archive_async {
        return Ok(if get::get_file(ctx, wal_name, &destination).await? {
            EXIT_OK
        } else {
            EXIT_NOT_FOUND
        });
    }

    let spool = Spool::new(&ctx.config.spool_path, &ctx.config.stanza)?;

    // Prefetch hit: serve from the spool and keep the queue warm.
    if let Some(found) = get::serve_from_spool(&spool, wal_name, &destination)? {
        if found && queue::prefetch_enabled(ctx.config.archive_get_queue_max) {
            ensure_async_worker(
                ctx,
                &["archive-get-async".to_string(), wal_name.to_string()],
            )?;
        }
        return Ok(if found { EXIT_OK } else { EXIT_NOT_FOUND });
    }

    ensure_async_worker(
        ctx,
        &["archive-get-async".to_string(), wal_name.to_string()],
    )?;

    let deadline = Instant::now() + ctx.config.archive_timeout;
    loop {
        if let Some(found) = get::serve_from_spool(&spool, wal_name, &destination)? {
            return Ok(if found { EXIT_OK } else { EXIT_NOT_FOUND });
        }
        if Instant::now() >= deadline {
            return Err(Error::ArchiveTimeout(format!(
                "WAL segment '{wal_name}' was not delivered within {:?}",
                ctx.config.archive_timeout
            )));
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// The detached archive-get prefetch invocation.
pub async fn archive_get_async(ctx: &Arc<Context>, wal_name: &str) -> Result<i32> {
    let _lock = lock_acquire(
        &ctx.config.lock_path,
        &ctx.config.stanza,
        LockFamily::Archive,
        &ctx.config.exec_id,
    )?;
    let spool = Spool::new(&ctx.config.spool_path, &ctx.config.stanza)?;

    let segment = wal_name
        .parse()
        .map_err(|e| Error::Format(format!("{e:#}")))?;
    get::get_async(Arc::clone(ctx), &spool, &segment).await?;
    Ok(EXIT_OK)
}

/// Launch a detached async invocation of this binary, unless the archive
/// lock shows one is already running.
fn ensure_async_worker(ctx: &Context, args: &[String]) -> Result<()> {
    // Probe the lock; a holder means a worker is live and will see our
    // segment. Dropping the probe releases it before the spawn below.
    match lock_acquire(
        &ctx.config.lock_path,
        &ctx.config.stanza,
        LockFamily::Archive,
        // a probe must not alias the worker's own re-entrant id
        &format!("{}-probe", ctx.config.exec_id),
    ) {
        Ok(probe) => probe.unlock(),
        Err(_) => return Ok(()), // a worker holds the lock
    }

    let exe = std::env::current_exe()
        .map_err(|e| Error::Execute(format!("unable to find own binary: {e}")))?;
    let mut command = std::process::Command::new(exe);
    command
        .args(args)
        .arg(format!("--stanza={}", ctx.config.stanza))
        .arg(format!("--pg-path={}", ctx.config.pg_path))
        .arg(format!("--spool-path={}", ctx.config.spool_path))
        .arg(format!("--lock-path={}", ctx.config.lock_path))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    if let Ok(config) = std::env::var("PGVAULT_CONFIG") {
        command.arg(format!("--config={config}"));
    }

    command
        .spawn()
        .map_err(|e| Error::Execute(format!("unable to spawn async worker: {e}")))?;
    Ok(())
}

fn resolve_pg_relative(pg_path: &Utf8Path, path: &str) -> Utf8PathBuf {
    let path = Utf8Path::new(path);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        pg_path.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pg_relative_paths() {
        let pg = Utf8Path::new("/pg/data");
        assert_eq!(
            resolve_pg_relative(pg, "pg_wal/000000010000000100000001"),
            Utf8PathBuf::from("/pg/data/pg_wal/000000010000000100000001")
        );
        assert_eq!(
            resolve_pg_relative(pg, "/tmp/out"),
            Utf8PathBuf::from("/tmp/out")
        );
    }
}

//! The verb layer: binds resolved configuration to engine operations and
//! maps outcomes to exit codes.

pub mod admin;
pub mod archive;

use std::sync::Arc;

use utils::lock::{lock_acquire, Lock, LockFamily};

use crate::backup::label::BackupType;
use crate::db::{discover_primary, DbClient, PgClient};
use crate::errors::{Error, Result, EXIT_OK};
use crate::restore::RestoreOptions;
use crate::Context;

/// Take the stanza lock for a mutating command family.
pub fn command_lock(ctx: &Context, family: LockFamily) -> Result<Lock> {
    Ok(lock_acquire(
        &ctx.config.lock_path,
        &ctx.config.stanza,
        family,
        &ctx.config.exec_id,
    )?)
}

pub async fn backup(ctx: &Arc<Context>, backup_type: BackupType) -> Result<i32> {
    let _lock = command_lock(ctx, LockFamily::Backup)?;
    let db = discover_primary(&ctx.config).await?;
    let outcome = crate::backup::run_backup(ctx, &db, None, backup_type).await?;
    for warning in &outcome.warnings {
        tracing::warn!("{warning}");
    }
    Ok(EXIT_OK)
}

pub async fn restore(ctx: &Arc<Context>, options: &RestoreOptions) -> Result<i32> {
    let _lock = command_lock(ctx, LockFamily::Restore)?;
    crate::restore::run_restore(ctx, options).await?;
    Ok(EXIT_OK)
}

pub async fn stanza_create(ctx: &Arc<Context>) -> Result<i32> {
    let _lock = command_lock(ctx, LockFamily::Stanza)?;
    let db = connect_db(ctx).await?;
    crate::stanza::create(ctx, db.as_ref()).await?;
    Ok(EXIT_OK)
}

pub async fn stanza_upgrade(ctx: &Arc<Context>) -> Result<i32> {
    let _lock = command_lock(ctx, LockFamily::Stanza)?;
    let db = connect_db(ctx).await?;
    crate::stanza::upgrade(ctx, db.as_ref()).await?;
    Ok(EXIT_OK)
}

pub async fn stanza_delete(ctx: &Arc<Context>) -> Result<i32> {
    let _lock = command_lock(ctx, LockFamily::Stanza)?;
    crate::stanza::delete(ctx).await?;
    Ok(EXIT_OK)
}

async fn connect_db(ctx: &Context) -> Result<Box<dyn DbClient>> {
    Ok(Box::new(PgClient::connect(&ctx.config).await?))
}

/// Serve the worker protocol on stdio; used by local spawn, ssh, and TLS
/// front ends.
pub async fn worker(ctx: &Arc<Context>) -> Result<i32> {
    let channel = crate::protocol::Channel::new(tokio::io::stdin(), tokio::io::stdout());
    let handler = crate::protocol::worker::EngineHandler::new(Arc::clone(ctx));
    crate::protocol::worker::serve(channel, handler).await?;
    Ok(EXIT_OK)
}

/// Map an engine error to the process exit code.
pub fn exit_code(error: &Error) -> i32 {
    error.code()
}

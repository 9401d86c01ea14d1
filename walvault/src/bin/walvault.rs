//! walvault command-line entry point.

use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use tracing::error;

use walvault::backup::label::BackupType;
use walvault::commands;
use walvault::config::{Config, GlobalOpts};
use walvault::restore::filter::RestoreSelector;
use walvault::restore::{resolver, RestoreOptions};
use walvault::Context;

#[derive(Parser)]
#[command(
    name = "walvault",
    version,
    about = "Reliable backup and restore for PostgreSQL clusters"
)]
struct Cli {
    #[command(flatten)]
    global: GlobalOpts,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Push a WAL file to the repositories (archive_command).
    ArchivePush {
        /// Path of the WAL file, as passed by the database (%p).
        wal_path: String,
        /// Decouple the database from upload latency via the spool.
        #[arg(long)]
        archive_async: bool,
        /// Validate the segment header against the stanza.
        #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
        archive_header_check: bool,
    },
    /// Detached asynchronous push worker (internal).
    #[command(hide = true)]
    ArchivePushAsync,
    /// Fetch a WAL file from the repositories (restore_command).
    ArchiveGet {
        /// WAL file name, as passed by the database (%f).
        wal_name: String,
        /// Destination path (%p).
        destination: String,
        #[arg(long)]
        archive_async: bool,
    },
    /// Detached asynchronous prefetch worker (internal).
    #[command(hide = true)]
    ArchiveGetAsync { wal_name: String },
    /// Back up the cluster.
    Backup {
        #[arg(long = "type", default_value = "incr")]
        backup_type: BackupType,
        /// Force an immediate checkpoint at start.
        #[arg(long)]
        start_fast: bool,
        /// Copy files from a standby while the primary holds the backup.
        #[arg(long)]
        backup_standby: bool,
    },
    /// Restore the cluster to a recovery target.
    Restore {
        #[arg(long = "type", default_value = "default")]
        target_type: String,
        #[arg(long)]
        target: Option<String>,
        #[arg(long)]
        target_timeline: Option<String>,
        #[arg(long)]
        target_action: Option<String>,
        /// Restore this backup set instead of the resolver's choice.
        #[arg(long)]
        set: Option<String>,
        /// Reuse files that already match in the destination.
        #[arg(long)]
        delta: bool,
        /// Selective restore tuple file.
        #[arg(long)]
        filter: Option<Utf8PathBuf>,
        /// Configure the restored cluster as a standby.
        #[arg(long)]
        standby: bool,
        #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
        target_inclusive: bool,
    },
    /// Initialize the stanza on every repository.
    StanzaCreate,
    /// Re-register the stanza after a major version upgrade.
    StanzaUpgrade,
    /// Remove the stanza from every repository.
    StanzaDelete,
    /// Validate configuration, info files, and the archive round trip.
    Check,
    /// Report stanza state as JSON.
    Info,
    /// Verify backup objects against their manifests.
    Verify,
    /// Apply retention, removing expired backups and WAL.
    Expire,
    /// Serve the worker protocol on stdio (internal).
    #[command(hide = true)]
    Worker,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_format = cli.global.log_format.unwrap_or_default();
    if let Err(e) = utils::logging::init(log_format) {
        eprintln!("unable to initialize logging: {e:#}");
        return ExitCode::from(1);
    }

    match run(cli).await {
        Ok(code) => ExitCode::from(u8::try_from(code).unwrap_or(125)),
        Err(e) => {
            error!("[{}] {e}", e.kind_name());
            ExitCode::from(u8::try_from(commands::exit_code(&e)).unwrap_or(125))
        }
    }
}

async fn run(cli: Cli) -> walvault::errors::Result<i32> {
    let mut config = Config::resolve(&cli.global)?;

    // command-line toggles that override the file per invocation
    match &cli.command {
        Command::ArchivePush {
            archive_async,
            archive_header_check,
            ..
        } => {
            config.archive_async |= *archive_async;
            config.archive_header_check &= *archive_header_check;
        }
        Command::ArchiveGet { archive_async, .. } => config.archive_async |= *archive_async,
        Command::Backup {
            start_fast,
            backup_standby,
            ..
        } => {
            config.start_fast |= *start_fast;
            config.backup_standby |= *backup_standby;
        }
        _ => {}
    }

    let ctx = Context::new(config).await?;

    match cli.command {
        Command::ArchivePush { wal_path, .. } => {
            commands::archive::archive_push(&ctx, &wal_path).await
        }
        Command::ArchivePushAsync => commands::archive::archive_push_async(&ctx).await,
        Command::ArchiveGet {
            wal_name,
            destination,
            ..
        } => commands::archive::archive_get(&ctx, &wal_name, &destination).await,
        Command::ArchiveGetAsync { wal_name } => {
            commands::archive::archive_get_async(&ctx, &wal_name).await
        }
        Command::Backup { backup_type, .. } => commands::backup(&ctx, backup_type).await,
        Command::Restore {
            target_type,
            target,
            target_timeline,
            target_action,
            set,
            delta,
            filter,
            standby,
            target_inclusive,
        } => {
            let options = RestoreOptions {
                target: resolver::parse_target(
                    &target_type,
                    target.as_deref(),
                    target_inclusive,
                    target_timeline,
                )?,
                set: set
                    .as_deref()
                    .map(|s| s.parse::<walvault::backup::label::BackupLabel>())
                    .transpose()?,
                delta,
                selector: filter
                    .as_deref()
                    .map(RestoreSelector::from_file)
                    .transpose()?,
                target_action,
                standby,
            };
            commands::restore(&ctx, &options).await
        }
        Command::StanzaCreate => commands::stanza_create(&ctx).await,
        Command::StanzaUpgrade => commands::stanza_upgrade(&ctx).await,
        Command::StanzaDelete => commands::stanza_delete(&ctx).await,
        Command::Check => commands::admin::check(&ctx).await,
        Command::Info => commands::admin::stanza_info(&ctx).await,
        Command::Verify => commands::admin::verify(&ctx).await,
        Command::Expire => commands::admin::expire(&ctx).await,
        Command::Worker => commands::worker(&ctx).await,
    }
}

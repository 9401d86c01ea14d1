//! The database client: the handful of queries the backup engine issues.
//!
//! Everything version-dependent (SQL forms, exclusive vs non-exclusive
//! backup) is delegated to `pg_wal::version`; this module only speaks the
//! wire protocol and maps rows to engine types.

use std::time::Duration;

use async_trait::async_trait;
use pg_wal::PgVersion;
use tokio_postgres::NoTls;
use utils::lsn::Lsn;

use crate::config::Config;
use crate::errors::{Error, Result};

/// What stop-backup hands back. Label and tablespace map bytes exist only in
/// the non-exclusive forms.
#[derive(Debug, Clone)]
pub struct StopBackupResult {
    pub lsn: Lsn,
    pub wal_file: String,
    pub backup_label: Option<String>,
    pub tablespace_map: Option<String>,
}

/// The queries the engine needs from a cluster. The trait boundary exists so
/// tests can run the whole backup path against a fixture cluster.
#[async_trait]
pub trait DbClient: Send + Sync {
    async fn version(&self) -> Result<PgVersion>;
    async fn system_id(&self) -> Result<u64>;
    async fn is_in_recovery(&self) -> Result<bool>;
    async fn wal_segment_size(&self) -> Result<usize>;
    async fn checkpoint_timeout(&self) -> Result<Duration>;
    /// Returns the start LSN and the WAL file containing it.
    async fn start_backup(&self, label: &str, start_fast: bool) -> Result<(Lsn, String)>;
    async fn stop_backup(&self) -> Result<StopBackupResult>;
    /// Force the current segment closed; returns the switched-from file.
    async fn switch_wal(&self) -> Result<String>;
    /// Name of the last WAL segment the database reports as archived.
    async fn last_archived_wal(&self) -> Result<Option<String>>;
}

/// tokio-postgres implementation against a live cluster.
pub struct PgClient {
    client: tokio_postgres::Client,
    version: PgVersion,
}

impl PgClient {
    pub async fn connect(config: &Config) -> Result<PgClient> {
        let mut pg_config = tokio_postgres::Config::new();
        pg_config
            .host(config.pg_host.as_deref().unwrap_or("/var/run/postgresql"))
            .port(config.pg_port)
            .dbname(&config.pg_database)
            .connect_timeout(config.db_timeout);
        if let Some(user) = &config.pg_user {
            pg_config.user(user);
        }

        let (client, connection) = pg_config
            .connect(NoTls)
            .await
            .map_err(|e| Error::DbConnect(format!("unable to connect to PostgreSQL: {e}")))?;

        // The connection drives the socket; hold it on its own task. An
        // error there means the session died, which is fatal to the command.
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!("PostgreSQL connection error: {e}");
            }
        });

        let row = client
            .query_one("show server_version_num", &[])
            .await
            .map_err(map_query_err)?;
        let version_num: &str = row.get(0);
        let version = PgVersion(
            version_num
                .parse::<u32>()
                .map_err(|_| Error::Format(format!("server_version_num '{version_num}'")))?,
        );
        if !version.is_supported() {
            return Err(Error::DbMismatch(format!(
                "PostgreSQL version {version} is not supported"
            )));
        }

        Ok(PgClient { client, version })
    }
}

fn map_query_err(e: tokio_postgres::Error) -> Error {
    Error::DbConnect(format!("query failed: {e}"))
}

#[async_trait]
impl DbClient for PgClient {
    async fn version(&self) -> Result<PgVersion> {
        Ok(self.version)
    }

    async fn system_id(&self) -> Result<u64> {
        let row = self
            .client
            .query_one("select system_identifier from pg_control_system()", &[])
            .await
            .map_err(map_query_err)?;
        let id: i64 = row.get(0);
        Ok(id as u64)
    }

    async fn is_in_recovery(&self) -> Result<bool> {
        let row = self
            .client
            .query_one("select pg_is_in_recovery()", &[])
            .await
            .map_err(map_query_err)?;
        Ok(row.get(0))
    }

    async fn wal_segment_size(&self) -> Result<usize> {
        let row = self
            .client
            .query_one("select setting::int from pg_settings where name = 'wal_segment_size'", &[])
            .await
            .map_err(map_query_err)?;
        let size: i32 = row.get(0);
        Ok(size as usize)
    }

    async fn checkpoint_timeout(&self) -> Result<Duration> {
        let row = self
            .client
            .query_one(
                "select setting::int from pg_settings where name = 'checkpoint_timeout'",
                &[],
            )
            .await
            .map_err(map_query_err)?;
        let seconds: i32 = row.get(0);
        Ok(Duration::from_secs(seconds as u64))
    }

    async fn start_backup(&self, label: &str, start_fast: bool) -> Result<(Lsn, String)> {
        let sql = self.version.start_backup_sql(label, start_fast);
        let row = self
            .client
            .query_one(sql.as_str(), &[])
            .await
            .map_err(map_query_err)?;
        let lsn: &str = row.get(0);
        let wal_file: &str = row.get(1);
        Ok((
            lsn.parse()
                .map_err(|e| Error::Format(format!("start LSN '{lsn}': {e:#}")))?,
            wal_file.to_string(),
        ))
    }

    async fn stop_backup(&self) -> Result<StopBackupResult> {
        let sql = self.version.stop_backup_sql();
        let row = self.client.query_one(sql, &[]).await.map_err(map_query_err)?;
        let lsn: &str = row.get(0);
        let wal_file: &str = row.get(1);
        let backup_label: Option<&str> = row.get(2);
        let tablespace_map: Option<&str> = row.get(3);
        Ok(StopBackupResult {
            lsn: lsn
                .parse()
                .map_err(|e| Error::Format(format!("stop LSN '{lsn}': {e:#}")))?,
            wal_file: wal_file.to_string(),
            backup_label: backup_label.map(str::to_string),
            tablespace_map: tablespace_map
                .map(str::to_string)
                .filter(|m| !m.trim().is_empty()),
        })
    }

    async fn switch_wal(&self) -> Result<String> {
        let sql = self.version.switch_wal_sql();
        let row = self.client.query_one(sql, &[]).await.map_err(map_query_err)?;
        let wal_file: &str = row.get(0);
        Ok(wal_file.to_string())
    }

    async fn last_archived_wal(&self) -> Result<Option<String>> {
        let row = self
            .client
            .query_one("select last_archived_wal from pg_stat_archiver", &[])
            .await
            .map_err(map_query_err)?;
        let wal: Option<&str> = row.get(0);
        Ok(wal.map(str::to_string))
    }
}

/// Find the primary among the configured hosts. With one host configured
/// this checks it is not a standby, unless the backup explicitly targets a
/// standby.
pub async fn discover_primary(config: &Config) -> Result<PgClient> {
    let client = PgClient::connect(config).await?;
    if client.is_in_recovery().await? {
        return Err(Error::DbConnect(
            "the configured PostgreSQL host is a standby, a primary is required".into(),
        ));
    }
    Ok(client)
}

//! walvault: reliable backup and restore for PostgreSQL-style clusters.
//!
//! The engine archives WAL segments as the database closes them, takes
//! full/differential/incremental backups with page verification, and
//! restores cluster state to a recovery target, against any mix of
//! posix/S3/Azure/GCS/SFTP repositories.

pub mod archive;
pub mod backup;
pub mod commands;
pub mod config;
pub mod db;
pub mod errors;
pub mod info;
pub mod protocol;
pub mod restore;
pub mod stanza;

use std::sync::Arc;

use repo_storage::GenericRepoStorage;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, RepoConfig};
use crate::errors::{Error, Result};

/// Shared state of one command invocation: resolved config, one connected
/// storage per repository, and the cancellation token workers watch.
pub struct Context {
    pub config: Config,
    pub storages: Vec<GenericRepoStorage>,
    pub cancel: CancellationToken,
}

impl Context {
    pub async fn new(config: Config) -> Result<Arc<Context>> {
        let mut storages = Vec::with_capacity(config.repos.len());
        for repo in &config.repos {
            let storage = GenericRepoStorage::from_config(&repo.storage)
                .await
                .map_err(|e| Error::RepoInvalid(format!("repo{}: {e:#}", repo.index)))?;
            storages.push(storage);
        }
        Ok(Arc::new(Context {
            config,
            storages,
            cancel: CancellationToken::new(),
        }))
    }

    /// Repositories with their storages, in failover order.
    pub fn repos(&self) -> impl Iterator<Item = (&RepoConfig, &GenericRepoStorage)> {
        self.config.repos.iter().zip(self.storages.iter())
    }

    /// Look up a repository by its 1-based index. Indexes are stable even in
    /// a filtered context, so position and index may differ.
    pub fn repo(&self, index: usize) -> (&RepoConfig, &GenericRepoStorage) {
        let position = self
            .config
            .repos
            .iter()
            .position(|r| r.index == index)
            .unwrap_or_else(|| panic!("repo{index} is not part of this context"));
        (&self.config.repos[position], &self.storages[position])
    }

    /// A context restricted to the repositories whose indexes are in `keep`,
    /// e.g. after dropping repos that mismatch the cluster identity.
    pub fn filtered(&self, keep: &[usize]) -> Arc<Context> {
        let mut config = self.config.clone();
        let mut storages = Vec::new();
        let mut repos = Vec::new();
        for (repo, storage) in self.repos() {
            if keep.contains(&repo.index) {
                repos.push(repo.clone());
                storages.push(storage.clone());
            }
        }
        config.repos = repos;
        Arc::new(Context {
            config,
            storages,
            cancel: self.cancel.clone(),
        })
    }
}

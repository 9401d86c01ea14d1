//! Azure Blob Storage repository backend.
//!
//! Credentials come from `AZURE_STORAGE_ACCESS_KEY` in the environment.
//! Small writes go through `put_block_blob`, which is atomic; larger writes
//! stage blocks and commit them with a single `put_block_list`, so the blob
//! appears only once complete. Uncommitted blocks expire server-side.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use azure_storage::StorageCredentials;
use azure_storage_blobs::prelude::*;
use base64::Engine;
use bytes::Bytes;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::error::{Cancelled, WriteErrorKind};
use crate::{
    AzureConfig, Download, DownloadError, DownloadStream, ListEntry, ObjectInfo, ReadRange,
    RepoPath, REPO_PATH_SEPARATOR,
};

/// Writes above this stage blocks instead of a single put.
const BLOCK_THRESHOLD: usize = 64 * 1024 * 1024;
const BLOCK_SIZE: usize = 16 * 1024 * 1024;

pub struct AzureBlobStorage {
    client: ContainerClient,
    container: String,
    prefix_in_container: Option<String>,
    max_keys_per_list_response: Option<i32>,
    concurrency_limiter: Arc<tokio::sync::Semaphore>,
    timeout: Duration,
}

impl AzureBlobStorage {
    pub fn new(config: &AzureConfig, timeout: Duration) -> anyhow::Result<Self> {
        tracing::debug!(
            "Creating azure remote storage for container {}",
            config.container
        );

        let access_key = std::env::var("AZURE_STORAGE_ACCESS_KEY")
            .context("AZURE_STORAGE_ACCESS_KEY must be set for azure repositories")?;
        let credentials = StorageCredentials::access_key(config.account.clone(), access_key);

        let service = BlobServiceClient::new(config.account.clone(), credentials);
        let client = service.container_client(&config.container);

        let prefix_in_container = config.prefix_in_container.as_deref().map(|prefix| {
            prefix
                .trim_start_matches(REPO_PATH_SEPARATOR)
                .trim_end_matches(REPO_PATH_SEPARATOR)
                .to_string()
        });

        Ok(Self {
            client,
            container: config.container.clone(),
            prefix_in_container,
            max_keys_per_list_response: config.max_keys_per_list_response,
            concurrency_limiter: Arc::new(tokio::sync::Semaphore::new(
                config.concurrency_limit.get() as usize,
            )),
            timeout,
        })
    }

    pub fn container_name(&self) -> &str {
        &self.container
    }

    fn blob_name(&self, path: &RepoPath) -> String {
        match &self.prefix_in_container {
            Some(prefix) => format!("{prefix}/{}", path.get_path()),
            None => path.get_path().to_string(),
        }
    }

    fn relative_path(&self, blob_name: &str) -> RepoPath {
        let relative = match self.prefix_in_container.as_deref() {
            Some(prefix) => blob_name
                .strip_prefix(prefix)
                .expect("listed blob is always under the prefix")
                .trim_start_matches(REPO_PATH_SEPARATOR),
            None => blob_name,
        };
        RepoPath::from_string(relative).expect("blob names under the prefix are valid repo paths")
    }

    async fn permit(
        &self,
        cancel: &CancellationToken,
    ) -> Result<tokio::sync::OwnedSemaphorePermit, Cancelled> {
        let acquire = Arc::clone(&self.concurrency_limiter).acquire_owned();
        tokio::select! {
            permit = acquire => Ok(permit.expect("semaphore is never closed")),
            _ = cancel.cancelled() => Err(Cancelled),
        }
    }

    pub async fn info(
        &self,
        path: &RepoPath,
        cancel: &CancellationToken,
    ) -> anyhow::Result<ObjectInfo> {
        let _permit = self.permit(cancel).await?;
        let blob_client = self.client.blob_client(self.blob_name(path));

        let properties = tokio::select! {
            res = blob_client.get_properties().into_future() => res,
            _ = tokio::time::sleep(self.timeout) => anyhow::bail!("timed out heading blob '{path}'"),
            _ = cancel.cancelled() => return Err(Cancelled.into()),
        };

        match properties {
            Ok(response) => Ok(ObjectInfo::file(
                response.blob.properties.content_length,
                Some(std::time::SystemTime::from(
                    response.blob.properties.last_modified,
                )),
            )),
            Err(e) if is_azure_not_found(&e) => Ok(ObjectInfo::missing()),
            Err(e) => Err(anyhow::Error::new(e).context(format!("head blob '{path}'"))),
        }
    }

    pub async fn list(
        &self,
        prefix: Option<&RepoPath>,
        recurse: bool,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Vec<ListEntry>> {
        let _permit = self.permit(cancel).await?;

        let list_prefix = prefix
            .map(|p| self.blob_name(p))
            .or_else(|| self.prefix_in_container.clone())
            .map(|mut p| {
                if !p.ends_with(REPO_PATH_SEPARATOR) {
                    p.push(REPO_PATH_SEPARATOR);
                }
                p
            });

        let mut builder = self.client.list_blobs();
        if let Some(prefix) = list_prefix {
            builder = builder.prefix(prefix);
        }
        if !recurse {
            builder = builder.delimiter(REPO_PATH_SEPARATOR.to_string());
        }
        if let Some(max) = self.max_keys_per_list_response {
            builder = builder.max_results(std::num::NonZeroU32::new(max as u32).unwrap());
        }

        let mut result = Vec::new();
        let mut stream = builder.into_stream();
        loop {
            let page = tokio::select! {
                page = stream.next() => page,
                _ = tokio::time::sleep(self.timeout) => anyhow::bail!("timed out listing blobs"),
                _ = cancel.cancelled() => return Err(Cancelled.into()),
            };
            let Some(page) = page else { break };
            let page = page.context("Failed to list container blobs")?;

            for blob in page.blobs.blobs() {
                result.push(ListEntry {
                    path: self.relative_path(&blob.name),
                    info: ObjectInfo::file(
                        blob.properties.content_length,
                        Some(std::time::SystemTime::from(blob.properties.last_modified)),
                    ),
                });
            }
            for prefix in page.blobs.prefixes() {
                result.push(ListEntry {
                    path: self.relative_path(prefix.name.trim_end_matches(REPO_PATH_SEPARATOR)),
                    info: ObjectInfo {
                        kind: crate::ObjectKind::Path,
                        ..ObjectInfo::file(0, None)
                    },
                });
            }
        }

        Ok(result)
    }

    pub async fn read(
        &self,
        path: &RepoPath,
        range: Option<ReadRange>,
        cancel: &CancellationToken,
    ) -> Result<Download, DownloadError> {
        let _permit = self.permit(cancel).await?;
        let blob_client = self.client.blob_client(self.blob_name(path));

        let mut builder = blob_client.get();
        if let Some((offset, limit)) = range {
            let range = match limit {
                Some(limit) => offset..offset + limit,
                None => offset..u64::MAX,
            };
            builder = builder.range(range);
        }

        let mut stream = builder.into_stream();
        let mut chunks: Vec<Bytes> = Vec::new();
        let mut total: u64 = 0;

        // The response stream yields whole chunks; collect them under the
        // operation timeout and hand the result on as a stream.
        loop {
            let next = tokio::select! {
                next = stream.next() => next,
                _ = tokio::time::sleep(self.timeout) => return Err(DownloadError::Timeout),
                _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
            };
            let Some(response) = next else { break };
            let response = match response {
                Ok(r) => r,
                Err(e) if is_azure_not_found(&e) => return Err(DownloadError::NotFound),
                Err(e) => {
                    return Err(DownloadError::Other(
                        anyhow::Error::new(e).context("download azure blob"),
                    ))
                }
            };
            let data = response
                .data
                .collect()
                .await
                .map_err(|e| DownloadError::Other(anyhow::Error::new(e)))?;
            total += data.len() as u64;
            chunks.push(data);
        }

        Ok(Download {
            stream: Box::pin(futures::stream::iter(chunks.into_iter().map(Ok))),
            size: Some(total),
        })
    }

    pub async fn write(
        &self,
        path: &RepoPath,
        mut data: DownloadStream,
        _size_hint: Option<usize>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        let _permit = self.permit(cancel).await?;
        let blob_client = self.client.blob_client(self.blob_name(path));

        let mut head = Vec::new();
        let mut rest = None;
        while let Some(chunk) = data.next().await {
            head.extend_from_slice(&chunk.context("read upload stream")?);
            if head.len() >= BLOCK_THRESHOLD {
                rest = Some(data);
                break;
            }
        }

        let result = match rest {
            None => {
                let put = blob_client.put_block_blob(head).into_future();
                tokio::select! {
                    res = put => res.map(drop).context("upload azure blob"),
                    _ = tokio::time::sleep(self.timeout) => anyhow::bail!("timed out uploading '{path}'"),
                    _ = cancel.cancelled() => return Err(Cancelled.into()),
                }
            }
            Some(mut data) => {
                let mut blocks = Vec::new();
                let mut buffer = head;
                let mut input_done = false;
                let mut block_no = 0u32;

                loop {
                    while buffer.len() < BLOCK_SIZE && !input_done {
                        match data.next().await {
                            Some(chunk) => {
                                buffer.extend_from_slice(&chunk.context("read upload stream")?)
                            }
                            None => input_done = true,
                        }
                    }
                    if buffer.is_empty() && input_done {
                        break;
                    }

                    let take = buffer.len().min(BLOCK_SIZE);
                    let block: Vec<u8> = buffer.drain(..take).collect();
                    let block_id = base64::engine::general_purpose::STANDARD
                        .encode(format!("{block_no:08}"));

                    let put = blob_client
                        .put_block(block_id.clone(), block)
                        .into_future();
                    tokio::select! {
                        res = put => res.map(drop).with_context(|| format!("upload block {block_no}"))?,
                        _ = tokio::time::sleep(self.timeout) => anyhow::bail!("timed out uploading block {block_no} of '{path}'"),
                        _ = cancel.cancelled() => return Err(Cancelled.into()),
                    };

                    blocks.push(BlobBlockType::Uncommitted(block_id.into()));
                    block_no += 1;

                    if input_done && buffer.is_empty() {
                        break;
                    }
                }

                let commit = blob_client
                    .put_block_list(BlockList { blocks })
                    .into_future();
                tokio::select! {
                    res = commit => res.map(drop).context("commit azure block list"),
                    _ = tokio::time::sleep(self.timeout) => anyhow::bail!("timed out committing '{path}'"),
                    _ = cancel.cancelled() => return Err(Cancelled.into()),
                }
            }
        };

        result.map_err(|e| classify_azure_error(e, path))
    }

    pub async fn remove(&self, path: &RepoPath, cancel: &CancellationToken) -> anyhow::Result<()> {
        let _permit = self.permit(cancel).await?;
        let blob_client = self.client.blob_client(self.blob_name(path));

        let delete = blob_client.delete().into_future();
        tokio::select! {
            res = delete => res.map(drop).with_context(|| format!("delete blob '{path}'")),
            _ = tokio::time::sleep(self.timeout) => anyhow::bail!("timed out deleting '{path}'"),
            _ = cancel.cancelled() => Err(Cancelled.into()),
        }
    }

    pub async fn remove_prefix(
        &self,
        prefix: &RepoPath,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        let entries = self.list(Some(prefix), true, cancel).await?;
        for entry in entries {
            if entry.info.kind == crate::ObjectKind::File {
                self.remove(&entry.path, cancel).await?;
            }
        }
        Ok(())
    }
}

fn is_azure_not_found(e: &azure_core::Error) -> bool {
    matches!(
        e.kind(),
        azure_core::error::ErrorKind::HttpResponse {
            status: azure_core::StatusCode::NotFound,
            ..
        }
    )
}

fn classify_azure_error(e: anyhow::Error, path: &RepoPath) -> anyhow::Error {
    let msg = format!("{e:#}");
    let kind = if msg.contains("AuthenticationFailed") || msg.contains("AuthorizationFailure") {
        WriteErrorKind::Auth
    } else {
        WriteErrorKind::Transient
    };
    e.context(kind).context(format!("write azure blob '{path}'"))
}

//! Google Cloud Storage repository backend.
//!
//! Authentication follows the usual GCP chain (service-account file via
//! `GOOGLE_APPLICATION_CREDENTIALS`, metadata server on GCE). Uploads are a
//! single resumable-free media upload, which commits atomically.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use futures::StreamExt;
use google_cloud_storage::client::{Client, ClientConfig};
use google_cloud_storage::http::objects::delete::DeleteObjectRequest;
use google_cloud_storage::http::objects::download::Range;
use google_cloud_storage::http::objects::get::GetObjectRequest;
use google_cloud_storage::http::objects::list::ListObjectsRequest;
use google_cloud_storage::http::objects::upload::{Media, UploadObjectRequest, UploadType};
use tokio_util::sync::CancellationToken;

use crate::error::{Cancelled, WriteErrorKind};
use crate::{
    Download, DownloadError, DownloadStream, GcsConfig, ListEntry, ObjectInfo, ReadRange,
    RepoPath, REPO_PATH_SEPARATOR,
};

pub struct GcsBucket {
    client: Client,
    bucket_name: String,
    prefix_in_bucket: Option<String>,
    concurrency_limiter: Arc<tokio::sync::Semaphore>,
    timeout: Duration,
}

impl GcsBucket {
    pub async fn new(config: &GcsConfig, timeout: Duration) -> anyhow::Result<Self> {
        tracing::debug!(
            "Creating gcs remote storage for bucket {}",
            config.bucket_name
        );

        let client_config = ClientConfig::default()
            .with_auth()
            .await
            .context("acquire gcs credentials")?;
        let client = Client::new(client_config);

        let prefix_in_bucket = config.prefix_in_bucket.as_deref().map(|prefix| {
            prefix
                .trim_start_matches(REPO_PATH_SEPARATOR)
                .trim_end_matches(REPO_PATH_SEPARATOR)
                .to_string()
        });

        Ok(Self {
            client,
            bucket_name: config.bucket_name.clone(),
            prefix_in_bucket,
            concurrency_limiter: Arc::new(tokio::sync::Semaphore::new(
                config.concurrency_limit.get() as usize,
            )),
            timeout,
        })
    }

    pub fn bucket_name(&self) -> &str {
        &self.bucket_name
    }

    fn object_name(&self, path: &RepoPath) -> String {
        match &self.prefix_in_bucket {
            Some(prefix) => format!("{prefix}/{}", path.get_path()),
            None => path.get_path().to_string(),
        }
    }

    fn relative_path(&self, object_name: &str) -> RepoPath {
        let relative = match self.prefix_in_bucket.as_deref() {
            Some(prefix) => object_name
                .strip_prefix(prefix)
                .expect("listed object is always under the prefix")
                .trim_start_matches(REPO_PATH_SEPARATOR),
            None => object_name,
        };
        RepoPath::from_string(relative).expect("object names under the prefix are valid repo paths")
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

        let request = GetObjectRequest {
            bucket: self.bucket_name.clone(),
            object: self.object_name(path),
            ..Default::default()
        };

        let get = self.client.get_object(&request);
        let res = tokio::select! {
            res = get => res,
            _ = tokio::time::sleep(self.timeout) => anyhow::bail!("timed out heading object '{path}'"),
            _ = cancel.cancelled() => return Err(Cancelled.into()),
        };

        match res {
            Ok(object) => Ok(ObjectInfo::file(object.size as u64, None)),
            Err(e) if is_gcs_not_found(&e) => Ok(ObjectInfo::missing()),
            Err(e) => Err(anyhow::Error::new(e).context(format!("head gcs object '{path}'"))),
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
            .map(|p| self.object_name(p))
            .or_else(|| self.prefix_in_bucket.clone())
            .map(|mut p| {
                if !p.ends_with(REPO_PATH_SEPARATOR) {
                    p.push(REPO_PATH_SEPARATOR);
                }
                p
            });

        let mut result = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let request = ListObjectsRequest {
                bucket: self.bucket_name.clone(),
                prefix: list_prefix.clone(),
                page_token: page_token.take(),
                delimiter: (!recurse).then(|| REPO_PATH_SEPARATOR.to_string()),
                ..Default::default()
            };

            let list = self.client.list_objects(&request);
            let response = tokio::select! {
                res = list => res,
                _ = tokio::time::sleep(self.timeout) => anyhow::bail!("timed out listing gcs objects"),
                _ = cancel.cancelled() => return Err(Cancelled.into()),
            }
            .context("Failed to list gcs objects")?;

            for object in response.items.unwrap_or_default() {
                result.push(ListEntry {
                    path: self.relative_path(&object.name),
                    info: ObjectInfo::file(object.size as u64, None),
                });
            }
            for prefix in response.prefixes.unwrap_or_default() {
                result.push(ListEntry {
                    path: self.relative_path(prefix.trim_end_matches(REPO_PATH_SEPARATOR)),
                    info: ObjectInfo {
                        kind: crate::ObjectKind::Path,
                        ..ObjectInfo::file(0, None)
                    },
                });
            }

            page_token = response.next_page_token;
            if page_token.is_none() {
                break;
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

        let request = GetObjectRequest {
            bucket: self.bucket_name.clone(),
            object: self.object_name(path),
            ..Default::default()
        };

        let range = match range {
            Some((offset, Some(limit))) => Range(Some(offset), Some(offset + limit - 1)),
            Some((offset, None)) => Range(Some(offset), None),
            None => Range(None, None),
        };

        let download = self.client.download_object(&request, &range);
        let data = tokio::select! {
            res = download => res,
            _ = tokio::time::sleep(self.timeout) => return Err(DownloadError::Timeout),
            _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
        };

        match data {
            Ok(data) => {
                let size = data.len() as u64;
                Ok(Download {
                    stream: crate::stream_from_bytes(Bytes::from(data)),
                    size: Some(size),
                })
            }
            Err(e) if is_gcs_not_found(&e) => Err(DownloadError::NotFound),
            Err(e) => Err(DownloadError::Other(
                anyhow::Error::new(e).context("download gcs object"),
            )),
        }
    }

    pub async fn write(
        &self,
        path: &RepoPath,
        mut data: DownloadStream,
        size_hint: Option<usize>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        let _permit = self.permit(cancel).await?;

        // One media upload per object; GCS commits it atomically.
        let mut body = Vec::with_capacity(size_hint.unwrap_or(0));
        while let Some(chunk) = data.next().await {
            body.extend_from_slice(&chunk.context("read upload stream")?);
        }

        let request = UploadObjectRequest {
            bucket: self.bucket_name.clone(),
            ..Default::default()
        };
        let media = Media::new(self.object_name(path));
        let upload_type = UploadType::Simple(media);

        let upload = self.client.upload_object(&request, body, &upload_type);
        let res = tokio::select! {
            res = upload => res,
            _ = tokio::time::sleep(self.timeout) => anyhow::bail!("timed out uploading '{path}'"),
            _ = cancel.cancelled() => return Err(Cancelled.into()),
        };

        res.map(drop)
            .map_err(|e| classify_gcs_error(anyhow::Error::new(e), path))
    }

    pub async fn remove(&self, path: &RepoPath, cancel: &CancellationToken) -> anyhow::Result<()> {
        let _permit = self.permit(cancel).await?;

        let request = DeleteObjectRequest {
            bucket: self.bucket_name.clone(),
            object: self.object_name(path),
            ..Default::default()
        };

        let delete = self.client.delete_object(&request);
        tokio::select! {
            res = delete => res.map(drop).with_context(|| format!("delete gcs object '{path}'")),
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

fn is_gcs_not_found(e: &google_cloud_storage::http::Error) -> bool {
    matches!(e, google_cloud_storage::http::Error::Response(resp) if resp.code == 404)
}

fn classify_gcs_error(e: anyhow::Error, path: &RepoPath) -> anyhow::Error {
    let msg = format!("{e:#}");
    let kind = if msg.contains("401") || msg.contains("403") || msg.contains("invalid_grant") {
        WriteErrorKind::Auth
    } else {
        WriteErrorKind::Transient
    };
    e.context(kind).context(format!("write gcs object '{path}'"))
}

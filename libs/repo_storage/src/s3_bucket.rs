//! AWS S3 repository backend.
//!
//! Respects `prefix_in_bucket` from [`S3Config`], so several stanzas can
//! share one bucket under different prefixes. Writes below the multipart
//! threshold are a single `PutObject` (atomic by definition); larger writes
//! stream through a multipart upload with a best-effort abort on failure.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use anyhow::Context;
use aws_config::{
    environment::credentials::EnvironmentVariableCredentialsProvider,
    imds::credentials::ImdsCredentialsProvider, meta::credentials::CredentialsProviderChain,
    profile::ProfileFileCredentialsProvider, provider_config::ProviderConfig,
    retry::{RetryConfigBuilder, RetryMode}, web_identity_token::WebIdentityTokenCredentialsProvider,
    BehaviorVersion,
};
use aws_credential_types::provider::SharedCredentialsProvider;
use aws_sdk_s3::{
    config::{AsyncSleep, Builder, IdentityCache, Region, SharedAsyncSleep},
    error::SdkError,
    operation::get_object::GetObjectError,
    operation::head_object::HeadObjectError,
    types::{CompletedMultipartUpload, CompletedPart, Delete, ObjectIdentifier, StorageClass},
    Client,
};
use aws_smithy_async::rt::sleep::TokioSleep;
use aws_smithy_types::byte_stream::ByteStream;
use bytes::Bytes;
use futures::stream::Stream;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::error::{Cancelled, WriteErrorKind};
use crate::{
    Download, DownloadError, DownloadStream, ListEntry, ObjectInfo, ReadRange, RepoPath, S3Config,
    WriteOptions, REPO_PATH_SEPARATOR,
};

/// Keys per DeleteObjects request, the S3 API limit.
const MAX_KEYS_PER_DELETE: usize = 1000;

/// Writes above this stream through a multipart upload.
const MULTIPART_THRESHOLD: usize = 64 * 1024 * 1024;
/// Part size of multipart uploads.
const MULTIPART_PART_SIZE: usize = 16 * 1024 * 1024;

pub struct S3Bucket {
    client: Client,
    bucket_name: String,
    prefix_in_bucket: Option<String>,
    max_keys_per_list_response: Option<i32>,
    upload_storage_class: Option<String>,
    concurrency_limiter: Arc<tokio::sync::Semaphore>,
    timeout: Duration,
}

impl S3Bucket {
    /// Creates the S3 storage, errors if incorrect AWS S3 configuration provided.
    pub fn new(config: &S3Config, timeout: Duration) -> anyhow::Result<Self> {
        tracing::debug!(
            "Creating s3 repository storage for S3 bucket {}",
            config.bucket_name
        );

        let region = Some(Region::new(config.bucket_region.clone()));

        let provider_conf = ProviderConfig::without_region().with_region(region.clone());

        let credentials_provider = {
            // uses "AWS_ACCESS_KEY_ID", "AWS_SECRET_ACCESS_KEY"
            CredentialsProviderChain::first_try(
                "env",
                EnvironmentVariableCredentialsProvider::new(),
            )
            // uses "AWS_PROFILE" / `aws sso login --profile <profile>`
            .or_else(
                "profile-sso",
                ProfileFileCredentialsProvider::builder()
                    .configure(&provider_conf)
                    .build(),
            )
            // uses "AWS_WEB_IDENTITY_TOKEN_FILE", "AWS_ROLE_ARN", "AWS_ROLE_SESSION_NAME"
            .or_else(
                "token",
                WebIdentityTokenCredentialsProvider::builder()
                    .configure(&provider_conf)
                    .build(),
            )
            // uses imds v2
            .or_else("imds", ImdsCredentialsProvider::builder().build())
        };

        // AWS SDK requires us to specify how the RetryConfig should sleep when it wants to back off
        let sleep_impl: Arc<dyn AsyncSleep> = Arc::new(TokioSleep::new());

        // Retries are driven by our own backoff layer. The SDK retry config is
        // still set to Adaptive with one attempt so that rate limiting kicks
        // in on throttling responses.
        let mut retry_config = RetryConfigBuilder::new();
        retry_config
            .set_max_attempts(Some(1))
            .set_mode(Some(RetryMode::Adaptive));

        let mut config_builder = Builder::default()
            .behavior_version(BehaviorVersion::v2023_11_09())
            .region(region)
            .identity_cache(IdentityCache::lazy().build())
            .credentials_provider(SharedCredentialsProvider::new(credentials_provider))
            .retry_config(retry_config.build())
            .sleep_impl(SharedAsyncSleep::from(sleep_impl));

        if let Some(custom_endpoint) = config.endpoint.clone() {
            config_builder = config_builder
                .endpoint_url(custom_endpoint)
                .force_path_style(true);
        }

        let client = Client::from_conf(config_builder.build());

        let prefix_in_bucket = config.prefix_in_bucket.as_deref().map(|prefix| {
            prefix
                .trim_start_matches(REPO_PATH_SEPARATOR)
                .trim_end_matches(REPO_PATH_SEPARATOR)
                .to_string()
        });

        Ok(Self {
            client,
            bucket_name: config.bucket_name.clone(),
            max_keys_per_list_response: config.max_keys_per_list_response,
            upload_storage_class: config.upload_storage_class.clone(),
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

    fn s3_object_to_relative_path(&self, key: &str) -> RepoPath {
        let relative_path = match key.strip_prefix(self.prefix_in_bucket.as_deref().unwrap_or_default())
        {
            Some(stripped) => stripped.trim_start_matches(REPO_PATH_SEPARATOR),
            // we rely on AWS to return properly prefixed paths
            // for requests with a certain prefix
            None => panic!(
                "Key {} does not start with bucket prefix {:?}",
                key, self.prefix_in_bucket
            ),
        };
        RepoPath::from_string(relative_path).expect("keys under the prefix are valid repo paths")
    }

    fn relative_path_to_s3_object(&self, path: &RepoPath) -> String {
        let path_string = path.get_path().as_str();
        match &self.prefix_in_bucket {
            Some(prefix) => format!("{prefix}/{path_string}"),
            None => path_string.to_string(),
        }
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

        let head = self
            .client
            .head_object()
            .bucket(self.bucket_name.clone())
            .key(self.relative_path_to_s3_object(path))
            .send();

        let head = tokio::select! {
            res = head => res,
            _ = tokio::time::sleep(self.timeout) => anyhow::bail!("timed out heading object '{path}'"),
            _ = cancel.cancelled() => return Err(Cancelled.into()),
        };

        match head {
            Ok(output) => Ok(ObjectInfo::file(
                output.content_length().unwrap_or_default() as u64,
                output.last_modified.and_then(|t| t.try_into().ok()),
            )),
            Err(SdkError::ServiceError(e)) if matches!(e.err(), HeadObjectError::NotFound(_)) => {
                Ok(ObjectInfo::missing())
            }
            Err(e) => Err(anyhow::Error::new(e).context(format!("head s3 object '{path}'"))),
        }
    }

    pub async fn list(
        &self,
        prefix: Option<&RepoPath>,
        recurse: bool,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Vec<ListEntry>> {
        let _permit = self.permit(cancel).await?;

        // a trailing separator, otherwise the response is the prefix entry itself
        let list_prefix = prefix
            .map(|p| self.relative_path_to_s3_object(p))
            .or_else(|| self.prefix_in_bucket.clone())
            .map(|mut p| {
                if !p.ends_with(REPO_PATH_SEPARATOR) {
                    p.push(REPO_PATH_SEPARATOR);
                }
                p
            });

        let mut result = Vec::new();
        let mut continuation_token = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(self.bucket_name.clone())
                .set_prefix(list_prefix.clone())
                .set_continuation_token(continuation_token)
                .set_max_keys(self.max_keys_per_list_response);

            if !recurse {
                request = request.delimiter(REPO_PATH_SEPARATOR.to_string());
            }

            let request = request.send();

            let response = tokio::select! {
                res = request => res,
                _ = tokio::time::sleep(self.timeout) => anyhow::bail!("timed out listing prefix {list_prefix:?}"),
                _ = cancel.cancelled() => return Err(Cancelled.into()),
            }
            .context("Failed to list S3 prefixes")?;

            for object in response.contents() {
                let key = object.key().expect("response does not contain a key");
                result.push(ListEntry {
                    path: self.s3_object_to_relative_path(key),
                    info: ObjectInfo::file(
                        object.size().unwrap_or_default() as u64,
                        object.last_modified.and_then(|t| t.try_into().ok()),
                    ),
                });
            }

            // common prefixes stand in for sub-paths on a flat keyspace
            for common in response.common_prefixes() {
                if let Some(prefix) = common.prefix() {
                    let path =
                        self.s3_object_to_relative_path(prefix.trim_end_matches(REPO_PATH_SEPARATOR));
                    result.push(ListEntry {
                        path,
                        info: ObjectInfo {
                            kind: crate::ObjectKind::Path,
                            ..ObjectInfo::file(0, None)
                        },
                    });
                }
            }

            continuation_token = match response.next_continuation_token {
                Some(new_token) => Some(new_token),
                None => break,
            };
        }

        Ok(result)
    }

    pub async fn read(
        &self,
        path: &RepoPath,
        range: Option<ReadRange>,
        cancel: &CancellationToken,
    ) -> Result<Download, DownloadError> {
        let permit = self.permit(cancel).await?;

        let range_header = range.map(|(offset, limit)| match limit {
            Some(limit) => format!("bytes={}-{}", offset, offset + limit - 1),
            None => format!("bytes={offset}-"),
        });

        let get_object = self
            .client
            .get_object()
            .bucket(self.bucket_name.clone())
            .key(self.relative_path_to_s3_object(path))
            .set_range(range_header)
            .send();

        let get_object = tokio::select! {
            res = get_object => res,
            _ = tokio::time::sleep(self.timeout) => return Err(DownloadError::Timeout),
            _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
        };

        let object_output = match get_object {
            Ok(object_output) => object_output,
            Err(SdkError::ServiceError(e)) if matches!(e.err(), GetObjectError::NoSuchKey(_)) => {
                // 404 is not an error here: probing for objects that may not
                // exist is part of normal operation.
                return Err(DownloadError::NotFound);
            }
            Err(e) => {
                return Err(DownloadError::Other(
                    anyhow::Error::new(e).context("download s3 object"),
                ));
            }
        };

        let size = object_output.content_length().map(|l| l as u64);
        let body = ByteStreamAsStream::from(object_output.body);
        let body = PermitCarrying::new(permit, body);

        Ok(Download {
            stream: Box::pin(body),
            size,
        })
    }

    pub async fn write(
        &self,
        path: &RepoPath,
        mut data: DownloadStream,
        _size_hint: Option<usize>,
        _opts: &WriteOptions,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        let _permit = self.permit(cancel).await?;
        let key = self.relative_path_to_s3_object(path);

        // The content length is only known after the filter stack has run, so
        // buffer up to the multipart threshold and pick the upload shape then.
        let mut head = Vec::new();
        let mut rest = None;
        while let Some(chunk) = data.next().await {
            let chunk = chunk.context("read upload stream")?;
            head.extend_from_slice(&chunk);
            if head.len() >= MULTIPART_THRESHOLD {
                rest = Some(data);
                break;
            }
        }

        match rest {
            None => self.put_whole_object(&key, head, cancel).await,
            Some(data) => self.put_multipart(&key, head, data, cancel).await,
        }
        .map_err(|e| classify_sdk_error(e, path))
    }

    async fn put_whole_object(
        &self,
        key: &str,
        body: Vec<u8>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        let put = self
            .client
            .put_object()
            .bucket(self.bucket_name.clone())
            .key(key)
            .set_storage_class(self.upload_storage_class.as_deref().map(StorageClass::from))
            .body(ByteStream::from(body))
            .send();

        let res = tokio::select! {
            res = put => res,
            _ = tokio::time::sleep(self.timeout) => anyhow::bail!("timed out uploading '{key}'"),
            _ = cancel.cancelled() => return Err(Cancelled.into()),
        };

        res.map(drop).context("upload s3 object")
    }

    async fn put_multipart(
        &self,
        key: &str,
        head: Vec<u8>,
        mut data: DownloadStream,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        let created = self
            .client
            .create_multipart_upload()
            .bucket(self.bucket_name.clone())
            .key(key)
            .set_storage_class(self.upload_storage_class.as_deref().map(StorageClass::from))
            .send()
            .await
            .context("create multipart upload")?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| anyhow::anyhow!("multipart upload has no id"))?
            .to_string();

        let result = self
            .put_multipart_parts(key, &upload_id, head, &mut data, cancel)
            .await;

        if result.is_err() {
            // Leaving the upload open would hold storage forever; abort is
            // best effort and failure only logs.
            if let Err(abort_err) = self
                .client
                .abort_multipart_upload()
                .bucket(self.bucket_name.clone())
                .key(key)
                .upload_id(&upload_id)
                .send()
                .await
            {
                tracing::warn!("failed to abort multipart upload of '{key}': {abort_err}");
            }
        }

        result
    }

    async fn put_multipart_parts(
        &self,
        key: &str,
        upload_id: &str,
        head: Vec<u8>,
        data: &mut DownloadStream,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        let mut parts = Vec::new();
        let mut part_number = 1i32;
        let mut buffer = head;
        let mut input_done = false;

        loop {
            while buffer.len() < MULTIPART_PART_SIZE && !input_done {
                match data.next().await {
                    Some(chunk) => buffer.extend_from_slice(&chunk.context("read upload stream")?),
                    None => input_done = true,
                }
            }
            if buffer.is_empty() && input_done {
                break;
            }

            let take = buffer.len().min(MULTIPART_PART_SIZE);
            let part: Vec<u8> = buffer.drain(..take).collect();

            let upload = self
                .client
                .upload_part()
                .bucket(self.bucket_name.clone())
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(part))
                .send();

            let uploaded = tokio::select! {
                res = upload => res,
                _ = tokio::time::sleep(self.timeout) => anyhow::bail!("timed out uploading part {part_number} of '{key}'"),
                _ = cancel.cancelled() => return Err(Cancelled.into()),
            }
            .with_context(|| format!("upload part {part_number}"))?;

            parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .set_e_tag(uploaded.e_tag)
                    .build(),
            );
            part_number += 1;

            if input_done && buffer.is_empty() {
                break;
            }
        }

        self.client
            .complete_multipart_upload()
            .bucket(self.bucket_name.clone())
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .context("complete multipart upload")?;

        Ok(())
    }

    pub async fn remove(&self, path: &RepoPath, cancel: &CancellationToken) -> anyhow::Result<()> {
        let _permit = self.permit(cancel).await?;

        let delete = self
            .client
            .delete_object()
            .bucket(self.bucket_name.clone())
            .key(self.relative_path_to_s3_object(path))
            .send();

        let res = tokio::select! {
            res = delete => res,
            _ = tokio::time::sleep(self.timeout) => anyhow::bail!("timed out deleting '{path}'"),
            _ = cancel.cancelled() => return Err(Cancelled.into()),
        };

        res.map(drop).context("delete s3 object")
    }

    pub async fn remove_prefix(
        &self,
        prefix: &RepoPath,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        let entries = self.list(Some(prefix), true, cancel).await?;
        let oids = entries
            .iter()
            .map(|e| {
                ObjectIdentifier::builder()
                    .key(self.relative_path_to_s3_object(&e.path))
                    .build()
                    .context("build delete object id")
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        let _permit = self.permit(cancel).await?;
        for chunk in oids.chunks(MAX_KEYS_PER_DELETE) {
            let req = self
                .client
                .delete_objects()
                .bucket(self.bucket_name.clone())
                .delete(
                    Delete::builder()
                        .set_objects(Some(chunk.to_vec()))
                        .build()
                        .context("build request")?,
                )
                .send();

            let resp = tokio::select! {
                resp = req => resp,
                _ = tokio::time::sleep(self.timeout) => anyhow::bail!("timed out deleting prefix '{prefix}'"),
                _ = cancel.cancelled() => return Err(Cancelled.into()),
            };

            let resp = resp.context("request deletion")?;
            if let Some(errors) = resp.errors {
                const LOG_UP_TO_N_ERRORS: usize = 10;
                for e in errors.iter().take(LOG_UP_TO_N_ERRORS) {
                    tracing::warn!(
                        "DeleteObjects key {:?} failed: {:?}: {:?}",
                        e.key,
                        e.code,
                        e.message,
                    );
                }
                anyhow::bail!("Failed to delete {}/{} objects", errors.len(), chunk.len());
            }
        }
        Ok(())
    }
}

/// Attach a [`WriteErrorKind`] to an error so retry layers can classify it
/// without string matching.
fn classify_sdk_error(e: anyhow::Error, path: &RepoPath) -> anyhow::Error {
    let msg = format!("{e:#}");
    let kind = if msg.contains("AccessDenied")
        || msg.contains("InvalidAccessKeyId")
        || msg.contains("SignatureDoesNotMatch")
    {
        WriteErrorKind::Auth
    } else {
        WriteErrorKind::Transient
    };
    e.context(kind).context(format!("write s3 object '{path}'"))
}

pin_project_lite::pin_project! {
    struct ByteStreamAsStream {
        #[pin]
        inner: aws_smithy_types::byte_stream::ByteStream
    }
}

impl From<aws_smithy_types::byte_stream::ByteStream> for ByteStreamAsStream {
    fn from(inner: aws_smithy_types::byte_stream::ByteStream) -> Self {
        ByteStreamAsStream { inner }
    }
}

impl Stream for ByteStreamAsStream {
    type Item = std::io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        // this does the std::io::ErrorKind::Other conversion
        self.project().inner.poll_next(cx).map_err(|x| x.into())
    }
}

pin_project_lite::pin_project! {
    /// Keeps a concurrency permit alive for as long as the download stream
    /// is being consumed.
    struct PermitCarrying<S> {
        permit: tokio::sync::OwnedSemaphorePermit,
        #[pin]
        inner: S,
    }
}

impl<S> PermitCarrying<S> {
    fn new(permit: tokio::sync::OwnedSemaphorePermit, inner: S) -> Self {
        Self { permit, inner }
    }
}

impl<S: Stream<Item = std::io::Result<Bytes>>> Stream for PermitCarrying<S> {
    type Item = <S as Stream>::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        self.project().inner.poll_next(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::num::NonZeroU32;

    fn bucket(prefix: Option<&str>) -> S3Bucket {
        S3Bucket::new(
            &S3Config {
                bucket_name: "wal-bucket".to_string(),
                bucket_region: "us-east-1".to_string(),
                prefix_in_bucket: prefix.map(str::to_string),
                endpoint: None,
                concurrency_limit: NonZeroU32::new(10).unwrap(),
                max_keys_per_list_response: None,
                upload_storage_class: None,
            },
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn object_keys_carry_the_bucket_prefix() {
        let bucket = bucket(Some("/stanza/main/"));
        let path = RepoPath::from_string("archive/16-1/seg").unwrap();
        assert_eq!(
            bucket.relative_path_to_s3_object(&path),
            "stanza/main/archive/16-1/seg"
        );
        assert_eq!(
            bucket.s3_object_to_relative_path("stanza/main/archive/16-1/seg"),
            path
        );
    }

    #[test]
    fn no_prefix_roundtrip() {
        let bucket = bucket(None);
        let path = RepoPath::from_string("backup/main/manifest").unwrap();
        assert_eq!(
            bucket.relative_path_to_s3_object(&path),
            "backup/main/manifest"
        );
        assert_eq!(
            bucket.s3_object_to_relative_path("backup/main/manifest"),
            path
        );
    }
}

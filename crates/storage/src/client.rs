//! Retrying client over a [`Backend`].

use std::sync::Arc;

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::backend::{Backend, ObjectReader};
use crate::retry::retry;
use crate::{BackendError, RetryConfig, StoreError};

/// Object-store client with bounded retries and cancellation.
///
/// Cheap to clone; clones share the backend.
#[derive(Clone)]
pub struct StoreClient {
    backend: Arc<dyn Backend>,
    retry: RetryConfig,
}

impl StoreClient {
    /// Creates a client over `backend`.
    pub fn new(backend: Arc<dyn Backend>, retry: RetryConfig) -> Self {
        Self { backend, retry }
    }

    /// Returns the retry policy.
    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    /// Uploads `body` to `bucket/key`, retrying on any error.
    pub async fn upload(
        &self,
        cancel: &CancellationToken,
        bucket: &str,
        key: &str,
        body: Bytes,
    ) -> Result<(), StoreError> {
        let backend = self.backend.as_ref();
        let size = body.len();
        retry(&self.retry, cancel, "upload", key, move || {
            backend.upload(bucket, key, body.clone())
        })
        .await?;
        debug!(bucket, key, size, "uploaded object");
        Ok(())
    }

    /// Opens `bucket/key` for streaming reads, retrying the open on any error.
    ///
    /// Errors while reading the returned stream are not retried.
    pub async fn download(
        &self,
        cancel: &CancellationToken,
        bucket: &str,
        key: &str,
    ) -> Result<ObjectReader, StoreError> {
        let backend = self.backend.as_ref();
        retry(&self.retry, cancel, "download", key, move || {
            backend.download(bucket, key)
        })
        .await
    }

    /// Downloads the whole object into memory; open and read form one attempt.
    pub async fn download_bytes(
        &self,
        cancel: &CancellationToken,
        bucket: &str,
        key: &str,
    ) -> Result<Bytes, StoreError> {
        let backend = self.backend.as_ref();
        let body = retry(&self.retry, cancel, "download", key, move || async move {
            let mut reader = backend.download(bucket, key).await?;
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf).await?;
            Ok::<_, BackendError>(Bytes::from(buf))
        })
        .await?;
        debug!(bucket, key, size = body.len(), "downloaded object");
        Ok(body)
    }

    /// Returns whether `bucket/key` exists. Not retried.
    pub async fn exists(
        &self,
        cancel: &CancellationToken,
        bucket: &str,
        key: &str,
    ) -> Result<bool, StoreError> {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(StoreError::Cancelled),
            r = self.backend.exists(bucket, key) => r,
        };
        match result {
            Ok(found) => Ok(found),
            Err(BackendError::NotFound(_)) => Ok(false),
            Err(source) => Err(StoreError::Exists {
                key: key.to_string(),
                source,
            }),
        }
    }
}

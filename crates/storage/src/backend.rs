//! Backend trait implemented by concrete object stores.

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use tokio::io::AsyncRead;

use crate::BackendError;

/// Boxed future returned by [`Backend`] methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Streaming body of a downloaded object.
pub type ObjectReader = Box<dyn AsyncRead + Send + Unpin>;

/// Minimal capability set of an object store.
///
/// Uploads take the whole body as [`Bytes`] so that a retry can replay it
/// without re-reading the source.
pub trait Backend: Send + Sync {
    /// Stores `body` under `bucket/key`, replacing any previous object.
    fn upload<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        body: Bytes,
    ) -> BoxFuture<'a, Result<(), BackendError>>;

    /// Opens `bucket/key` for streaming reads.
    fn download<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
    ) -> BoxFuture<'a, Result<ObjectReader, BackendError>>;

    /// Returns whether `bucket/key` exists.
    ///
    /// Implementations may report a missing key either as `Ok(false)` or as
    /// [`BackendError::NotFound`].
    fn exists<'a>(&'a self, bucket: &'a str, key: &'a str)
    -> BoxFuture<'a, Result<bool, BackendError>>;
}

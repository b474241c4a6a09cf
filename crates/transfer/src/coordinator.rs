//! Coordinator operations the transfer pipelines depend on.
//!
//! Implemented over HTTP by the client crate and by mocks in tests.

use std::future::Future;
use std::pin::Pin;

use nerd_protocol::{CreateDatasetResponse, Dataset, HeartbeatResponse};

use crate::TransferError;

/// Boxed future returned by [`Coordinator`] methods.
pub type CoordinatorFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, TransferError>> + Send + 'a>>;

/// Control-plane calls made during a transfer.
///
/// Implementations report their own failures as
/// [`TransferError::Coordinator`].
pub trait Coordinator: Send + Sync {
    /// Allocates a dataset and returns its descriptor and heartbeat interval.
    fn create_dataset<'a>(
        &'a self,
        project_id: &'a str,
        tag: Option<&'a str>,
    ) -> CoordinatorFuture<'a, CreateDatasetResponse>;

    /// Fetches the current descriptor of a dataset.
    fn describe_dataset<'a>(
        &'a self,
        project_id: &'a str,
        dataset_id: &'a str,
    ) -> CoordinatorFuture<'a, Dataset>;

    /// Extends the upload deadline of a dataset.
    fn send_upload_heartbeat<'a>(
        &'a self,
        project_id: &'a str,
        dataset_id: &'a str,
    ) -> CoordinatorFuture<'a, HeartbeatResponse>;

    /// Marks the upload as complete.
    fn send_upload_success<'a>(
        &'a self,
        project_id: &'a str,
        dataset_id: &'a str,
    ) -> CoordinatorFuture<'a, ()>;
}

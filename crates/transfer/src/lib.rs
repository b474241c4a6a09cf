//! Chunked, deduplicated dataset transfer.
//!
//! Upload: a directory is tar-streamed, split into content-defined chunks,
//! each chunk is stored once under its SHA-256 in the project root and the
//! ordered list of chunk keys is written as the dataset index. Download
//! reverses the process.

pub mod chunker;
pub mod coordinator;
pub mod download;
pub mod heartbeat;
pub mod index;
pub mod key;
pub mod metadata;
mod ordered;
pub mod pipe;
mod progress;
mod stages;
pub mod tar;
pub mod upload;
mod validation;

use std::io;

pub use chunker::Chunker;
pub use coordinator::Coordinator;
pub use download::{DownloadRequest, download, download_blocking};
pub use index::{IndexReader, IndexWriter};
pub use key::ChunkKey;
pub use metadata::{Metadata, decode_metadata, encode_metadata};
pub use upload::{UploadRequest, upload};
pub use validation::validate_entry_path;

/// Default number of chunks transferred concurrently.
pub const DEFAULT_CONCURRENCY: usize = 64;

/// Boxed error of a [`Coordinator`] implementation.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors produced by the transfer pipelines.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("cancelled")]
    Cancelled,

    #[error("broken pipe: {0}")]
    Pipe(String),

    #[error("chunker read failed: {0}")]
    Chunker(#[source] io::Error),

    #[error("object store: {0}")]
    Store(nerd_storage::StoreError),

    #[error("invalid index line {line:?}: {reason}")]
    Decode { line: String, reason: String },

    #[error("tar: {0}")]
    Tar(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("chunk {0} does not match its content address")]
    CorruptChunk(String),

    #[error("upload of dataset {0} expired before it completed")]
    HeartbeatExpired(String),

    #[error("heartbeat for dataset {dataset_id} failed: {source}")]
    HeartbeatFailed {
        dataset_id: String,
        #[source]
        source: Box<TransferError>,
    },

    #[error("dataset {0} has not finished uploading")]
    UploadNotFinished(String),

    #[error("upload of dataset {0} timed out")]
    UploadTimedOut(String),

    #[error("coordinator: {0}")]
    Coordinator(#[source] BoxError),

    #[error("I/O error: {0}")]
    Io(io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl TransferError {
    /// Wraps an error returned by a coordinator implementation.
    pub fn coordinator(err: impl Into<BoxError>) -> Self {
        Self::Coordinator(err.into())
    }

    /// Whether the upload was abandoned because its heartbeat lapsed,
    /// either reported by the coordinator or because the call failed.
    pub fn is_heartbeat_expired(&self) -> bool {
        matches!(
            self,
            Self::HeartbeatExpired(_) | Self::HeartbeatFailed { .. }
        )
    }

    /// Precedence when several stages fail: real errors, then
    /// cancellation, then broken pipes.
    pub(crate) fn rank(&self) -> u8 {
        match self {
            Self::Pipe(_) => 0,
            Self::Cancelled => 1,
            _ => 2,
        }
    }
}

impl From<nerd_storage::StoreError> for TransferError {
    fn from(err: nerd_storage::StoreError) -> Self {
        match err {
            nerd_storage::StoreError::Cancelled => Self::Cancelled,
            other => Self::Store(other),
        }
    }
}

impl From<io::Error> for TransferError {
    fn from(err: io::Error) -> Self {
        match pipe::signal_of(&err) {
            Some(pipe::Signal::Cancelled) => Self::Cancelled,
            Some(pipe::Signal::Broken) => Self::Pipe(err.to_string()),
            None => Self::Io(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_cancellation_maps_to_cancelled() {
        let err: TransferError = nerd_storage::StoreError::Cancelled.into();
        assert!(matches!(err, TransferError::Cancelled));
    }

    #[test]
    fn plain_io_error_stays_io() {
        let err: TransferError = io::Error::other("disk full").into();
        assert!(matches!(err, TransferError::Io(_)));
        assert_eq!(err.rank(), 2);
    }

    #[test]
    fn failed_heartbeat_counts_as_expired() {
        let failed = TransferError::HeartbeatFailed {
            dataset_id: "d".into(),
            source: Box::new(TransferError::coordinator("503 service unavailable")),
        };
        assert!(failed.is_heartbeat_expired());
        assert!(TransferError::HeartbeatExpired("d".into()).is_heartbeat_expired());
        assert!(!TransferError::UploadTimedOut("d".into()).is_heartbeat_expired());
    }

    #[test]
    fn ranks() {
        assert!(TransferError::Tar("x".into()).rank() > TransferError::Cancelled.rank());
        assert!(TransferError::Cancelled.rank() > TransferError::Pipe("x".into()).rank());
    }
}

//! Object-store client for dataset transfers.
//!
//! A [`Backend`] exposes the three operations the transfer pipelines need
//! (`upload`, `download`, `exists`). [`StoreClient`] wraps a backend with
//! bounded retries and cancellation.

pub mod backend;
pub mod client;
pub mod object_store_backend;
mod retry;

pub use backend::{Backend, BoxFuture, ObjectReader};
pub use client::StoreClient;
pub use object_store_backend::{ObjectStoreBackend, S3Config};

use serde::{Deserialize, Serialize};

/// Errors reported by a single backend call.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("no such key: {0}")]
    NotFound(String),

    #[error("object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors produced by [`StoreClient`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("cancelled")]
    Cancelled,

    #[error("{op} {key} failed after {attempts} attempt(s): {source}")]
    Exhausted {
        op: &'static str,
        key: String,
        attempts: u32,
        #[source]
        source: BackendError,
    },

    #[error("exists {key} failed: {source}")]
    Exists {
        key: String,
        #[source]
        source: BackendError,
    },
}

/// Retry policy for uploads and downloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Extra attempts after the first one.
    pub max_retries: u32,
    /// Initial backoff between attempts; 0 retries immediately.
    pub retry_delay_ms: u64,
    /// Upper bound of the exponential backoff.
    pub retry_max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_delay_ms: 100,
            retry_max_delay_ms: 2_000,
        }
    }
}

impl RetryConfig {
    /// Retries without sleeping in between.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            retry_delay_ms: 0,
            retry_max_delay_ms: 0,
        }
    }
}

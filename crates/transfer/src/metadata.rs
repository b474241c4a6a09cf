//! Dataset metadata document.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::TransferError;

/// Informational summary uploaded once the index is in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Total tar-stream bytes.
    pub size: i64,
}

impl Metadata {
    /// Metadata of a dataset created `now`.
    pub fn new(size: i64, now: DateTime<Utc>) -> Self {
        Self {
            created_at: now,
            updated_at: now,
            size,
        }
    }
}

pub fn encode_metadata(meta: &Metadata) -> Result<Vec<u8>, TransferError> {
    Ok(serde_json::to_vec(meta)?)
}

/// Decodes a metadata document; unknown fields are ignored.
pub fn decode_metadata(data: &[u8]) -> Result<Metadata, TransferError> {
    Ok(serde_json::from_slice(data)?)
}

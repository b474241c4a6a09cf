use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::{INDEX_OBJECT, METADATA_OBJECT};

/// Upload state of a dataset, driven by the client and sealed by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadStatus {
    #[serde(rename = "CREATED")]
    Created,
    #[serde(rename = "UPLOADING")]
    Uploading,
    #[serde(rename = "SUCCESS")]
    Success,
}

/// Dataset descriptor as returned by the coordinator.
///
/// Chunks live under `project_root` (shared by every dataset of the project),
/// the index and metadata objects live under `dataset_root`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub project_id: String,
    pub dataset_id: String,
    pub bucket: String,
    pub dataset_root: String,
    pub project_root: String,
    /// Unix timestamp (seconds) after which an upload without heartbeat is abandoned.
    #[serde(default)]
    pub upload_expire: i64,
    pub upload_status: UploadStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

impl Dataset {
    /// Object key of a chunk, given its hex-encoded content address.
    pub fn chunk_object(&self, hex_key: &str) -> String {
        join_key(&self.project_root, hex_key)
    }

    /// Object key of the chunk index.
    pub fn index_object(&self) -> String {
        join_key(&self.dataset_root, INDEX_OBJECT)
    }

    /// Object key of the metadata document.
    pub fn metadata_object(&self) -> String {
        join_key(&self.dataset_root, METADATA_OBJECT)
    }

    /// `upload_expire` as a UTC timestamp.
    pub fn upload_expire_at(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.upload_expire, 0)
            .single()
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Returns `true` if `upload_expire` lies before `now`.
    pub fn upload_expired(&self, now: DateTime<Utc>) -> bool {
        self.upload_expire_at() < now
    }

    /// Time left until `upload_expire`, zero if it already passed.
    pub fn until_expire(&self, now: DateTime<Utc>) -> Duration {
        (self.upload_expire_at() - now)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

/// Joins a storage root and an object name with exactly one `/`.
pub fn join_key(root: &str, name: &str) -> String {
    let root = root.trim_matches('/');
    if root.is_empty() {
        name.to_string()
    } else {
        format!("{root}/{name}")
    }
}

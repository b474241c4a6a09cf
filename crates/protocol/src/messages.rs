use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::DEFAULT_HEARTBEAT_INTERVAL;
use crate::types::Dataset;

// ---------------------------------------------------------------------------
// Request payloads
// ---------------------------------------------------------------------------

/// Allocates a new dataset in a project.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CreateDatasetRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

/// Username/password exchange at the authentication API.
#[derive(Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TokenRequest {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for TokenRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenRequest")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Response payloads
// ---------------------------------------------------------------------------

/// Newly created dataset plus the heartbeat period the coordinator expects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateDatasetResponse {
    #[serde(flatten)]
    pub dataset: Dataset,
    /// Heartbeat period in seconds.
    #[serde(default)]
    pub heartbeat_interval: u64,
}

impl CreateDatasetResponse {
    /// Heartbeat period, falling back to the default when the server sent none.
    pub fn heartbeat_interval(&self) -> Duration {
        if self.heartbeat_interval == 0 {
            DEFAULT_HEARTBEAT_INTERVAL
        } else {
            Duration::from_secs(self.heartbeat_interval)
        }
    }
}

/// Reply to an upload heartbeat.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    #[serde(default)]
    pub has_expired: bool,
}

/// Reply to the upload success call (no fields are currently defined).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UploadSuccessResponse {}

/// Access token issued by the authentication API.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TokenResponse {
    pub token: String,
}

/// Error body returned with any status >= 400.
///
/// `fields` maps request fields to validation details; values are kept as
/// arbitrary JSON.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ErrorPayload {
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub fields: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub retry: bool,
}

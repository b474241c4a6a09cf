//! Wire types shared between the dataset transfer layer and the
//! coordinator's JSON-over-HTTP API.

pub mod constants;
pub mod messages;
pub mod types;

// Re-export primary types for convenience.
pub use messages::{
    CreateDatasetRequest, CreateDatasetResponse, ErrorPayload, HeartbeatResponse,
    TokenRequest, TokenResponse, UploadSuccessResponse,
};
pub use types::{Dataset, UploadStatus};

//! Client error types.

use std::collections::HashMap;

use nerd_protocol::ErrorPayload;

/// Errors produced by the dataset client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The API answered with a status >= 400.
    #[error("HTTP {status_code}: {message}")]
    Http {
        status_code: u16,
        message: String,
        fields: HashMap<String, serde_json::Value>,
        retry: bool,
    },

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("authentication error: {0}")]
    Auth(#[from] nerd_auth::AuthError),

    #[error("transfer error: {0}")]
    Transfer(#[from] nerd_transfer::TransferError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ClientError {
    /// Builds an [`ClientError::Http`] from a status and raw error body.
    ///
    /// Bodies that are not an error payload become the message verbatim.
    pub(crate) fn from_response(status_code: u16, body: &str) -> Self {
        match serde_json::from_str::<ErrorPayload>(body) {
            Ok(payload) => Self::Http {
                status_code,
                message: if payload.message.is_empty() {
                    format!("status {status_code}")
                } else {
                    payload.message
                },
                fields: payload.fields,
                retry: payload.retry,
            },
            Err(_) => Self::Http {
                status_code,
                message: if body.trim().is_empty() {
                    format!("status {status_code}")
                } else {
                    body.trim().to_string()
                },
                fields: HashMap::new(),
                retry: false,
            },
        }
    }

    /// Whether the server marked the failed request as retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Http { retry: true, .. })
    }
}

//! Access tokens for the nerd API.
//!
//! A [`Provider`] knows how to obtain a JWT (static value, environment,
//! token file, interactive login). [`ChainProvider`] tries several in order
//! and [`TokenCache`] keeps the current token, refreshing it at most once at
//! a time.

pub mod cache;
pub mod jwt;
pub mod prompt;
pub mod provider;

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

pub use cache::TokenCache;
pub use jwt::{Claims, decode_claims, verify};
pub use prompt::{Credentials, Prompter, TerminalPrompter};
pub use provider::{
    AuthApiProvider, ChainProvider, DiskProvider, EnvProvider, Provider, StaticProvider,
};

/// Boxed future returned by [`Provider::retrieve`].
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Errors from token retrieval and decoding.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("base64 error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("auth API returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("malformed token: {0}")]
    Malformed(String),

    #[error("unsupported signing algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("invalid public key: {0}")]
    InvalidKey(String),

    #[error("invalid token signature")]
    InvalidSignature,

    #[error("token expired")]
    Expired,

    #[error("environment variable {0} is not set")]
    EnvNotSet(String),

    #[error("token file {0:?} is empty")]
    EmptyTokenFile(PathBuf),

    #[error("no valid token provider: {}", .0.join("; "))]
    NoValidProvider(Vec<String>),
}

/// Returns `$HOME/.nerd/token`.
pub fn default_token_path() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .filter(|h| !h.is_empty())
        .map(|h| PathBuf::from(h).join(nerd_protocol::constants::TOKEN_FILE))
}

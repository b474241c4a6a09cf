//! Token providers.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::time::Duration;

use nerd_protocol::constants::{TOKEN_ENV_VAR, TOKEN_PATH};
use nerd_protocol::{ErrorPayload, TokenRequest, TokenResponse};
use tracing::{debug, info, warn};

use crate::jwt::{Claims, decode_claims};
use crate::prompt::Prompter;
use crate::{AuthError, BoxFuture};

/// Source of access tokens.
pub trait Provider: Send + Sync {
    /// Returns `true` if the last retrieved token should be refreshed.
    fn is_expired(&self) -> bool;

    /// Obtains a fresh token.
    fn retrieve(&self) -> BoxFuture<'_, Result<String, AuthError>>;

    /// Short label used in error reports.
    fn name(&self) -> String;
}

/// `exp` value meaning "nothing retrieved yet".
const UNSET: i64 = i64::MIN;

/// Expiry of the last token a provider handed out.
struct Expiry {
    exp: AtomicI64,
    window: Duration,
}

impl Expiry {
    fn new(window: Duration) -> Self {
        Self {
            exp: AtomicI64::new(UNSET),
            window,
        }
    }

    fn is_expired(&self) -> bool {
        match self.exp.load(Ordering::Acquire) {
            UNSET => true,
            exp => Claims {
                exp,
                ..Default::default()
            }
            .is_expired_now(self.window),
        }
    }

    fn set(&self, claims: &Claims) {
        self.exp.store(claims.exp, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// Static
// ---------------------------------------------------------------------------

/// Fixed token that never expires.
pub struct StaticProvider {
    token: String,
}

impl StaticProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl Provider for StaticProvider {
    fn is_expired(&self) -> bool {
        false
    }

    fn retrieve(&self) -> BoxFuture<'_, Result<String, AuthError>> {
        Box::pin(async move { Ok(self.token.clone()) })
    }

    fn name(&self) -> String {
        "static".into()
    }
}

// ---------------------------------------------------------------------------
// Environment
// ---------------------------------------------------------------------------

/// Token from an environment variable. Expired until the first successful
/// retrieve, never afterwards.
pub struct EnvProvider {
    var: String,
    retrieved: AtomicBool,
}

impl EnvProvider {
    pub fn new(var: impl Into<String>) -> Self {
        Self {
            var: var.into(),
            retrieved: AtomicBool::new(false),
        }
    }
}

impl Default for EnvProvider {
    fn default() -> Self {
        Self::new(TOKEN_ENV_VAR)
    }
}

impl Provider for EnvProvider {
    fn is_expired(&self) -> bool {
        !self.retrieved.load(Ordering::Acquire)
    }

    fn retrieve(&self) -> BoxFuture<'_, Result<String, AuthError>> {
        Box::pin(async move {
            let token = std::env::var(&self.var)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| AuthError::EnvNotSet(self.var.clone()))?;
            self.retrieved.store(true, Ordering::Release);
            Ok(token.trim().to_string())
        })
    }

    fn name(&self) -> String {
        format!("env {}", self.var)
    }
}

// ---------------------------------------------------------------------------
// Disk
// ---------------------------------------------------------------------------

/// Token stored in a file, typically `~/.nerd/token`.
///
/// Expiry follows the token's `exp` claim minus `window`. A file holding an
/// already expired token is reported as an error.
pub struct DiskProvider {
    path: PathBuf,
    expiry: Expiry,
}

impl DiskProvider {
    pub fn new(path: impl Into<PathBuf>, window: Duration) -> Self {
        Self {
            path: path.into(),
            expiry: Expiry::new(window),
        }
    }
}

impl Provider for DiskProvider {
    fn is_expired(&self) -> bool {
        self.expiry.is_expired()
    }

    fn retrieve(&self) -> BoxFuture<'_, Result<String, AuthError>> {
        Box::pin(async move {
            let data = tokio::fs::read_to_string(&self.path).await?;
            let token = data.trim();
            if token.is_empty() {
                return Err(AuthError::EmptyTokenFile(self.path.clone()));
            }
            let claims = decode_claims(token)?;
            if claims.is_expired_now(self.expiry.window) {
                return Err(AuthError::Expired);
            }
            self.expiry.set(&claims);
            debug!(path = ?self.path, exp = claims.exp, "loaded token from disk");
            Ok(token.to_string())
        })
    }

    fn name(&self) -> String {
        format!("disk {}", self.path.display())
    }
}

// ---------------------------------------------------------------------------
// Auth API
// ---------------------------------------------------------------------------

/// Exchanges prompted credentials for a token at the auth API and stores it on disk.
pub struct AuthApiProvider {
    auth_url: String,
    token_path: PathBuf,
    prompter: Arc<dyn Prompter>,
    http: reqwest::Client,
    expiry: Expiry,
}

impl AuthApiProvider {
    pub fn new(
        auth_url: impl Into<String>,
        token_path: impl Into<PathBuf>,
        prompter: Arc<dyn Prompter>,
        window: Duration,
    ) -> Self {
        Self {
            auth_url: auth_url.into(),
            token_path: token_path.into(),
            prompter,
            http: reqwest::Client::new(),
            expiry: Expiry::new(window),
        }
    }

    async fn login(&self) -> Result<String, AuthError> {
        let prompter = self.prompter.clone();
        let creds = tokio::task::spawn_blocking(move || prompter.credentials())
            .await
            .map_err(std::io::Error::other)??;

        let url = format!("{}{}", self.auth_url.trim_end_matches('/'), TOKEN_PATH);
        let resp = self
            .http
            .post(&url)
            .json(&TokenRequest {
                username: creds.username,
                password: creds.password,
            })
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorPayload>(&body)
                .ok()
                .map(|p| p.message)
                .filter(|m| !m.is_empty())
                .unwrap_or(body);
            return Err(AuthError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let TokenResponse { token } = resp.json().await?;
        let claims = decode_claims(&token)?;
        write_token_file(&self.token_path, &token).await?;
        self.expiry.set(&claims);
        info!(path = ?self.token_path, "stored new access token");
        Ok(token)
    }
}

impl Provider for AuthApiProvider {
    fn is_expired(&self) -> bool {
        self.expiry.is_expired()
    }

    fn retrieve(&self) -> BoxFuture<'_, Result<String, AuthError>> {
        Box::pin(self.login())
    }

    fn name(&self) -> String {
        format!("auth api {}", self.auth_url)
    }
}

/// Writes the token file with mode `0644`, creating parent directories.
async fn write_token_file(path: &Path, token: &str) -> Result<(), AuthError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut opts = tokio::fs::OpenOptions::new();
    opts.write(true).create(true).truncate(true);
    #[cfg(unix)]
    opts.mode(0o644);

    let mut file = opts.open(path).await?;
    tokio::io::AsyncWriteExt::write_all(&mut file, token.as_bytes()).await?;
    file.sync_all().await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o644)).await?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Chain
// ---------------------------------------------------------------------------

const NO_PROVIDER: usize = usize::MAX;

/// Tries providers in order and remembers the first one that succeeded.
pub struct ChainProvider {
    providers: Vec<Box<dyn Provider>>,
    current: AtomicUsize,
}

impl ChainProvider {
    pub fn new(providers: Vec<Box<dyn Provider>>) -> Self {
        Self {
            providers,
            current: AtomicUsize::new(NO_PROVIDER),
        }
    }

    /// Forgets the cached provider; the chain reports expired until the next retrieve.
    pub fn clear(&self) {
        self.current.store(NO_PROVIDER, Ordering::Release);
    }

    /// Index of the provider that produced the last token.
    pub fn current(&self) -> Option<usize> {
        match self.current.load(Ordering::Acquire) {
            NO_PROVIDER => None,
            i => Some(i),
        }
    }
}

impl Provider for ChainProvider {
    fn is_expired(&self) -> bool {
        self.current()
            .and_then(|i| self.providers.get(i))
            .is_none_or(|p| p.is_expired())
    }

    fn retrieve(&self) -> BoxFuture<'_, Result<String, AuthError>> {
        Box::pin(async move {
            let mut errors = Vec::new();
            for (i, provider) in self.providers.iter().enumerate() {
                match provider.retrieve().await {
                    Ok(token) => {
                        self.current.store(i, Ordering::Release);
                        debug!(provider = %provider.name(), "token retrieved");
                        return Ok(token);
                    }
                    Err(e) => {
                        debug!(provider = %provider.name(), error = %e, "provider failed");
                        errors.push(format!("{}: {e}", provider.name()));
                    }
                }
            }
            self.clear();
            warn!(tried = errors.len(), "no token provider succeeded");
            Err(AuthError::NoValidProvider(errors))
        })
    }

    fn name(&self) -> String {
        "chain".into()
    }
}

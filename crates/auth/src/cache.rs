//! In-memory token cache with single-flight refresh.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use crate::AuthError;
use crate::provider::Provider;

/// Current access token of a [`Provider`].
///
/// The lock is held across [`Provider::retrieve`], so concurrent callers of
/// [`TokenCache::get`] wait for a running refresh and then see its result.
pub struct TokenCache {
    provider: Arc<dyn Provider>,
    token: Mutex<String>,
}

impl TokenCache {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self {
            provider,
            token: Mutex::new(String::new()),
        }
    }

    /// Returns the cached token, refreshing it first if missing or expired.
    pub async fn get(&self) -> Result<String, AuthError> {
        let mut token = self.token.lock().await;
        if token.is_empty() || self.provider.is_expired() {
            debug!(provider = %self.provider.name(), "refreshing access token");
            *token = self.provider.retrieve().await?;
        }
        Ok(token.clone())
    }

    /// Drops the cached token; the next [`TokenCache::get`] retrieves a new one.
    pub async fn invalidate(&self) {
        self.token.lock().await.clear();
    }
}

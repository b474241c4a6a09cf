//! Dataset client for the nerd batch service.
//!
//! Ties the pieces together: configuration, access tokens, the coordinator
//! API and the object store, behind [`Client::upload`] and
//! [`Client::download`].

pub mod config;
pub mod coordinator;
pub mod error;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use nerd_auth::{
    AuthApiProvider, ChainProvider, DiskProvider, EnvProvider, Provider, TerminalPrompter,
    TokenCache,
};
use nerd_protocol::Dataset;
use nerd_storage::{Backend, ObjectStoreBackend, StoreClient};
use nerd_transfer::{DownloadRequest, UploadRequest};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

pub use config::{ClientConfig, StorageConfig, default_config_path};
pub use coordinator::HttpCoordinator;
pub use error::ClientError;

/// Installs a `fmt` subscriber filtered by `RUST_LOG`, `info` by default.
///
/// Does nothing if a global subscriber is already set.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

/// Uploads and downloads datasets.
pub struct Client {
    config: ClientConfig,
    coordinator: Arc<HttpCoordinator>,
    store: StoreClient,
}

impl Client {
    /// Creates a client using `provider` for tokens and `backend` for objects.
    pub fn new(
        config: ClientConfig,
        provider: Arc<dyn Provider>,
        backend: Arc<dyn Backend>,
    ) -> Result<Self, ClientError> {
        let tokens = Arc::new(TokenCache::new(provider));
        let coordinator = Arc::new(HttpCoordinator::new(config.api_url.clone(), tokens)?);
        let store = StoreClient::new(backend, config.storage.retry());
        Ok(Self {
            config,
            coordinator,
            store,
        })
    }

    /// Creates a client with the standard token chain (environment, token
    /// file, interactive login) and the configured object store.
    pub fn from_config(config: ClientConfig) -> Result<Self, ClientError> {
        let token_path = config
            .token_path
            .clone()
            .or_else(nerd_auth::default_token_path)
            .ok_or_else(|| ClientError::Config("no token path and HOME is not set".into()))?;
        let window = Duration::from_secs(config.expire_window_secs);
        let providers: Vec<Box<dyn Provider>> = vec![
            Box::new(EnvProvider::new(config.token_env.clone())),
            Box::new(DiskProvider::new(token_path.clone(), window)),
            Box::new(AuthApiProvider::new(
                config.auth_url.clone(),
                token_path,
                Arc::new(TerminalPrompter),
                window,
            )),
        ];
        let chain = ChainProvider::new(providers);

        let backend: Arc<dyn Backend> = match &config.storage.local_root {
            Some(root) => Arc::new(ObjectStoreBackend::local(root.clone())),
            None => Arc::new(ObjectStoreBackend::s3(config.storage.s3())),
        };
        Self::new(config, Arc::new(chain), backend)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &Arc<HttpCoordinator> {
        &self.coordinator
    }

    /// Uploads `dir` as a new dataset of `project_id`.
    pub async fn upload(
        &self,
        project_id: &str,
        tag: Option<&str>,
        dir: impl Into<PathBuf>,
        progress: Option<mpsc::Sender<i64>>,
        cancel: &CancellationToken,
    ) -> Result<Dataset, ClientError> {
        let req = UploadRequest {
            coordinator: self.coordinator.clone(),
            store: self.store.clone(),
            project_id: project_id.to_string(),
            tag: tag.map(str::to_string),
            local_dir: dir.into(),
            concurrency: self.config.concurrency,
            progress,
            heartbeat_interval: None,
        };
        Ok(nerd_transfer::upload(req, cancel).await?)
    }

    /// Downloads a finished dataset into `dir`.
    pub async fn download(
        &self,
        project_id: &str,
        dataset_id: &str,
        dir: impl Into<PathBuf>,
        progress: Option<mpsc::Sender<i64>>,
        cancel: &CancellationToken,
    ) -> Result<Dataset, ClientError> {
        let req = self.download_request(project_id, dataset_id, dir.into(), progress);
        Ok(nerd_transfer::download(req, cancel).await?)
    }

    /// Waits for the dataset's upload to finish, then downloads it into `dir`.
    pub async fn download_blocking(
        &self,
        project_id: &str,
        dataset_id: &str,
        dir: impl Into<PathBuf>,
        progress: Option<mpsc::Sender<i64>>,
        cancel: &CancellationToken,
    ) -> Result<Dataset, ClientError> {
        let req = self.download_request(project_id, dataset_id, dir.into(), progress);
        Ok(nerd_transfer::download_blocking(req, cancel).await?)
    }

    fn download_request(
        &self,
        project_id: &str,
        dataset_id: &str,
        local_dir: PathBuf,
        progress: Option<mpsc::Sender<i64>>,
    ) -> DownloadRequest {
        DownloadRequest {
            coordinator: self.coordinator.clone(),
            store: self.store.clone(),
            project_id: project_id.to_string(),
            dataset_id: dataset_id.to_string(),
            local_dir,
            concurrency: self.config.concurrency,
            progress,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::tests::{dataset_json, serve};
    use nerd_auth::StaticProvider;
    use nerd_protocol::UploadStatus;

    fn client(api_url: String, backend: Arc<ObjectStoreBackend>) -> Client {
        let config = ClientConfig {
            api_url,
            concurrency: 4,
            ..Default::default()
        };
        Client::new(config, Arc::new(StaticProvider::new("tok")), backend).unwrap()
    }

    #[tokio::test]
    async fn upload_then_download_over_http() {
        let backend = Arc::new(ObjectStoreBackend::in_memory());
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("hello.txt"), b"hello\n").unwrap();

        let created = dataset_json("CREATED").replace('}', r#","heartbeat_interval":30}"#);
        let (url, server) = serve(vec![(201, created), (200, "{}".to_string())]).await;
        let up = client(url, backend.clone());
        let cancel = CancellationToken::new();
        let dataset = up
            .upload("p 1", None, src.path(), None, &cancel)
            .await
            .unwrap();
        assert_eq!(dataset.dataset_id, "ds-1");

        let seen = server.await.unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen[1].request_line().starts_with("POST /projects/p%201/datasets/ds-1/success"));

        let (url, server) = serve(vec![(200, dataset_json("SUCCESS"))]).await;
        let down = client(url, backend);
        let dst = tempfile::tempdir().unwrap();
        let got = down
            .download("p 1", "ds-1", dst.path(), None, &cancel)
            .await
            .unwrap();
        assert_eq!(got.upload_status, UploadStatus::Success);
        assert_eq!(std::fs::read(dst.path().join("hello.txt")).unwrap(), b"hello\n");
        server.await.unwrap();
    }

    #[test]
    fn init_tracing_is_idempotent() {
        init_tracing();
        init_tracing();
        tracing::info!("subscriber installed");
    }

    #[tokio::test]
    async fn unfinished_dataset_is_reported() {
        let backend = Arc::new(ObjectStoreBackend::in_memory());
        let (url, server) = serve(vec![(200, dataset_json("CREATED"))]).await;
        let c = client(url, backend);
        let dst = tempfile::tempdir().unwrap();

        let err = c
            .download("p", "ds-1", dst.path(), None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ClientError::Transfer(nerd_transfer::TransferError::UploadNotFinished(_))
        ));
        server.await.unwrap();
    }
}

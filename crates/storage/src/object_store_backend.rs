//! [`Backend`] implementation on top of the `object_store` crate.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures_util::TryStreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload};
use serde::{Deserialize, Serialize};
use tokio_util::io::StreamReader;
use tracing::debug;

use crate::BackendError;
use crate::backend::{Backend, BoxFuture, ObjectReader};

type StoreFactory =
    Box<dyn Fn(&str) -> Result<Arc<dyn ObjectStore>, object_store::Error> + Send + Sync>;

/// S3 connection settings. Credentials come from the standard AWS environment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct S3Config {
    pub region: Option<String>,
    /// Custom endpoint, e.g. a MinIO or localstack URL.
    pub endpoint: Option<String>,
    pub allow_http: bool,
}

/// Object store addressed by bucket name.
///
/// One `ObjectStore` is built lazily per bucket and cached.
pub struct ObjectStoreBackend {
    stores: Mutex<HashMap<String, Arc<dyn ObjectStore>>>,
    factory: StoreFactory,
}

impl ObjectStoreBackend {
    /// Amazon S3 (or any S3-compatible endpoint).
    pub fn s3(config: S3Config) -> Self {
        Self::with_factory(move |bucket| {
            let mut builder = AmazonS3Builder::from_env().with_bucket_name(bucket);
            if let Some(region) = &config.region {
                builder = builder.with_region(region);
            }
            if let Some(endpoint) = &config.endpoint {
                builder = builder.with_endpoint(endpoint);
                if endpoint.starts_with("http://") {
                    builder = builder.with_allow_http(true);
                }
            }
            if config.allow_http {
                builder = builder.with_allow_http(true);
            }
            Ok(Arc::new(builder.build()?) as Arc<dyn ObjectStore>)
        })
    }

    /// Local directory; each bucket is a subdirectory of `root`.
    pub fn local(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self::with_factory(move |bucket| {
            let dir = root.join(bucket);
            std::fs::create_dir_all(&dir).map_err(|e| object_store::Error::Generic {
                store: "LocalFileSystem",
                source: Box::new(e),
            })?;
            Ok(Arc::new(LocalFileSystem::new_with_prefix(dir)?) as Arc<dyn ObjectStore>)
        })
    }

    /// Process-local store, mainly for tests.
    pub fn in_memory() -> Self {
        Self::with_factory(|_| Ok(Arc::new(InMemory::new()) as Arc<dyn ObjectStore>))
    }

    fn with_factory(
        factory: impl Fn(&str) -> Result<Arc<dyn ObjectStore>, object_store::Error>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        Self {
            stores: Mutex::new(HashMap::new()),
            factory: Box::new(factory),
        }
    }

    fn store(&self, bucket: &str) -> Result<Arc<dyn ObjectStore>, BackendError> {
        let mut stores = self.stores.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(store) = stores.get(bucket) {
            return Ok(store.clone());
        }
        let store = (self.factory)(bucket)?;
        debug!(bucket, "opened object store");
        stores.insert(bucket.to_string(), store.clone());
        Ok(store)
    }
}

fn not_found(key: &str, err: object_store::Error) -> BackendError {
    match err {
        object_store::Error::NotFound { .. } => BackendError::NotFound(key.to_string()),
        other => BackendError::ObjectStore(other),
    }
}

impl Backend for ObjectStoreBackend {
    fn upload<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        body: Bytes,
    ) -> BoxFuture<'a, Result<(), BackendError>> {
        Box::pin(async move {
            let store = self.store(bucket)?;
            store.put(&Path::from(key), PutPayload::from(body)).await?;
            Ok(())
        })
    }

    fn download<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
    ) -> BoxFuture<'a, Result<ObjectReader, BackendError>> {
        Box::pin(async move {
            let store = self.store(bucket)?;
            let result = store
                .get(&Path::from(key))
                .await
                .map_err(|e| not_found(key, e))?;
            let stream = result.into_stream().map_err(std::io::Error::other);
            Ok(Box::new(StreamReader::new(stream)) as ObjectReader)
        })
    }

    fn exists<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
    ) -> BoxFuture<'a, Result<bool, BackendError>> {
        Box::pin(async move {
            let store = self.store(bucket)?;
            match store.head(&Path::from(key)).await {
                Ok(_) => Ok(true),
                Err(object_store::Error::NotFound { .. }) => Ok(false),
                Err(e) => Err(e.into()),
            }
        })
    }
}

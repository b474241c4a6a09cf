//! Download pipeline.
//!
//! ```text
//! index ─▶ workers (download_bytes) ─▶ ordered writer ─▶ tar pipe ─▶ untar_dir
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use nerd_protocol::{Dataset, UploadStatus};
use nerd_storage::StoreClient;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::TransferError;
use crate::coordinator::Coordinator;
use crate::index::IndexReader;
use crate::key::ChunkKey;
use crate::ordered::{Results, Workers, ordered};
use crate::pipe::{self, PipeWriter};
use crate::progress::Progress;
use crate::stages::{Stages, keep_most_relevant};
use crate::tar::untar_dir;

/// Shortest pause between two polls of an unfinished dataset.
const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Everything needed to restore one dataset into a local directory.
pub struct DownloadRequest {
    pub coordinator: Arc<dyn Coordinator>,
    pub store: StoreClient,
    pub project_id: String,
    pub dataset_id: String,
    /// Created if missing; existing files with the same names are replaced.
    pub local_dir: PathBuf,
    pub concurrency: usize,
    /// Receives the length of every downloaded chunk.
    pub progress: Option<mpsc::Sender<i64>>,
}

/// Downloads a completed dataset into `local_dir`.
///
/// Fails with [`TransferError::UploadNotFinished`] if the dataset is still
/// being uploaded, or [`TransferError::UploadTimedOut`] if its upload was
/// abandoned.
pub async fn download(
    req: DownloadRequest,
    cancel: &CancellationToken,
) -> Result<Dataset, TransferError> {
    let dataset = describe(
        req.coordinator.as_ref(),
        &req.project_id,
        &req.dataset_id,
        cancel,
    )
    .await?;
    ensure_complete(&dataset, Utc::now())?;
    fetch(req, &dataset, cancel).await?;
    Ok(dataset)
}

/// Like [`download`], but waits for an in-progress upload to finish.
///
/// The dataset is polled whenever its current upload deadline passes, at
/// most once per [`MIN_POLL_INTERVAL`]. An upload in progress whose deadline
/// lapsed without a heartbeat fails with [`TransferError::UploadTimedOut`];
/// a dataset that has not started uploading is waited for.
pub async fn download_blocking(
    req: DownloadRequest,
    cancel: &CancellationToken,
) -> Result<Dataset, TransferError> {
    let dataset = loop {
        let dataset = describe(
            req.coordinator.as_ref(),
            &req.project_id,
            &req.dataset_id,
            cancel,
        )
        .await?;
        let now = Utc::now();
        if dataset.upload_status == UploadStatus::Success {
            break dataset;
        }
        if dataset.upload_status == UploadStatus::Uploading && dataset.upload_expired(now) {
            return Err(TransferError::UploadTimedOut(dataset.dataset_id));
        }

        let wait = dataset.until_expire(now).max(MIN_POLL_INTERVAL);
        debug!(
            dataset = %dataset.dataset_id,
            status = ?dataset.upload_status,
            wait_secs = wait.as_secs(),
            "dataset not ready, waiting"
        );
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            _ = tokio::time::sleep(wait) => {}
        }
    };
    fetch(req, &dataset, cancel).await?;
    Ok(dataset)
}

async fn describe(
    coordinator: &dyn Coordinator,
    project_id: &str,
    dataset_id: &str,
    cancel: &CancellationToken,
) -> Result<Dataset, TransferError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TransferError::Cancelled),
        r = coordinator.describe_dataset(project_id, dataset_id) => r,
    }
}

fn ensure_complete(dataset: &Dataset, now: DateTime<Utc>) -> Result<(), TransferError> {
    match dataset.upload_status {
        UploadStatus::Success => Ok(()),
        UploadStatus::Uploading if dataset.upload_expired(now) => {
            Err(TransferError::UploadTimedOut(dataset.dataset_id.clone()))
        }
        _ => Err(TransferError::UploadNotFinished(dataset.dataset_id.clone())),
    }
}

async fn fetch(
    req: DownloadRequest,
    dataset: &Dataset,
    cancel: &CancellationToken,
) -> Result<(), TransferError> {
    let DownloadRequest {
        store,
        local_dir,
        concurrency,
        progress,
        ..
    } = req;
    tokio::fs::create_dir_all(&local_dir).await?;
    info!(
        dataset = %dataset.dataset_id,
        dir = %local_dir.display(),
        "starting download"
    );

    let pipeline = cancel.child_token();
    let _abort_on_drop = pipeline.clone().drop_guard();
    let (tar_w, tar_r) = pipe::pipe(pipe::DEFAULT_CAPACITY, &pipeline);
    let files = Arc::new(AtomicU64::new(0));
    let ctx = Arc::new(ChunkDownload {
        store,
        dataset: dataset.clone(),
        progress: Progress::new(progress),
        cancel: pipeline.clone(),
    });

    let mut stages = Stages::new(pipeline.clone());
    stages.spawn("chunks", download_chunks(ctx, concurrency, tar_w));
    {
        let files = files.clone();
        let cancel = pipeline.clone();
        stages.spawn("untar", async move {
            files.store(untar_dir(tar_r, local_dir, cancel).await?, Ordering::Release);
            Ok(())
        });
    }
    if let Err(err) = stages.join().await {
        warn!(dataset = %dataset.dataset_id, error = %err, "download failed");
        return Err(err);
    }

    info!(
        dataset = %dataset.dataset_id,
        files = files.load(Ordering::Acquire),
        "download complete"
    );
    Ok(())
}

/// State shared by the chunk workers of one download.
struct ChunkDownload {
    store: StoreClient,
    dataset: Dataset,
    progress: Progress,
    cancel: CancellationToken,
}

impl ChunkDownload {
    /// Fetches a chunk and checks it against its content address.
    async fn fetch_chunk(&self, key: ChunkKey) -> Result<Bytes, TransferError> {
        let object = self.dataset.chunk_object(&key.to_hex());
        let data = self
            .store
            .download_bytes(&self.cancel, &self.dataset.bucket, &object)
            .await?;
        if ChunkKey::from_bytes(&data) != key {
            return Err(TransferError::CorruptChunk(object));
        }
        self.progress.report(data.len(), &self.cancel).await?;
        Ok(data)
    }
}

async fn download_chunks(
    ctx: Arc<ChunkDownload>,
    concurrency: usize,
    tar: PipeWriter,
) -> Result<(), TransferError> {
    let cancel = ctx.cancel.clone();
    let (workers, results) = ordered(concurrency, cancel.clone());
    let tracker = workers.tracker();

    let produce = async {
        let r = produce_keys(&ctx, workers).await;
        if r.is_err() {
            cancel.cancel();
        }
        r
    };
    let (produced, written) = tokio::join!(produce, write_chunks(results, tar, &cancel));
    tracker.close();
    tracker.wait().await;

    let mut failure = None;
    if let Err(e) = produced {
        keep_most_relevant(&mut failure, e);
    }
    if let Err(e) = written {
        keep_most_relevant(&mut failure, e);
    }
    failure.map_or(Ok(()), Err)
}

async fn produce_keys(
    ctx: &Arc<ChunkDownload>,
    workers: Workers<Bytes>,
) -> Result<(), TransferError> {
    let index = ctx
        .store
        .download(&ctx.cancel, &ctx.dataset.bucket, &ctx.dataset.index_object())
        .await?;
    let mut reader = IndexReader::new(BufReader::new(index));
    loop {
        let key = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(TransferError::Cancelled),
            k = reader.next_key() => k?,
        };
        let Some(key) = key else {
            return Ok(());
        };
        let ctx = ctx.clone();
        workers.spawn(async move { ctx.fetch_chunk(key).await }).await?;
    }
}

/// Writes chunk contents to the tar pipe in index order, then closes it.
async fn write_chunks(
    mut results: Results<Bytes>,
    mut tar: PipeWriter,
    cancel: &CancellationToken,
) -> Result<(), TransferError> {
    let mut failed: Option<TransferError> = None;
    while let Some(result) = results.next().await {
        match result {
            Ok(data) if failed.is_none() => {
                if let Err(e) = tar.write_all(&data).await {
                    cancel.cancel();
                    keep_most_relevant(&mut failed, e.into());
                }
            }
            Ok(_) => {}
            Err(e) => {
                cancel.cancel();
                keep_most_relevant(&mut failed, e);
            }
        }
    }
    if let Some(err) = failed {
        return Err(err);
    }
    if cancel.is_cancelled() {
        return Err(TransferError::Cancelled);
    }
    tar.shutdown().await?;
    Ok(())
}

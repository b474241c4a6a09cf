//! Upload pipeline.
//!
//! ```text
//! tar_dir ─▶ tee ─┬─▶ count_bytes
//!                 └─▶ chunker ─▶ workers (exists/upload) ─▶ index writer ─▶ index upload
//! ```
//!
//! The metadata document is written once every stage has finished, and the
//! dataset is only marked successful after both the index and the metadata
//! are stored.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use nerd_protocol::Dataset;
use nerd_storage::StoreClient;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::TransferError;
use crate::chunker::Chunker;
use crate::coordinator::Coordinator;
use crate::heartbeat::Heartbeat;
use crate::index::IndexWriter;
use crate::key::ChunkKey;
use crate::metadata::{Metadata, encode_metadata};
use crate::ordered::{Results, Workers, ordered};
use crate::pipe::{self, PipeReader, PipeWriter};
use crate::progress::Progress;
use crate::stages::{Stages, keep_most_relevant};
use crate::tar::{count_bytes, tar_dir};

/// Read size of the tee stage.
const TEE_BUFFER: usize = 64 * 1024;

/// Everything needed to upload one directory as a new dataset.
pub struct UploadRequest {
    pub coordinator: Arc<dyn Coordinator>,
    pub store: StoreClient,
    pub project_id: String,
    pub tag: Option<String>,
    pub local_dir: PathBuf,
    /// Chunks hashed and uploaded at the same time.
    pub concurrency: usize,
    /// Receives the length of every processed chunk.
    pub progress: Option<mpsc::Sender<i64>>,
    /// Overrides the heartbeat period requested by the coordinator.
    pub heartbeat_interval: Option<Duration>,
}

#[derive(Debug, Default)]
struct Summary {
    size: u64,
    chunks: u64,
}

/// Uploads `local_dir` as a new dataset of `project_id`.
///
/// Returns the descriptor of the created dataset once the coordinator has
/// acknowledged the upload.
pub async fn upload(
    req: UploadRequest,
    cancel: &CancellationToken,
) -> Result<Dataset, TransferError> {
    let UploadRequest {
        coordinator,
        store,
        project_id,
        tag,
        local_dir,
        concurrency,
        progress,
        heartbeat_interval,
    } = req;

    let created = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(TransferError::Cancelled),
        r = coordinator.create_dataset(&project_id, tag.as_deref()) => r?,
    };
    let interval = heartbeat_interval.unwrap_or_else(|| created.heartbeat_interval());
    let dataset = created.dataset;
    info!(
        project = %dataset.project_id,
        dataset = %dataset.dataset_id,
        dir = %local_dir.display(),
        "starting upload"
    );

    // Dropping the upload future stops the heartbeat and every worker.
    let pipeline = cancel.child_token();
    let _abort_on_drop = pipeline.clone().drop_guard();
    let heartbeat = Heartbeat::start(
        coordinator.clone(),
        dataset.project_id.clone(),
        dataset.dataset_id.clone(),
        interval,
        pipeline.clone(),
    );
    let transferred = transfer(
        &store,
        &dataset,
        local_dir,
        concurrency,
        Progress::new(progress),
        &pipeline,
    )
    .await;
    let beat = heartbeat.stop().await;

    let mut failure = None;
    if let Err(e) = beat {
        keep_most_relevant(&mut failure, e);
    }
    let summary = match transferred {
        Ok(summary) => summary,
        Err(e) => {
            keep_most_relevant(&mut failure, e);
            Summary::default()
        }
    };
    if let Some(err) = failure {
        warn!(dataset = %dataset.dataset_id, error = %err, "upload failed");
        return Err(err);
    }

    tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(TransferError::Cancelled),
        r = coordinator.send_upload_success(&dataset.project_id, &dataset.dataset_id) => r?,
    }
    info!(
        dataset = %dataset.dataset_id,
        size = summary.size,
        chunks = summary.chunks,
        "upload complete"
    );
    Ok(dataset)
}

async fn transfer(
    store: &StoreClient,
    dataset: &Dataset,
    local_dir: PathBuf,
    concurrency: usize,
    progress: Progress,
    pipeline: &CancellationToken,
) -> Result<Summary, TransferError> {
    let (tar_w, tar_r) = pipe::pipe(pipe::DEFAULT_CAPACITY, pipeline);
    let (count_w, count_r) = pipe::pipe(pipe::DEFAULT_CAPACITY, pipeline);
    let (chunk_w, chunk_r) = pipe::pipe(pipe::DEFAULT_CAPACITY, pipeline);
    let (index_w, index_r) = pipe::pipe(pipe::DEFAULT_CAPACITY, pipeline);
    let size = Arc::new(AtomicU64::new(0));
    let chunks = Arc::new(AtomicU64::new(0));

    let mut stages = Stages::new(pipeline.clone());
    stages.spawn("tar", tar_dir(local_dir, tar_w, pipeline.clone()));
    stages.spawn("tee", tee(tar_r, count_w, chunk_w));
    {
        let size = size.clone();
        stages.spawn("count", async move {
            size.store(count_bytes(count_r).await?, Ordering::Release);
            Ok(())
        });
    }
    let ctx = Arc::new(ChunkUpload {
        store: store.clone(),
        dataset: dataset.clone(),
        progress,
        cancel: pipeline.clone(),
    });
    stages.spawn(
        "chunks",
        upload_chunks(ctx, concurrency, chunk_r, index_w, chunks.clone()),
    );
    {
        let store = store.clone();
        let cancel = pipeline.clone();
        let bucket = dataset.bucket.clone();
        let key = dataset.index_object();
        stages.spawn("index", async move {
            let mut reader = index_r;
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf).await?;
            store.upload(&cancel, &bucket, &key, Bytes::from(buf)).await?;
            Ok(())
        });
    }
    stages.join().await?;

    let summary = Summary {
        size: size.load(Ordering::Acquire),
        chunks: chunks.load(Ordering::Acquire),
    };
    let meta = Metadata::new(i64::try_from(summary.size).unwrap_or(i64::MAX), Utc::now());
    store
        .upload(
            pipeline,
            &dataset.bucket,
            &dataset.metadata_object(),
            Bytes::from(encode_metadata(&meta)?),
        )
        .await?;
    debug!(dataset = %dataset.dataset_id, size = summary.size, "metadata stored");
    Ok(summary)
}

/// Copies the tar stream into both the counter and the chunker, one buffer
/// at a time.
async fn tee(
    mut src: PipeReader,
    mut count: PipeWriter,
    mut chunks: PipeWriter,
) -> Result<(), TransferError> {
    let mut buf = vec![0u8; TEE_BUFFER];
    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        count.write_all(&buf[..n]).await?;
        chunks.write_all(&buf[..n]).await?;
    }
    count.shutdown().await?;
    chunks.shutdown().await?;
    Ok(())
}

/// State shared by the chunk workers of one upload.
struct ChunkUpload {
    store: StoreClient,
    dataset: Dataset,
    progress: Progress,
    cancel: CancellationToken,
}

impl ChunkUpload {
    /// Stores `chunk` under its content address unless it is already there.
    async fn store_chunk(&self, chunk: Bytes) -> Result<ChunkKey, TransferError> {
        let key = ChunkKey::from_bytes(&chunk);
        let len = chunk.len();
        let object = self.dataset.chunk_object(&key.to_hex());
        if self
            .store
            .exists(&self.cancel, &self.dataset.bucket, &object)
            .await?
        {
            debug!(%key, len, "chunk already stored");
        } else {
            self.store
                .upload(&self.cancel, &self.dataset.bucket, &object, chunk)
                .await?;
        }
        self.progress.report(len, &self.cancel).await?;
        Ok(key)
    }
}

async fn upload_chunks(
    ctx: Arc<ChunkUpload>,
    concurrency: usize,
    reader: PipeReader,
    index: PipeWriter,
    chunks: Arc<AtomicU64>,
) -> Result<(), TransferError> {
    let cancel = ctx.cancel.clone();
    let (workers, results) = ordered(concurrency, cancel.clone());
    let tracker = workers.tracker();

    let produce = async {
        let r = produce_chunks(&ctx, reader, workers).await;
        if r.is_err() {
            cancel.cancel();
        }
        r
    };
    let (produced, written) = tokio::join!(produce, write_index(results, index, &cancel));
    tracker.close();
    tracker.wait().await;

    let mut failure = None;
    if let Err(e) = produced {
        keep_most_relevant(&mut failure, e);
    }
    match written {
        Ok(n) => chunks.store(n, Ordering::Release),
        Err(e) => keep_most_relevant(&mut failure, e),
    }
    failure.map_or(Ok(()), Err)
}

async fn produce_chunks(
    ctx: &Arc<ChunkUpload>,
    reader: PipeReader,
    workers: Workers<ChunkKey>,
) -> Result<(), TransferError> {
    let mut chunker = Chunker::new(reader);
    while let Some(chunk) = chunker.next_chunk().await? {
        let ctx = ctx.clone();
        workers.spawn(async move { ctx.store_chunk(chunk).await }).await?;
    }
    Ok(())
}

/// Writes keys to the index in chunk order, then closes it.
///
/// After the first failure the remaining results are drained without
/// writing, and the index is dropped unfinished so its reader sees a
/// broken pipe instead of a truncated index.
async fn write_index(
    mut results: Results<ChunkKey>,
    index: PipeWriter,
    cancel: &CancellationToken,
) -> Result<u64, TransferError> {
    let mut writer = IndexWriter::new(index);
    let mut failed: Option<TransferError> = None;
    while let Some(result) = results.next().await {
        match result {
            Ok(key) if failed.is_none() => {
                if let Err(e) = writer.write_key(&key).await {
                    cancel.cancel();
                    keep_most_relevant(&mut failed, e);
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
    let written = writer.written();
    writer.finish().await?;
    Ok(written)
}

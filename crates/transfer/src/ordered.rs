//! Parallel per-chunk work with results delivered in submission order.
//!
//! The producer submits jobs through [`Workers::spawn`]; each job runs on its
//! own task while its result receiver is queued in a bounded FIFO. The
//! consumer pops receivers in order and awaits each one, so parallelism lives
//! in the workers and ordering lives in the queue.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{Semaphore, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::TransferError;

type Job<T> = oneshot::Receiver<Result<T, TransferError>>;

/// Creates a producer/consumer pair running at most `concurrency` jobs at once.
pub(crate) fn ordered<T: Send + 'static>(
    concurrency: usize,
    cancel: CancellationToken,
) -> (Workers<T>, Results<T>) {
    let concurrency = concurrency.max(1);
    let (tx, rx) = mpsc::channel(concurrency);
    (
        Workers {
            tx,
            permits: Arc::new(Semaphore::new(concurrency)),
            tracker: TaskTracker::new(),
            cancel,
        },
        Results { rx },
    )
}

/// Producer side.
pub(crate) struct Workers<T> {
    tx: mpsc::Sender<Job<T>>,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl<T: Send + 'static> Workers<T> {
    /// Tracker of every spawned job, for waiting after the stage ends.
    pub(crate) fn tracker(&self) -> TaskTracker {
        self.tracker.clone()
    }

    /// Starts `job` once a slot is free. A failing job cancels the pipeline.
    pub(crate) async fn spawn<F>(&self, job: F) -> Result<(), TransferError>
    where
        F: Future<Output = Result<T, TransferError>> + Send + 'static,
    {
        let permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(TransferError::Cancelled),
            p = self.permits.clone().acquire_owned() => {
                p.map_err(|_| TransferError::Cancelled)?
            }
        };
        let slot = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(TransferError::Cancelled),
            s = self.tx.reserve() => {
                s.map_err(|_| TransferError::Pipe("result consumer exited".into()))?
            }
        };

        let (result_tx, result_rx) = oneshot::channel();
        let cancel = self.cancel.clone();
        self.tracker.spawn(async move {
            let result = job.await;
            drop(permit);
            if result.is_err() {
                cancel.cancel();
            }
            let _ = result_tx.send(result);
        });
        slot.send(result_rx);
        Ok(())
    }
}

/// Consumer side.
pub(crate) struct Results<T> {
    rx: mpsc::Receiver<Job<T>>,
}

impl<T> Results<T> {
    /// Next result in submission order, or `None` once the producer is gone
    /// and every submitted job has been returned.
    pub(crate) async fn next(&mut self) -> Option<Result<T, TransferError>> {
        let job = self.rx.recv().await?;
        Some(job.await.unwrap_or_else(|_| {
            Err(TransferError::Pipe("worker exited without a result".into()))
        }))
    }
}

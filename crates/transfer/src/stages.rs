use std::future::Future;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::TransferError;

/// Concurrent pipeline stages sharing one cancellation token.
///
/// The first stage to fail cancels the token so the others unwind. Stages
/// are always joined, never aborted, so each one runs its own cleanup.
pub(crate) struct Stages {
    set: JoinSet<Result<(), TransferError>>,
    cancel: CancellationToken,
}

impl Stages {
    pub(crate) fn new(cancel: CancellationToken) -> Self {
        Self {
            set: JoinSet::new(),
            cancel,
        }
    }

    pub(crate) fn spawn<F>(&mut self, name: &'static str, stage: F)
    where
        F: Future<Output = Result<(), TransferError>> + Send + 'static,
    {
        let cancel = self.cancel.clone();
        self.set.spawn(async move {
            let result = stage.await;
            match &result {
                Ok(()) => debug!(stage = name, "stage finished"),
                Err(e) => {
                    debug!(stage = name, error = %e, "stage failed");
                    cancel.cancel();
                }
            }
            result
        });
    }

    /// Waits for every stage and returns the most relevant error.
    pub(crate) async fn join(mut self) -> Result<(), TransferError> {
        let mut first: Option<TransferError> = None;
        while let Some(joined) = self.set.join_next().await {
            let err = match joined {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e,
                Err(e) => {
                    self.cancel.cancel();
                    TransferError::Join(e)
                }
            };
            keep_most_relevant(&mut first, err);
        }
        first.map_or(Ok(()), Err)
    }
}

/// Keeps the earliest error of the highest rank.
pub(crate) fn keep_most_relevant(slot: &mut Option<TransferError>, err: TransferError) {
    match slot {
        Some(current) if current.rank() >= err.rank() => {}
        _ => *slot = Some(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn all_ok() {
        let mut stages = Stages::new(CancellationToken::new());
        stages.spawn("a", async { Ok(()) });
        stages.spawn("b", async { Ok(()) });
        stages.join().await.unwrap();
    }

    #[tokio::test]
    async fn real_error_beats_cancellation_and_pipe_errors() {
        let cancel = CancellationToken::new();
        let mut stages = Stages::new(cancel.clone());

        let c = cancel.clone();
        stages.spawn("waits", async move {
            c.cancelled().await;
            Err(TransferError::Cancelled)
        });
        let c = cancel.clone();
        stages.spawn("pipe", async move {
            c.cancelled().await;
            Err(TransferError::Pipe("peer gone".into()))
        });
        stages.spawn("fails", async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Err(TransferError::Tar("boom".into()))
        });

        let err = stages.join().await.unwrap_err();
        assert!(matches!(err, TransferError::Tar(_)), "{err}");
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn cancellation_beats_pipe_errors() {
        let cancel = CancellationToken::new();
        let mut stages = Stages::new(cancel.clone());
        stages.spawn("pipe", async { Err(TransferError::Pipe("x".into())) });
        let c = cancel.clone();
        stages.spawn("waits", async move {
            c.cancelled().await;
            Err(TransferError::Cancelled)
        });

        assert!(matches!(
            stages.join().await,
            Err(TransferError::Cancelled)
        ));
    }

    #[test]
    fn first_real_error_is_kept() {
        let mut slot = None;
        keep_most_relevant(&mut slot, TransferError::Pipe("p".into()));
        keep_most_relevant(&mut slot, TransferError::Tar("first".into()));
        keep_most_relevant(&mut slot, TransferError::InvalidPath("second".into()));
        keep_most_relevant(&mut slot, TransferError::Cancelled);
        match slot {
            Some(TransferError::Tar(msg)) => assert_eq!(msg, "first"),
            other => panic!("unexpected: {other:?}"),
        }
    }
}

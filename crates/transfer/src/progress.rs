use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::TransferError;

/// Per-chunk progress sink shared by the workers of one stage.
///
/// Each processed chunk reports its length once. A receiver that went away
/// is not an error; reporting simply stops.
#[derive(Clone, Default)]
pub(crate) struct Progress {
    tx: Option<mpsc::Sender<i64>>,
}

impl Progress {
    pub(crate) fn new(tx: Option<mpsc::Sender<i64>>) -> Self {
        Self { tx }
    }

    /// Sends `len`, waiting for channel capacity unless cancelled.
    pub(crate) async fn report(
        &self,
        len: usize,
        cancel: &CancellationToken,
    ) -> Result<(), TransferError> {
        let Some(tx) = &self.tx else {
            return Ok(());
        };
        let len = i64::try_from(len).unwrap_or(i64::MAX);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransferError::Cancelled),
            sent = tx.send(len) => {
                if sent.is_err() {
                    trace!("progress receiver dropped");
                }
                Ok(())
            }
        }
    }
}

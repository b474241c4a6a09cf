//! Upload heartbeat pump.

use std::sync::Arc;
use std::time::Duration;

use nerd_protocol::constants::DEFAULT_HEARTBEAT_INTERVAL;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::TransferError;
use crate::coordinator::Coordinator;

/// Background task keeping an upload alive.
///
/// Every `interval` it sends an upload heartbeat. If the coordinator reports
/// the upload as expired, or the call fails, the pipeline token is cancelled
/// and [`Heartbeat::stop`] returns the cause. Dropping it aborts the pump.
pub struct Heartbeat {
    stop: CancellationToken,
    handle: JoinHandle<Result<(), TransferError>>,
}

impl Heartbeat {
    pub fn start(
        coordinator: Arc<dyn Coordinator>,
        project_id: String,
        dataset_id: String,
        interval: Duration,
        pipeline: CancellationToken,
    ) -> Self {
        let stop = CancellationToken::new();
        let interval = if interval.is_zero() {
            DEFAULT_HEARTBEAT_INTERVAL
        } else {
            interval
        };
        let handle = tokio::spawn(heartbeat_pump(
            coordinator,
            project_id,
            dataset_id,
            interval,
            stop.clone(),
            pipeline,
        ));
        Self { stop, handle }
    }

    /// Stops the pump without a final heartbeat and returns its outcome.
    pub async fn stop(mut self) -> Result<(), TransferError> {
        self.stop.cancel();
        (&mut self.handle).await?
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.stop.cancel();
        self.handle.abort();
    }
}

async fn heartbeat_pump(
    coordinator: Arc<dyn Coordinator>,
    project_id: String,
    dataset_id: String,
    interval: Duration,
    stop: CancellationToken,
    pipeline: CancellationToken,
) -> Result<(), TransferError> {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await; // Skip immediate first tick.

    let mut sent = 0u64;
    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            _ = pipeline.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let response = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            _ = pipeline.cancelled() => break,
            r = coordinator.send_upload_heartbeat(&project_id, &dataset_id) => r,
        };
        sent += 1;

        match response {
            Ok(r) if r.has_expired => {
                warn!(dataset = %dataset_id, "coordinator reports upload expired, aborting");
                pipeline.cancel();
                return Err(TransferError::HeartbeatExpired(dataset_id));
            }
            Ok(_) => debug!(dataset = %dataset_id, sent, "heartbeat sent"),
            Err(e) => {
                warn!(dataset = %dataset_id, error = %e, "heartbeat failed, aborting");
                pipeline.cancel();
                return Err(TransferError::HeartbeatFailed {
                    dataset_id,
                    source: Box::new(e),
                });
            }
        }
    }

    debug!(dataset = %dataset_id, sent, "heartbeat pump stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::CoordinatorFuture;
    use nerd_protocol::{CreateDatasetResponse, Dataset, HeartbeatResponse};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Counts heartbeats; reports expiry on call number `expire_on` and
    /// fails on call number `fail_on` (1-based, 0 disables).
    #[derive(Default)]
    struct Beats {
        calls: AtomicU32,
        expire_on: u32,
        fail_on: u32,
    }

    impl Coordinator for Beats {
        fn create_dataset<'a>(
            &'a self,
            _project_id: &'a str,
            _tag: Option<&'a str>,
        ) -> CoordinatorFuture<'a, CreateDatasetResponse> {
            unimplemented!()
        }

        fn describe_dataset<'a>(
            &'a self,
            _project_id: &'a str,
            _dataset_id: &'a str,
        ) -> CoordinatorFuture<'a, Dataset> {
            unimplemented!()
        }

        fn send_upload_heartbeat<'a>(
            &'a self,
            _project_id: &'a str,
            _dataset_id: &'a str,
        ) -> CoordinatorFuture<'a, HeartbeatResponse> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let (expire, fail) = (n == self.expire_on, n == self.fail_on);
            Box::pin(async move {
                if fail {
                    return Err(TransferError::coordinator("503 service unavailable"));
                }
                Ok(HeartbeatResponse {
                    has_expired: expire,
                })
            })
        }

        fn send_upload_success<'a>(
            &'a self,
            _project_id: &'a str,
            _dataset_id: &'a str,
        ) -> CoordinatorFuture<'a, ()> {
            unimplemented!()
        }
    }

    fn start(beats: Arc<Beats>, interval: Duration, pipeline: &CancellationToken) -> Heartbeat {
        Heartbeat::start(beats, "p".into(), "d".into(), interval, pipeline.clone())
    }

    #[tokio::test(start_paused = true)]
    async fn beats_once_per_interval() {
        let beats = Arc::new(Beats::default());
        let pipeline = CancellationToken::new();
        let hb = start(beats.clone(), Duration::from_millis(100), &pipeline);

        tokio::time::sleep(Duration::from_millis(1_050)).await;
        hb.stop().await.unwrap();

        let calls = beats.calls.load(Ordering::SeqCst);
        assert!((9..=11).contains(&calls), "calls = {calls}");
        assert!(!pipeline.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn no_heartbeat_before_first_interval() {
        let beats = Arc::new(Beats::default());
        let pipeline = CancellationToken::new();
        let hb = start(beats.clone(), Duration::from_secs(30), &pipeline);

        tokio::time::sleep(Duration::from_secs(29)).await;
        hb.stop().await.unwrap();
        assert_eq!(beats.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_cancels_pipeline() {
        let beats = Arc::new(Beats {
            expire_on: 2,
            ..Default::default()
        });
        let pipeline = CancellationToken::new();
        let hb = start(beats.clone(), Duration::from_millis(50), &pipeline);

        pipeline.cancelled().await;
        let err = hb.stop().await.unwrap_err();
        assert!(matches!(err, TransferError::HeartbeatExpired(ref d) if d == "d"));
        assert_eq!(beats.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_cancels_pipeline() {
        let beats = Arc::new(Beats {
            fail_on: 1,
            ..Default::default()
        });
        let pipeline = CancellationToken::new();
        let hb = start(beats, Duration::from_millis(50), &pipeline);

        pipeline.cancelled().await;
        let err = hb.stop().await.unwrap_err();
        assert!(matches!(err, TransferError::HeartbeatFailed { .. }), "{err}");
        assert!(err.is_heartbeat_expired());
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_stops_the_pump() {
        let beats = Arc::new(Beats::default());
        let pipeline = CancellationToken::new();
        let hb = start(beats.clone(), Duration::from_millis(50), &pipeline);

        tokio::time::sleep(Duration::from_millis(120)).await;
        drop(hb);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(beats.calls.load(Ordering::SeqCst), 2);
        assert!(!pipeline.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn pipeline_cancel_stops_quietly() {
        let beats = Arc::new(Beats::default());
        let pipeline = CancellationToken::new();
        let hb = start(beats.clone(), Duration::from_millis(50), &pipeline);

        tokio::time::sleep(Duration::from_millis(120)).await;
        pipeline.cancel();
        hb.stop().await.unwrap();
        assert_eq!(beats.calls.load(Ordering::SeqCst), 2);
    }
}

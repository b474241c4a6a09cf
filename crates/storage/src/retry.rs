use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::{BackendError, RetryConfig, StoreError};

/// Runs `f` up to `1 + max_retries` times with exponential backoff + jitter.
///
/// Every attempt and every backoff sleep races `cancel`; cancellation ends the
/// loop with [`StoreError::Cancelled`] without waiting for the attempt.
pub(crate) async fn retry<T, F, Fut>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    op: &'static str,
    key: &str,
    mut f: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BackendError>>,
{
    let attempts = config.max_retries.saturating_add(1);
    let mut delay_ms = config.retry_delay_ms;
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(StoreError::Cancelled),
            r = f() => r,
        };

        let err = match result {
            Ok(val) => return Ok(val),
            Err(e) if attempt >= attempts => {
                return Err(StoreError::Exhausted {
                    op,
                    key: key.to_string(),
                    attempts,
                    source: e,
                });
            }
            Err(e) => e,
        };

        warn!(
            op,
            key,
            attempt,
            attempts,
            error = %err,
            "object store call failed, retrying"
        );

        if delay_ms > 0 {
            let jitter = rand::random::<u64>() % delay_ms;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(StoreError::Cancelled),
                _ = tokio::time::sleep(Duration::from_millis(delay_ms + jitter)) => {}
            }
            delay_ms = delay_ms
                .saturating_mul(2)
                .min(config.retry_max_delay_ms.max(delay_ms));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn failing() -> BackendError {
        BackendError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ))
    }

    #[tokio::test]
    async fn persistent_failure_makes_exactly_one_plus_retries_attempts() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let config = RetryConfig::immediate(2);

        let result: Result<(), _> = retry(&config, &cancel, "upload", "k", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(failing()) }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result {
            Err(StoreError::Exhausted { key, attempts, .. }) => {
                assert_eq!(key, "k");
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn succeeds_after_transient_failure() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let config = RetryConfig::immediate(2);

        let result = retry(&config, &cancel, "download", "k", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move { if n == 0 { Err(failing()) } else { Ok(n) } }
        })
        .await
        .unwrap();

        assert_eq!(result, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn zero_retries_means_single_attempt() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let result: Result<(), _> = retry(&RetryConfig::immediate(0), &cancel, "upload", "k", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(failing()) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_before_start() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result: Result<(), _> =
            retry(&RetryConfig::default(), &cancel, "upload", "k", || async {
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(StoreError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_interrupts_backoff_sleep() {
        let cancel = CancellationToken::new();
        let config = RetryConfig {
            max_retries: 5,
            retry_delay_ms: 60_000,
            retry_max_delay_ms: 60_000,
        };

        let c = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            c.cancel();
        });

        let result: Result<(), _> = retry(&config, &cancel, "upload", "k", || async {
            Err(failing())
        })
        .await;

        assert!(matches!(result, Err(StoreError::Cancelled)));
    }

    #[tokio::test]
    async fn cancel_interrupts_hanging_attempt() {
        let cancel = CancellationToken::new();
        let c = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            c.cancel();
        });

        let result: Result<(), _> =
            retry(&RetryConfig::default(), &cancel, "download", "k", || {
                std::future::pending::<Result<(), BackendError>>()
            })
            .await;

        assert!(matches!(result, Err(StoreError::Cancelled)));
    }
}

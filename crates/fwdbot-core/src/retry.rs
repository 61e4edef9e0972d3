//! Bounded retry with transient/fatal classification.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::{errors::Error, Result};

#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            interval,
        }
    }

    /// Runs `op` up to `max_attempts` times, sleeping `interval` between
    /// attempts. Non-retryable errors short-circuit; cancellation aborts
    /// the wait. Exhaustion wraps the last error so callers can still
    /// classify it (a 401 must reach the error notifier).
    pub async fn run<T, F, Fut>(&self, cancel: &CancellationToken, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut last_err: Option<Error> = None;

        for attempt in 1..=self.max_attempts {
            match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::info!(attempt, "operation succeeded after retries");
                    }
                    return Ok(value);
                }
                Err(e) if !e.is_retryable() => {
                    tracing::warn!(error = %e, "non-retryable error");
                    return Err(e);
                }
                Err(e) => {
                    tracing::debug!(
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %e,
                        "retrying operation"
                    );
                    last_err = Some(e);
                }
            }

            if attempt < self.max_attempts {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    _ = tokio::time::sleep(self.interval) => {}
                }
            }
        }

        let source = last_err.unwrap_or_else(|| Error::Internal("retry without error".to_string()));
        tracing::warn!(attempts = self.max_attempts, error = %source, "max retries exceeded");
        Err(Error::RetryExhausted {
            attempts: self.max_attempts,
            source: Box::new(source),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ApiErrorKind;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(attempts, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let result = policy(3)
            .run(&cancel, || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(Error::api(ApiErrorKind::Server, "500"))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_short_circuits() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let result: Result<()> = policy(5)
            .run(&cancel, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::api(ApiErrorKind::ChatGone, "chat not found")) }
            })
            .await;

        assert!(result.unwrap_err().is_chat_gone());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhaustion_preserves_the_original_error() {
        let cancel = CancellationToken::new();

        let result: Result<()> = policy(3)
            .run(&cancel, || async {
                Err(Error::api(ApiErrorKind::Unauthorized, "401"))
            })
            .await;

        // 401 is non-retryable, so it surfaces directly...
        assert!(result.unwrap_err().is_credential_invalid());

        // ...while a transient error exhausts and stays classifiable.
        let result: Result<()> = policy(2)
            .run(&cancel, || async {
                Err(Error::api(ApiErrorKind::Server, "503"))
            })
            .await;
        let err = result.unwrap_err();
        assert!(matches!(err, Error::RetryExhausted { attempts: 2, .. }));
        assert!(matches!(
            err.root(),
            Error::Api {
                kind: ApiErrorKind::Server,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn cancellation_stops_the_wait() {
        let cancel = CancellationToken::new();
        let policy = RetryPolicy::new(3, Duration::from_secs(60));

        cancel.cancel();
        let result: Result<()> = policy
            .run(&cancel, || async {
                Err(Error::api(ApiErrorKind::Network, "timeout"))
            })
            .await;

        assert!(matches!(result.unwrap_err(), Error::Cancelled));
    }
}

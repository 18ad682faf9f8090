//! Run-with-retry driver
//!
//! Invokes an async operation until it succeeds, hits a non-retryable error,
//! the policy gives up, or the caller cancels. Every invocation and every delay
//! races the caller's cancellation token.

use super::policy::{default_retryable, RetryDecision, RetryPolicy};
use crate::error::{ClientError, ClientResult};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn, Instrument};

/// Bookkeeping for one `run` invocation; never outlives it
#[derive(Debug)]
pub(crate) struct RetryState {
    pub attempt_count: u32,
    pub last_error: Option<ClientError>,
    started_at: Instant,
}

impl RetryState {
    fn new() -> Self {
        Self {
            attempt_count: 0,
            last_error: None,
            started_at: Instant::now(),
        }
    }

    fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// Applies a [`RetryPolicy`] to async operations
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    policy: Arc<dyn RetryPolicy>,
}

impl RetryExecutor {
    pub fn new(policy: Arc<dyn RetryPolicy>) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &Arc<dyn RetryPolicy> {
        &self.policy
    }

    /// Run `operation`, retrying transient errors per the policy
    pub async fn run<T, F, Fut>(&self, operation: F, cancel: &CancellationToken) -> ClientResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ClientResult<T>>,
    {
        self.run_with_predicate(operation, default_retryable, cancel)
            .await
    }

    /// Run `operation`, retrying errors accepted by `is_retryable` per the policy.
    ///
    /// Errors rejected by the predicate are returned as-is, and so are fatal
    /// errors (see [`ClientError::is_fatal`]) whatever the predicate says.
    /// When the policy stops after at least one retry the last error is wrapped in
    /// [`ClientError::RetryExhausted`]; a stop on the first failure returns the
    /// error directly.
    pub async fn run_with_predicate<T, F, Fut, P>(
        &self,
        mut operation: F,
        is_retryable: P,
        cancel: &CancellationToken,
    ) -> ClientResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ClientResult<T>>,
        P: Fn(&ClientError) -> bool,
    {
        let mut state = RetryState::new();

        loop {
            if cancel.is_cancelled() {
                return Err(ClientError::Cancelled);
            }

            let attempt =
                operation().instrument(crate::retry_span!(attempt = state.attempt_count));
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ClientError::Cancelled),
                outcome = attempt => outcome,
            };

            let error = match outcome {
                Ok(value) => {
                    if state.attempt_count > 0 {
                        debug!(attempts = state.attempt_count + 1, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            if cancel.is_cancelled() || error.is_cancelled() {
                return Err(ClientError::Cancelled);
            }

            if error.is_fatal() || !is_retryable(&error) {
                debug!(
                    attempt = state.attempt_count,
                    error = %error.sanitized(),
                    "Operation failed with non-retryable error"
                );
                return Err(error);
            }

            let decision = self
                .policy
                .should_retry(state.attempt_count, &error, state.elapsed());

            let delay = match decision {
                RetryDecision::Stop => {
                    return Err(Self::terminal_error(state.attempt_count, error));
                }
                RetryDecision::Retry(delay) => delay,
            };

            warn!(
                attempt = state.attempt_count,
                delay_ms = delay.as_millis() as u64,
                error = %error.sanitized(),
                "Operation failed, retrying"
            );
            state.last_error = Some(error);

            if !delay.is_zero() {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(ClientError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            state.attempt_count += 1;
        }
    }

    fn terminal_error(attempt: u32, error: ClientError) -> ClientError {
        if attempt == 0 {
            debug!(error = %error.sanitized(), "Retry policy declined first failure");
            return error;
        }
        let attempts = attempt + 1;
        warn!(attempts, error = %error.sanitized(), "Retry policy exhausted");
        ClientError::RetryExhausted {
            attempts,
            source: Box::new(error),
        }
    }
}

/// Sleep for `delay` unless cancelled first. Returns `false` on cancellation.
pub async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    if delay.is_zero() {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::policy::{FixedInterval, NoRetry, RetryLimit};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fixed(max_attempts: u32) -> RetryExecutor {
        RetryExecutor::new(Arc::new(FixedInterval::new(
            Duration::from_millis(1),
            RetryLimit::MaxAttempts(max_attempts),
        )))
    }

    #[tokio::test]
    async fn test_success_first_attempt() {
        let calls = AtomicU32::new(0);
        let result = fixed(3)
            .run(
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, ClientError>(42)
                },
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_success_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = fixed(5)
            .run(
                || async {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err(ClientError::communication("flaky"))
                    } else {
                        Ok(n)
                    }
                },
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_wraps_last_error() {
        let calls = AtomicU32::new(0);
        let result: ClientResult<()> = fixed(3)
            .run(
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(ClientError::communication("down"))
                },
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result {
            Err(ClientError::RetryExhausted { attempts, source }) => {
                assert_eq!(attempts, 3);
                assert!(matches!(*source, ClientError::Communication { .. }));
            }
            other => panic!("expected RetryExhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_no_retry_returns_error_unwrapped() {
        let executor = RetryExecutor::new(Arc::new(NoRetry));
        let result: ClientResult<()> = executor
            .run(
                || async { Err(ClientError::communication("down")) },
                &CancellationToken::new(),
            )
            .await;

        assert!(matches!(result, Err(ClientError::Communication { .. })));
    }

    #[tokio::test]
    async fn test_non_retryable_error_short_circuits() {
        let calls = AtomicU32::new(0);
        let result: ClientResult<()> = fixed(10)
            .run(
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(ClientError::unauthorized("bad signature"))
                },
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(ClientError::Unauthorized { .. })));
    }

    #[tokio::test]
    async fn test_custom_predicate() {
        let calls = AtomicU32::new(0);
        let result: ClientResult<()> = fixed(4)
            .run_with_predicate(
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(ClientError::server_busy("throttled"))
                },
                |_| false,
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(ClientError::ServerBusy { .. })));
    }

    #[tokio::test]
    async fn test_permissive_predicate_cannot_retry_fatal_error() {
        let calls = AtomicU32::new(0);
        let result: ClientResult<()> = fixed(4)
            .run_with_predicate(
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(ClientError::device_disabled("disabled in hub"))
                },
                |_| true,
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(ClientError::DeviceDisabled { .. })));
    }

    #[tokio::test]
    async fn test_pre_cancelled_token_skips_operation() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result: ClientResult<()> = fixed(3)
            .run(
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
                &cancel,
            )
            .await;

        assert!(matches!(result, Err(ClientError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_sleep_or_cancel() {
        let cancel = CancellationToken::new();
        assert!(sleep_or_cancel(Duration::from_millis(1), &cancel).await);

        cancel.cancel();
        assert!(!sleep_or_cancel(Duration::from_secs(60), &cancel).await);
        assert!(!sleep_or_cancel(Duration::ZERO, &cancel).await);
    }
}

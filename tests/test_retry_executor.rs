//! Retry executor behavior against real policies
//!
//! Covers invocation counts under every policy variant, cancellation during
//! delays, and the error shape callers see when retries run out.

use hublink::error::ClientError;
use hublink::retry::{
    ExponentialBackoff, FixedInterval, NoRetry, RetryExecutor, RetryLimit, RetryPolicy,
};
use proptest::prelude::*;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Operation that fails transiently `transient_failures` times, then either
/// fails permanently or succeeds
async fn scripted(
    calls: &AtomicU32,
    transient_failures: u32,
    then_fatal: bool,
) -> Result<u32, ClientError> {
    let call = calls.fetch_add(1, Ordering::SeqCst);
    if call < transient_failures {
        Err(ClientError::communication(format!("drop #{call}")))
    } else if then_fatal {
        Err(ClientError::unauthorized("key revoked"))
    } else {
        Ok(call)
    }
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// An error sequence that turns non-transient at attempt k is invoked
    /// exactly k+1 times, whatever the policy, provided the policy would
    /// keep retrying the transient part
    #[test]
    fn prop_fatal_error_at_attempt_k_invokes_k_plus_one_times(k in 0u32..8, policy_index in 0usize..2) {
        let policy: Arc<dyn RetryPolicy> = match policy_index {
            0 => Arc::new(FixedInterval::new(Duration::ZERO, RetryLimit::Unlimited)),
            _ => Arc::new(ExponentialBackoff::new(
                Duration::from_millis(1),
                Duration::from_millis(2),
                0.0,
                RetryLimit::MaxAttempts(k + 1),
            )),
        };
        let executor = RetryExecutor::new(policy);
        let calls = AtomicU32::new(0);

        let result = runtime().block_on(async {
            executor
                .run(|| scripted(&calls, k, true), &CancellationToken::new())
                .await
        });

        let is_unauthorized = matches!(result, Err(ClientError::Unauthorized { .. }));
        prop_assert!(is_unauthorized);
        prop_assert_eq!(calls.load(Ordering::SeqCst), k + 1);
    }

    /// MaxAttempts(n) never invokes more than n times
    #[test]
    fn prop_max_attempts_bounds_invocations(max in 1u32..10) {
        let executor = RetryExecutor::new(Arc::new(FixedInterval::new(
            Duration::ZERO,
            RetryLimit::MaxAttempts(max),
        )));
        let calls = AtomicU32::new(0);

        let result = runtime().block_on(async {
            executor
                .run(|| scripted(&calls, u32::MAX, false), &CancellationToken::new())
                .await
        });

        prop_assert_eq!(calls.load(Ordering::SeqCst), max);
        prop_assert!(result.is_err());
    }
}

#[tokio::test]
async fn test_no_retry_policy_invokes_once() {
    let executor = RetryExecutor::new(Arc::new(NoRetry));
    let calls = AtomicU32::new(0);

    let result = executor
        .run(|| scripted(&calls, 5, false), &CancellationToken::new())
        .await;

    assert!(matches!(result, Err(ClientError::Communication { .. })));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_transient_failures_then_success() {
    let executor = RetryExecutor::new(Arc::new(FixedInterval::new(
        Duration::from_millis(1),
        RetryLimit::MaxAttempts(5),
    )));
    let calls = AtomicU32::new(0);

    let result = executor
        .run(|| scripted(&calls, 3, false), &CancellationToken::new())
        .await;

    assert_eq!(result.unwrap(), 3);
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_exhaustion_wraps_last_transient_error() {
    let executor = RetryExecutor::new(Arc::new(FixedInterval::new(
        Duration::from_millis(1),
        RetryLimit::MaxAttempts(3),
    )));
    let calls = AtomicU32::new(0);

    let result = executor
        .run(|| scripted(&calls, u32::MAX, false), &CancellationToken::new())
        .await;

    match result {
        Err(ClientError::RetryExhausted { attempts, source }) => {
            assert_eq!(attempts, 3);
            assert!(matches!(*source, ClientError::Communication { .. }));
        }
        other => panic!("Expected RetryExhausted, got {other:?}"),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_elapsed_limit_stops_retrying() {
    let executor = RetryExecutor::new(Arc::new(FixedInterval::new(
        Duration::from_millis(20),
        RetryLimit::MaxElapsed(Duration::from_millis(50)),
    )));
    let calls = AtomicU32::new(0);
    let started = Instant::now();

    let result = executor
        .run(|| scripted(&calls, u32::MAX, false), &CancellationToken::new())
        .await;

    assert!(matches!(result, Err(ClientError::RetryExhausted { .. })));
    let invocations = calls.load(Ordering::SeqCst);
    assert!((2..=5).contains(&invocations), "invocations: {invocations}");
    assert!(started.elapsed() >= Duration::from_millis(50));
}

#[tokio::test]
async fn test_cancel_during_delay_stops_invocations() {
    let executor = RetryExecutor::new(Arc::new(FixedInterval::new(
        Duration::from_secs(60),
        RetryLimit::Unlimited,
    )));
    let calls = Arc::new(AtomicU32::new(0));
    let cancel = CancellationToken::new();

    let canceller = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        })
    };

    let started = Instant::now();
    let result = executor
        .run(|| scripted(&calls, u32::MAX, false), &cancel)
        .await;
    canceller.await.unwrap();

    assert!(matches!(result, Err(ClientError::Cancelled)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(started.elapsed() < Duration::from_secs(5));

    // Nothing runs after cancellation was observed
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_cancelled_before_start_never_invokes() {
    let executor = RetryExecutor::new(Arc::new(NoRetry));
    let calls = AtomicU32::new(0);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = executor
        .run(|| scripted(&calls, 0, false), &cancel)
        .await;

    assert!(matches!(result, Err(ClientError::Cancelled)));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_custom_predicate_retries_protocol_errors() {
    let executor = RetryExecutor::new(Arc::new(FixedInterval::new(
        Duration::ZERO,
        RetryLimit::MaxAttempts(4),
    )));
    let calls = AtomicU32::new(0);

    let result = executor
        .run_with_predicate(
            || async {
                let call = calls.fetch_add(1, Ordering::SeqCst);
                if call < 2 {
                    Err(ClientError::protocol("truncated twin response"))
                } else {
                    Ok(call)
                }
            },
            |error| matches!(error, ClientError::Protocol { .. }),
            &CancellationToken::new(),
        )
        .await;

    assert_eq!(result.unwrap(), 2);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_permissive_predicate_never_retries_unauthorized() {
    let executor = RetryExecutor::new(Arc::new(FixedInterval::new(
        Duration::ZERO,
        RetryLimit::MaxAttempts(4),
    )));
    let calls = AtomicU32::new(0);

    let result = executor
        .run_with_predicate(
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(ClientError::unauthorized("not yet provisioned"))
            },
            |_| true,
            &CancellationToken::new(),
        )
        .await;

    assert!(matches!(result, Err(ClientError::Unauthorized { .. })));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

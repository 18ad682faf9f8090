//! Background credential renewal
//!
//! One task per open session sleeps until the current grant's refresh
//! deadline, renews it through the retry executor and schedules the next
//! deadline. A failed renewal is handed to the session's watch task, which
//! ends the session and reports the reason; the loop itself never touches
//! connection state.

use crate::auth::CredentialSource;
use crate::error::{ClientError, ClientResult};
use crate::retry::{default_retryable, RetryExecutor};
use crate::session::status::ConnectionStatusChangeReason;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lower bound between two renewals, so a source that keeps returning an
/// already-due grant cannot spin the loop
pub const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(5);

/// Handle to the running refresh task
#[derive(Debug)]
struct RefreshController {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owner of at most one refresh task
#[derive(Debug, Default)]
pub struct TokenRefreshLoop {
    controller: Option<RefreshController>,
}

impl TokenRefreshLoop {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.controller
            .as_ref()
            .is_some_and(|controller| !controller.handle.is_finished())
    }

    /// Spawn the refresh task. A controller left over from an earlier start is
    /// cancelled and aborted first.
    pub fn start(
        &mut self,
        first_deadline: Instant,
        credentials: Arc<dyn CredentialSource>,
        executor: RetryExecutor,
        failures: mpsc::Sender<ClientError>,
        parent: &CancellationToken,
    ) {
        if let Some(stale) = self.controller.take() {
            warn!("Token refresh loop already running, replacing stale controller");
            stale.cancel.cancel();
            stale.handle.abort();
        }

        let cancel = parent.child_token();
        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            run_refresh_loop(first_deadline, credentials, executor, failures, task_cancel).await;
        });

        self.controller = Some(RefreshController { cancel, handle });
    }

    /// Cancel the task and wait for it to finish. No renewal is in flight once
    /// this returns.
    pub async fn stop(&mut self) {
        let Some(controller) = self.controller.take() else {
            return;
        };
        controller.cancel.cancel();
        if let Err(e) = controller.handle.await {
            if e.is_panic() {
                error!(error = %e, "Token refresh task panicked");
            }
        }
        debug!("Token refresh loop stopped");
    }
}

impl Drop for TokenRefreshLoop {
    fn drop(&mut self) {
        if let Some(controller) = self.controller.take() {
            controller.cancel.cancel();
            controller.handle.abort();
        }
    }
}

async fn run_refresh_loop(
    first_deadline: Instant,
    credentials: Arc<dyn CredentialSource>,
    executor: RetryExecutor,
    failures: mpsc::Sender<ClientError>,
    cancel: CancellationToken,
) {
    let mut deadline = first_deadline;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep_until(deadline) => {}
        }

        debug!("Refreshing credentials");
        let result: ClientResult<_> = executor
            .run_with_predicate(|| credentials.refresh(), default_retryable, &cancel)
            .await;

        match result {
            Ok(grant) => {
                let earliest = Instant::now() + MIN_REFRESH_INTERVAL;
                deadline = grant.refresh_deadline().max(earliest);
                info!(
                    expires_at = %grant.expires_at,
                    next_refresh_in_secs = deadline.saturating_duration_since(Instant::now()).as_secs(),
                    "Credentials refreshed"
                );
            }
            Err(ClientError::Cancelled) => return,
            Err(e) => {
                error!(error = %e.sanitized(), "Credential refresh failed");
                if failures.send(e).await.is_err() {
                    debug!("Session ended before refresh failure could be reported");
                }
                return;
            }
        }
    }
}

/// Status reason for a failed renewal (pure function).
///
/// A transient failure that outlasted the retry policy leaves the session
/// with a token that is about to lapse, so it is reported as expired.
pub fn refresh_failure_reason(error: &ClientError) -> Option<ConnectionStatusChangeReason> {
    match error.root_cause() {
        ClientError::Cancelled => None,
        ClientError::DeviceDisabled { .. } | ClientError::DeviceNotFound { .. } => {
            Some(ConnectionStatusChangeReason::DeviceDisabled)
        }
        ClientError::TokenExpired => Some(ConnectionStatusChangeReason::ExpiredSasToken),
        root if root.is_transient() => Some(ConnectionStatusChangeReason::ExpiredSasToken),
        _ => Some(ConnectionStatusChangeReason::BadCredential),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::TokenGrant;
    use crate::retry::NoRetry;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingSource {
        refreshes: AtomicU32,
        fail_with_unauthorized: bool,
    }

    #[async_trait]
    impl CredentialSource for CountingSource {
        async fn current(&self) -> ClientResult<TokenGrant> {
            self.refresh().await
        }

        async fn refresh(&self) -> ClientResult<TokenGrant> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            if self.fail_with_unauthorized {
                return Err(ClientError::unauthorized("key revoked"));
            }
            let now = Utc::now();
            Ok(TokenGrant {
                token: "SharedAccessSignature sr=x&sig=y&se=1".to_string(),
                expires_at: now + chrono::Duration::hours(1),
                refresh_at: now + chrono::Duration::minutes(55),
            })
        }
    }

    fn source(fail: bool) -> Arc<CountingSource> {
        Arc::new(CountingSource {
            refreshes: AtomicU32::new(0),
            fail_with_unauthorized: fail,
        })
    }

    #[test]
    fn test_failure_reason_mapping() {
        assert_eq!(
            refresh_failure_reason(&ClientError::unauthorized("x")),
            Some(ConnectionStatusChangeReason::BadCredential)
        );
        assert_eq!(
            refresh_failure_reason(&ClientError::TokenExpired),
            Some(ConnectionStatusChangeReason::ExpiredSasToken)
        );
        assert_eq!(
            refresh_failure_reason(&ClientError::RetryExhausted {
                attempts: 4,
                source: Box::new(ClientError::communication("offline")),
            }),
            Some(ConnectionStatusChangeReason::ExpiredSasToken)
        );
        assert_eq!(
            refresh_failure_reason(&ClientError::device_disabled("x")),
            Some(ConnectionStatusChangeReason::DeviceDisabled)
        );
        assert_eq!(refresh_failure_reason(&ClientError::Cancelled), None);
    }

    #[tokio::test]
    async fn test_refresh_then_stop() {
        let credentials = source(false);
        let (tx, mut rx) = mpsc::channel(1);
        let mut refresh = TokenRefreshLoop::new();

        refresh.start(
            Instant::now(),
            credentials.clone(),
            RetryExecutor::new(Arc::new(NoRetry)),
            tx,
            &CancellationToken::new(),
        );
        assert!(refresh.is_running());

        tokio::time::sleep(Duration::from_millis(50)).await;
        refresh.stop().await;

        assert!(!refresh.is_running());
        assert_eq!(credentials.refreshes.load(Ordering::SeqCst), 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_failure_is_reported_and_loop_exits() {
        let credentials = source(true);
        let (tx, mut rx) = mpsc::channel(1);
        let mut refresh = TokenRefreshLoop::new();

        refresh.start(
            Instant::now(),
            credentials.clone(),
            RetryExecutor::new(Arc::new(NoRetry)),
            tx,
            &CancellationToken::new(),
        );

        let failure = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("failure reported")
            .expect("channel open");
        assert!(matches!(failure, ClientError::Unauthorized { .. }));

        refresh.stop().await;
        assert_eq!(credentials.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_restart_replaces_stale_controller() {
        let credentials = source(false);
        let (tx, _rx) = mpsc::channel(1);
        let parent = CancellationToken::new();
        let mut refresh = TokenRefreshLoop::new();
        let far = Instant::now() + Duration::from_secs(3600);

        refresh.start(
            far,
            credentials.clone(),
            RetryExecutor::new(Arc::new(NoRetry)),
            tx.clone(),
            &parent,
        );
        refresh.start(
            far,
            credentials.clone(),
            RetryExecutor::new(Arc::new(NoRetry)),
            tx,
            &parent,
        );
        assert!(refresh.is_running());

        refresh.stop().await;
        assert_eq!(credentials.refreshes.load(Ordering::SeqCst), 0);
    }
}

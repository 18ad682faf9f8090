//! Connection guardian
//!
//! Wraps a [`TransportHandler`] and owns everything that makes the logical
//! session survive transient failures:
//!
//! - the authoritative [`ConnectionState`] and [`FeatureFlags`], mutated only
//!   under one async lock and published as a [`SessionSnapshot`] for
//!   lock-free reads
//! - the retry executor every transport call runs through
//! - one watch task per open session that waits for the transport's
//!   [`DisconnectSignal`] and drives recovery
//! - the token refresh loop
//! - connection status emission
//!
//! Open, close, recovery and feature toggles all take the same lock, so a
//! feature toggle issued during recovery waits until recovery has finished.
//! Close is the exception: when a recovery holds the lock, close cancels the
//! session token to interrupt it instead of waiting it out. A close that
//! never reaches that point leaves the session untouched when its own token
//! is cancelled.

use crate::auth::CredentialSource;
use crate::error::{ClientError, ClientResult};
use crate::retry::{sleep_or_cancel, ExponentialBackoff, RetryDecision, RetryExecutor, RetryPolicy};
use crate::session::health::{calculate_health_metrics, HealthMetrics, HealthRecord};
use crate::session::refresh::{refresh_failure_reason, TokenRefreshLoop};
use crate::session::state::{
    check_feature_transition, ConnectionState, Feature, FeatureFlags, SessionSnapshot,
};
use crate::session::status::{
    ConnectionStatusChangeReason, ConnectionStatusInfo, ConnectionStatusSink, StatusEmitter,
};
use crate::transport::{DisconnectSignal, Message, MethodResponse, TransportHandler, TwinDocument};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard as StdMutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, MutexGuard, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

/// Construction options for [`ConnectionGuardian`]
#[derive(Clone)]
pub struct GuardianOptions {
    /// Policy applied to every transport operation and to recovery
    pub policy: Arc<dyn RetryPolicy>,
    /// Credential source; when present a refresh loop runs while open
    pub credentials: Option<Arc<dyn CredentialSource>>,
    /// Receiver of connection status changes
    pub status_sink: Option<Arc<dyn ConnectionStatusSink>>,
}

impl Default for GuardianOptions {
    fn default() -> Self {
        Self {
            policy: Arc::new(ExponentialBackoff::default()),
            credentials: None,
            status_sink: None,
        }
    }
}

impl std::fmt::Debug for GuardianOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardianOptions")
            .field("policy", &self.policy)
            .field("has_credentials", &self.credentials.is_some())
            .field("has_status_sink", &self.status_sink.is_some())
            .finish()
    }
}

/// State guarded by the guardian lock
struct GuardState {
    snapshot: SessionSnapshot,
    watch_task: Option<JoinHandle<()>>,
    refresh: TokenRefreshLoop,
}

struct GuardianInner {
    transport: Arc<dyn TransportHandler>,
    executor: RetryExecutor,
    credentials: Option<Arc<dyn CredentialSource>>,
    status: StatusEmitter,
    state: Mutex<GuardState>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    health: StdMutex<HealthRecord>,
    /// Token of the current session; replaced on every successful open
    session: StdMutex<CancellationToken>,
    /// Parent of every session token; cancelled on dispose and drop
    lifetime: CancellationToken,
    /// Set while a recovery holds the state lock
    recovering: AtomicBool,
    recovery_started: Notify,
}

/// Clears the recovering flag when a recovery returns
struct RecoveryMark<'a>(&'a AtomicBool);

impl Drop for RecoveryMark<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// What ended a wait in the watch task
enum WatchEvent {
    ConnectionLost(ClientError),
    CredentialFailure(ClientError),
}

/// Durable logical connection over a transport handler
pub struct ConnectionGuardian {
    inner: Arc<GuardianInner>,
}

fn lock_std<T>(mutex: &StdMutex<T>) -> StdMutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ConnectionGuardian {
    pub fn new(transport: Arc<dyn TransportHandler>, options: GuardianOptions) -> Self {
        let (snapshot_tx, _) = watch::channel(SessionSnapshot::default());
        let lifetime = CancellationToken::new();
        let first_session = lifetime.child_token();

        Self {
            inner: Arc::new(GuardianInner {
                transport,
                executor: RetryExecutor::new(options.policy),
                credentials: options.credentials,
                status: StatusEmitter::new(options.status_sink),
                state: Mutex::new(GuardState {
                    snapshot: SessionSnapshot::default(),
                    watch_task: None,
                    refresh: TokenRefreshLoop::new(),
                }),
                snapshot_tx,
                health: StdMutex::new(HealthRecord::default()),
                session: StdMutex::new(first_session),
                lifetime,
                recovering: AtomicBool::new(false),
                recovery_started: Notify::new(),
            }),
        }
    }

    /// Open the connection. A no-op when already open.
    pub async fn open(&self, cancel: &CancellationToken) -> ClientResult<()> {
        let snapshot = self.snapshot();
        if snapshot.disposed {
            return Err(ClientError::Disposed);
        }
        if snapshot.state == ConnectionState::Open {
            debug!("Open requested while already open");
            return Ok(());
        }

        let mut state = self.inner.lock_state(cancel).await?;
        if state.snapshot.disposed {
            return Err(ClientError::Disposed);
        }
        if state.snapshot.state == ConnectionState::Open {
            return Ok(());
        }

        self.inner
            .open_locked(&mut state, cancel)
            .instrument(crate::connection_span!(operation = "open"))
            .await
    }

    /// Close the connection. A no-op when already closed; never fails once
    /// the lock is acquired.
    pub async fn close(&self, cancel: &CancellationToken) -> ClientResult<()> {
        let mut state = self.inner.lock_for_close(cancel).await?;
        self.inner
            .close_locked(&mut state)
            .instrument(crate::connection_span!(operation = "close"))
            .await;
        Ok(())
    }

    /// Close and release all resources. Every later call fails with
    /// [`ClientError::Disposed`], except `close` and `dispose` which stay
    /// no-ops.
    pub async fn dispose(&self, cancel: &CancellationToken) -> ClientResult<()> {
        let mut state = self.inner.lock_for_close(cancel).await?;
        self.inner.close_locked(&mut state).await;
        if !state.snapshot.disposed {
            state.snapshot.disposed = true;
            self.inner.publish(&state);
            info!("Connection guardian disposed");
        }
        self.inner.lifetime.cancel();
        Ok(())
    }

    pub async fn enable_methods(&self, cancel: &CancellationToken) -> ClientResult<()> {
        self.toggle_feature(Feature::Methods, true, cancel).await
    }

    pub async fn disable_methods(&self, cancel: &CancellationToken) -> ClientResult<()> {
        self.toggle_feature(Feature::Methods, false, cancel).await
    }

    pub async fn enable_twin_patch(&self, cancel: &CancellationToken) -> ClientResult<()> {
        self.toggle_feature(Feature::TwinPatch, true, cancel).await
    }

    pub async fn disable_twin_patch(&self, cancel: &CancellationToken) -> ClientResult<()> {
        self.toggle_feature(Feature::TwinPatch, false, cancel).await
    }

    pub async fn enable_receive_message(&self, cancel: &CancellationToken) -> ClientResult<()> {
        self.toggle_feature(Feature::ReceiveMessage, true, cancel).await
    }

    pub async fn disable_receive_message(&self, cancel: &CancellationToken) -> ClientResult<()> {
        self.toggle_feature(Feature::ReceiveMessage, false, cancel).await
    }

    /// Enable or disable a feature; the flag only changes when the transport
    /// call succeeds
    pub async fn toggle_feature(
        &self,
        feature: Feature,
        enable: bool,
        cancel: &CancellationToken,
    ) -> ClientResult<()> {
        self.ensure_not_disposed()?;
        let mut state = self.inner.lock_state(cancel).await?;
        if state.snapshot.disposed {
            return Err(ClientError::Disposed);
        }
        check_feature_transition(state.snapshot.state, &state.snapshot.features, feature, enable)?;

        let inner = &self.inner;
        inner
            .executor
            .run(|| inner.call_feature(feature, enable), cancel)
            .await?;

        state.snapshot.features.set(feature, enable);
        inner.publish(&state);
        info!(%feature, enabled = enable, "Feature toggled");
        Ok(())
    }

    pub async fn send_event(&self, message: &Message, cancel: &CancellationToken) -> ClientResult<()> {
        self.ensure_open()?;
        let transport = &self.inner.transport;
        self.inner
            .executor
            .run(|| transport.send_event(message), cancel)
            .await
    }

    pub async fn send_events(
        &self,
        messages: &[Message],
        cancel: &CancellationToken,
    ) -> ClientResult<()> {
        self.ensure_open()?;
        if messages.is_empty() {
            return Ok(());
        }
        let transport = &self.inner.transport;
        self.inner
            .executor
            .run(|| transport.send_events(messages), cancel)
            .await
    }

    pub async fn send_method_response(
        &self,
        response: &MethodResponse,
        cancel: &CancellationToken,
    ) -> ClientResult<()> {
        self.ensure_open()?;
        let transport = &self.inner.transport;
        self.inner
            .executor
            .run(|| transport.send_method_response(response), cancel)
            .await
    }

    pub async fn get_twin(&self, cancel: &CancellationToken) -> ClientResult<TwinDocument> {
        self.ensure_open()?;
        let transport = &self.inner.transport;
        self.inner.executor.run(|| transport.get_twin(), cancel).await
    }

    /// Patch reported properties; returns the new reported version when the
    /// transport reports one
    pub async fn update_reported_properties(
        &self,
        patch: &serde_json::Value,
        cancel: &CancellationToken,
    ) -> ClientResult<Option<u64>> {
        self.ensure_open()?;
        let transport = &self.inner.transport;
        self.inner
            .executor
            .run(|| transport.update_reported_properties(patch), cancel)
            .await
    }

    pub async fn complete_message(&self, lock_token: &str, cancel: &CancellationToken) -> ClientResult<()> {
        self.ensure_open()?;
        let transport = &self.inner.transport;
        self.inner
            .executor
            .run(|| transport.complete_message(lock_token), cancel)
            .await
    }

    pub async fn abandon_message(&self, lock_token: &str, cancel: &CancellationToken) -> ClientResult<()> {
        self.ensure_open()?;
        let transport = &self.inner.transport;
        self.inner
            .executor
            .run(|| transport.abandon_message(lock_token), cancel)
            .await
    }

    pub async fn reject_message(&self, lock_token: &str, cancel: &CancellationToken) -> ClientResult<()> {
        self.ensure_open()?;
        let transport = &self.inner.transport;
        self.inner
            .executor
            .run(|| transport.reject_message(lock_token), cancel)
            .await
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.snapshot().state
    }

    pub fn features(&self) -> FeatureFlags {
        self.snapshot().features
    }

    pub fn is_disposed(&self) -> bool {
        self.snapshot().disposed
    }

    /// Lock-free copy of the guardian state
    pub fn snapshot(&self) -> SessionSnapshot {
        *self.inner.snapshot_tx.borrow()
    }

    /// Most recent status transition, if any
    pub fn last_status(&self) -> Option<ConnectionStatusInfo> {
        self.inner.status.latest()
    }

    /// Watch channel carrying the most recent status transition
    pub fn status_receiver(&self) -> watch::Receiver<Option<ConnectionStatusInfo>> {
        self.inner.status.subscribe()
    }

    pub fn health_metrics(&self) -> HealthMetrics {
        calculate_health_metrics(&lock_std(&self.inner.health))
    }

    fn ensure_not_disposed(&self) -> ClientResult<()> {
        if self.snapshot().disposed {
            return Err(ClientError::Disposed);
        }
        Ok(())
    }

    fn ensure_open(&self) -> ClientResult<()> {
        let snapshot = self.snapshot();
        if snapshot.disposed {
            return Err(ClientError::Disposed);
        }
        if snapshot.state != ConnectionState::Open {
            return Err(ClientError::NotOpen);
        }
        Ok(())
    }
}

impl Drop for ConnectionGuardian {
    fn drop(&mut self) {
        self.inner.lifetime.cancel();
    }
}

impl std::fmt::Debug for ConnectionGuardian {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionGuardian")
            .field("snapshot", &self.snapshot())
            .field("last_status", &self.last_status())
            .finish()
    }
}

impl GuardianInner {
    /// Acquire the state lock unless `cancel` fires first
    async fn lock_state(&self, cancel: &CancellationToken) -> ClientResult<MutexGuard<'_, GuardState>> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ClientError::Cancelled),
            guard = self.state.lock() => Ok(guard),
        }
    }

    /// Acquire the state lock for close or dispose.
    ///
    /// Cancellation of `cancel` only wins while nothing has been touched. Once
    /// a recovery is seen holding the lock, the session is cancelled so the
    /// recovery gives the lock up promptly, and the close is committed: the
    /// remaining wait no longer observes `cancel`.
    async fn lock_for_close(
        &self,
        cancel: &CancellationToken,
    ) -> ClientResult<MutexGuard<'_, GuardState>> {
        if cancel.is_cancelled() {
            return Err(ClientError::Cancelled);
        }

        let recovery_started = self.recovery_started.notified();
        tokio::pin!(recovery_started);
        recovery_started.as_mut().enable();

        if !self.recovering.load(Ordering::Acquire) {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ClientError::Cancelled),
                guard = self.state.lock() => return Ok(guard),
                _ = &mut recovery_started => {}
            }
        }

        debug!("Interrupting recovery in progress");
        self.cancel_session();
        Ok(self.state.lock().await)
    }

    fn publish(&self, state: &GuardState) {
        self.snapshot_tx.send_replace(state.snapshot);
    }

    fn set_connection(&self, state: &mut GuardState, connection: ConnectionState) {
        if state.snapshot.state != connection {
            debug!(from = ?state.snapshot.state, to = ?connection, "Connection state transition");
        }
        state.snapshot.state = connection;
        self.publish(state);
    }

    fn cancel_session(&self) {
        lock_std(&self.session).cancel();
    }

    fn new_session(&self) -> CancellationToken {
        let token = self.lifetime.child_token();
        *lock_std(&self.session) = token.clone();
        token
    }

    async fn open_locked(
        self: &Arc<Self>,
        state: &mut GuardState,
        cancel: &CancellationToken,
    ) -> ClientResult<()> {
        self.set_connection(state, ConnectionState::Opening);

        // Flags left on by a terminal disconnect are re-asserted with the open
        let features = state.snapshot.features;
        let result = self.executor.run(|| self.reopen(features), cancel).await;

        let signal = match result {
            Ok(signal) => signal,
            Err(e) => {
                self.set_connection(state, ConnectionState::Closed);
                match e.status_reason() {
                    Some(reason) => {
                        error!(error = %e.sanitized(), ?reason, "Failed to open connection");
                        self.status.emit(ConnectionStatusInfo::disconnected(reason));
                    }
                    None => debug!("Open cancelled"),
                }
                return Err(e);
            }
        };

        let first_deadline = match &self.credentials {
            Some(credentials) => match first_refresh_deadline(credentials.as_ref(), cancel).await {
                Ok(deadline) => Some((credentials.clone(), deadline)),
                Err(e) => {
                    debug!("Open cancelled while reading the current credential");
                    drop(signal);
                    if let Err(close_error) = self.transport.close().await {
                        debug!(error = %close_error.sanitized(), "Close after cancelled open failed");
                    }
                    self.set_connection(state, ConnectionState::Closed);
                    return Err(e);
                }
            },
            None => None,
        };

        self.set_connection(state, ConnectionState::Open);
        lock_std(&self.health).mark_connected();
        self.status.emit(ConnectionStatusInfo::connected());

        let session = self.new_session();
        let (failure_tx, failure_rx) = mpsc::channel(1);

        if let Some((credentials, deadline)) = first_deadline {
            state.refresh.start(
                deadline,
                credentials,
                self.executor.clone(),
                failure_tx,
                &session,
            );
        }

        state.watch_task = Some(tokio::spawn(watch_connection(
            Arc::clone(self),
            signal,
            session,
            failure_rx,
        )));

        Ok(())
    }

    async fn close_locked(&self, state: &mut GuardState) {
        // A session opened while we were waiting for the lock
        self.cancel_session();

        if let Some(handle) = state.watch_task.take() {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    error!(error = %e, "Disconnect watch task panicked");
                }
            }
        }
        state.refresh.stop().await;

        if state.snapshot.state == ConnectionState::Closed {
            debug!("Close requested while already closed");
            return;
        }

        if let Err(e) = self.transport.close().await {
            warn!(error = %e.sanitized(), "Transport close failed, continuing");
        }

        self.set_connection(state, ConnectionState::Closed);
        lock_std(&self.health).mark_disconnected();
        self.status.emit(ConnectionStatusInfo::client_closed());
    }

    /// Recover after an unexpected disconnect. Returns the new connection's
    /// signal on success, `None` when the session has ended.
    async fn recover(&self, lost: ClientError, session: &CancellationToken) -> Option<DisconnectSignal> {
        let mut state = tokio::select! {
            biased;
            _ = session.cancelled() => return None,
            guard = self.state.lock() => guard,
        };
        if state.snapshot.state != ConnectionState::Open {
            return None;
        }
        self.recovering.store(true, Ordering::Release);
        self.recovery_started.notify_waiters();
        let _mark = RecoveryMark(&self.recovering);

        warn!(error = %lost.sanitized(), "Connection lost unexpectedly");
        self.set_connection(&mut state, ConnectionState::Closed);
        lock_std(&self.health).mark_disconnected();

        let lost_network = ClientError::communication("connection lost");
        let delay = match self.executor.policy().should_retry(0, &lost_network, Duration::ZERO) {
            RetryDecision::Stop => {
                info!("Retry policy declined recovery");
                state.refresh.stop().await;
                self.status.emit(ConnectionStatusInfo::disconnected(
                    ConnectionStatusChangeReason::RetryExpired,
                ));
                return None;
            }
            RetryDecision::Retry(delay) => delay,
        };

        // Opening from here on, so a close issued during recovery still
        // tears the transport down and reports ClientClosed
        self.set_connection(&mut state, ConnectionState::Opening);
        self.status.emit(ConnectionStatusInfo::retrying());

        if !sleep_or_cancel(delay, session).await {
            debug!("Recovery cancelled during initial delay");
            return None;
        }

        let features = state.snapshot.features;
        let result = self
            .executor
            .run(|| self.reopen(features), session)
            .await;

        match result {
            Ok(signal) => {
                self.set_connection(&mut state, ConnectionState::Open);
                let reconnects = {
                    let mut health = lock_std(&self.health);
                    health.mark_recovered();
                    health.reconnect_count
                };
                info!(reconnects, features = ?features.enabled(), "Connection recovered");
                self.status.emit(ConnectionStatusInfo::connected());
                Some(signal)
            }
            Err(ClientError::Cancelled) => {
                debug!("Recovery cancelled");
                None
            }
            Err(e) => {
                error!(error = %e.sanitized(), "Recovery failed");
                self.set_connection(&mut state, ConnectionState::Closed);
                state.refresh.stop().await;
                let reason = e
                    .status_reason()
                    .unwrap_or(ConnectionStatusChangeReason::RetryExpired);
                self.status.emit(ConnectionStatusInfo::disconnected(reason));
                None
            }
        }
    }

    /// One open unit: open the transport, then re-enable every enabled
    /// feature concurrently. Any failure closes the new connection so the
    /// unit can be retried from scratch.
    async fn reopen(&self, features: FeatureFlags) -> ClientResult<DisconnectSignal> {
        let signal = self.transport.open().await?;

        let reenabled = tokio::try_join!(
            self.reenable(features, Feature::Methods),
            self.reenable(features, Feature::TwinPatch),
            self.reenable(features, Feature::ReceiveMessage),
        );

        match reenabled {
            Ok(_) => Ok(signal),
            Err(e) => {
                warn!(error = %e.sanitized(), "Feature re-enable failed, discarding reopened connection");
                drop(signal);
                if let Err(close_error) = self.transport.close().await {
                    debug!(error = %close_error.sanitized(), "Close after failed re-enable also failed");
                }
                Err(e)
            }
        }
    }

    async fn reenable(&self, features: FeatureFlags, feature: Feature) -> ClientResult<()> {
        if !features.is_enabled(feature) {
            return Ok(());
        }
        debug!(%feature, "Re-enabling feature");
        self.call_feature(feature, true).await
    }

    async fn call_feature(&self, feature: Feature, enable: bool) -> ClientResult<()> {
        match (feature, enable) {
            (Feature::Methods, true) => self.transport.enable_methods().await,
            (Feature::Methods, false) => self.transport.disable_methods().await,
            (Feature::TwinPatch, true) => self.transport.enable_twin_patch().await,
            (Feature::TwinPatch, false) => self.transport.disable_twin_patch().await,
            (Feature::ReceiveMessage, true) => self.transport.enable_receive_message().await,
            (Feature::ReceiveMessage, false) => self.transport.disable_receive_message().await,
        }
    }

    /// End the session after the refresh loop gave up on the credential
    async fn end_session(&self, failure: ClientError, session: &CancellationToken) {
        let mut state = tokio::select! {
            biased;
            _ = session.cancelled() => return,
            guard = self.state.lock() => guard,
        };
        if state.snapshot.state != ConnectionState::Open {
            return;
        }

        error!(error = %failure.sanitized(), "Ending session after credential refresh failure");
        state.refresh.stop().await;
        if let Err(e) = self.transport.close().await {
            warn!(error = %e.sanitized(), "Transport close failed, continuing");
        }
        self.set_connection(&mut state, ConnectionState::Closed);
        lock_std(&self.health).mark_disconnected();

        if let Some(reason) = refresh_failure_reason(&failure) {
            self.status.emit(ConnectionStatusInfo::disconnected(reason));
        }
    }
}

/// When the refresh loop should first renew; now when the current grant is
/// unavailable
async fn first_refresh_deadline(
    credentials: &dyn CredentialSource,
    cancel: &CancellationToken,
) -> ClientResult<Instant> {
    let current = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(ClientError::Cancelled),
        current = credentials.current() => current,
    };
    match current {
        Ok(grant) => Ok(grant.refresh_deadline()),
        Err(e) => {
            warn!(error = %e.sanitized(), "Current credential unavailable, refreshing now");
            Ok(Instant::now())
        }
    }
}

/// Watch one session: wait for the transport's loss signal, recover, and
/// re-arm on the recovered connection's signal until the session ends.
async fn watch_connection(
    inner: Arc<GuardianInner>,
    mut signal: DisconnectSignal,
    session: CancellationToken,
    mut credential_failures: mpsc::Receiver<ClientError>,
) {
    let mut recoveries: u32 = 0;

    loop {
        let event = tokio::select! {
            biased;
            _ = session.cancelled() => return,
            Some(failure) = credential_failures.recv() => WatchEvent::CredentialFailure(failure),
            lost = signal.wait() => match lost {
                Some(error) => WatchEvent::ConnectionLost(error),
                None => {
                    debug!("Transport closed by caller, watch finished");
                    return;
                }
            },
        };

        match event {
            WatchEvent::ConnectionLost(error) => {
                recoveries += 1;
                let recovered = inner
                    .recover(error, &session)
                    .instrument(crate::recovery_span!(recovery = recoveries))
                    .await;
                match recovered {
                    Some(next) => signal = next,
                    None => return,
                }
            }
            WatchEvent::CredentialFailure(failure) => {
                inner.end_session(failure, &session).await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::NoRetry;
    use crate::testing::MockTransport;

    fn guardian(transport: Arc<MockTransport>) -> ConnectionGuardian {
        ConnectionGuardian::new(
            transport,
            GuardianOptions {
                policy: Arc::new(NoRetry),
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_initial_snapshot() {
        let guardian = guardian(Arc::new(MockTransport::new()));

        assert_eq!(guardian.connection_state(), ConnectionState::Closed);
        assert_eq!(guardian.features(), FeatureFlags::default());
        assert!(!guardian.is_disposed());
        assert!(guardian.last_status().is_none());
        assert!(!guardian.health_metrics().is_connected);
    }

    #[tokio::test]
    async fn test_operations_require_open() {
        let guardian = guardian(Arc::new(MockTransport::new()));
        let cancel = CancellationToken::new();

        assert!(matches!(
            guardian.send_event(&Message::new("x"), &cancel).await,
            Err(ClientError::NotOpen)
        ));
        assert!(matches!(
            guardian.get_twin(&cancel).await,
            Err(ClientError::NotOpen)
        ));
        assert!(matches!(
            guardian.enable_methods(&cancel).await,
            Err(ClientError::NotOpen)
        ));
    }

    #[tokio::test]
    async fn test_open_and_close_publish_snapshots() {
        let guardian = guardian(Arc::new(MockTransport::new()));
        let cancel = CancellationToken::new();

        guardian.open(&cancel).await.unwrap();
        assert_eq!(guardian.connection_state(), ConnectionState::Open);
        assert!(guardian.health_metrics().is_connected);

        guardian.close(&cancel).await.unwrap();
        assert_eq!(guardian.connection_state(), ConnectionState::Closed);
        assert_eq!(
            guardian.last_status(),
            Some(ConnectionStatusInfo::client_closed())
        );
    }

    #[tokio::test]
    async fn test_cancelled_open_reports_nothing() {
        let guardian = guardian(Arc::new(MockTransport::new()));
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(matches!(
            guardian.open(&cancel).await,
            Err(ClientError::Cancelled)
        ));
        assert!(guardian.last_status().is_none());
        assert_eq!(guardian.connection_state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_empty_batch_is_noop() {
        let transport = Arc::new(MockTransport::new());
        let guardian = guardian(transport.clone());
        let cancel = CancellationToken::new();

        guardian.open(&cancel).await.unwrap();
        guardian.send_events(&[], &cancel).await.unwrap();
        assert!(transport.sent_messages().await.is_empty());
    }
}

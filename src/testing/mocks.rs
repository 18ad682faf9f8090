//! Mock implementations for testing
//!
//! Provides a scriptable transport, a credential source and a recording
//! status sink so the connection guardian can be exercised without a hub.

use crate::auth::{CredentialSource, TokenGrant};
use crate::error::{ClientError, ClientResult};
use crate::session::status::{ConnectionStatusInfo, ConnectionStatusSink};
use crate::transport::{
    DisconnectNotifier, DisconnectSignal, Message, MethodResponse, TransportHandler, TwinDocument,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::sync::Mutex;

/// Transport operations counted by [`MockTransport`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockCall {
    Open,
    Close,
    SendEvent,
    SendEvents,
    SendMethodResponse,
    GetTwin,
    UpdateReportedProperties,
    CompleteMessage,
    AbandonMessage,
    RejectMessage,
    EnableMethods,
    DisableMethods,
    EnableTwinPatch,
    DisableTwinPatch,
    EnableReceiveMessage,
    DisableReceiveMessage,
}

/// Mock transport for testing
///
/// Every call is counted. Failures are scripted per operation with
/// [`MockTransport::fail_next`]; unscripted calls succeed.
#[derive(Debug, Default)]
pub struct MockTransport {
    calls: Mutex<HashMap<MockCall, u32>>,
    failures: Mutex<HashMap<MockCall, VecDeque<ClientError>>>,
    notifier: Mutex<Option<DisconnectNotifier>>,
    open_delay: Option<Duration>,
    sent_messages: Mutex<Vec<Message>>,
    method_responses: Mutex<Vec<MethodResponse>>,
    reported_patches: Mutex<Vec<serde_json::Value>>,
    twin: Mutex<TwinDocument>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `open` sleeps this long before completing
    pub fn with_open_delay(delay: Duration) -> Self {
        Self {
            open_delay: Some(delay),
            ..Default::default()
        }
    }

    /// Make the next call to `call` fail with `error`. Queued failures are
    /// consumed in order.
    pub async fn fail_next(&self, call: MockCall, error: ClientError) {
        self.failures
            .lock()
            .await
            .entry(call)
            .or_default()
            .push_back(error);
    }

    /// Queue `times` failures built by `make_error`
    pub async fn fail_times<F>(&self, call: MockCall, times: u32, make_error: F)
    where
        F: Fn() -> ClientError,
    {
        for _ in 0..times {
            self.fail_next(call, make_error()).await;
        }
    }

    pub async fn call_count(&self, call: MockCall) -> u32 {
        self.calls.lock().await.get(&call).copied().unwrap_or(0)
    }

    /// Simulate an unexpected connection loss. Returns `false` when no
    /// connection is being watched.
    pub async fn trigger_disconnect(&self, error: ClientError) -> bool {
        match self.notifier.lock().await.take() {
            Some(notifier) if notifier.is_watched() => {
                notifier.notify(error);
                true
            }
            _ => false,
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.notifier.lock().await.is_some()
    }

    pub async fn sent_messages(&self) -> Vec<Message> {
        self.sent_messages.lock().await.clone()
    }

    pub async fn method_responses(&self) -> Vec<MethodResponse> {
        self.method_responses.lock().await.clone()
    }

    pub async fn reported_patches(&self) -> Vec<serde_json::Value> {
        self.reported_patches.lock().await.clone()
    }

    pub async fn set_twin(&self, twin: TwinDocument) {
        *self.twin.lock().await = twin;
    }

    async fn record(&self, call: MockCall) -> ClientResult<()> {
        *self.calls.lock().await.entry(call).or_insert(0) += 1;
        match self
            .failures
            .lock()
            .await
            .get_mut(&call)
            .and_then(VecDeque::pop_front)
        {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl TransportHandler for MockTransport {
    async fn open(&self) -> ClientResult<DisconnectSignal> {
        if let Some(delay) = self.open_delay {
            tokio::time::sleep(delay).await;
        }
        self.record(MockCall::Open).await?;

        let (notifier, signal) = DisconnectSignal::channel();
        *self.notifier.lock().await = Some(notifier);
        Ok(signal)
    }

    async fn close(&self) -> ClientResult<()> {
        // Dropping the notifier resolves the signal as a clean close
        self.notifier.lock().await.take();
        self.record(MockCall::Close).await
    }

    async fn send_event(&self, message: &Message) -> ClientResult<()> {
        self.record(MockCall::SendEvent).await?;
        self.sent_messages.lock().await.push(message.clone());
        Ok(())
    }

    async fn send_events(&self, messages: &[Message]) -> ClientResult<()> {
        self.record(MockCall::SendEvents).await?;
        self.sent_messages.lock().await.extend_from_slice(messages);
        Ok(())
    }

    async fn send_method_response(&self, response: &MethodResponse) -> ClientResult<()> {
        self.record(MockCall::SendMethodResponse).await?;
        self.method_responses.lock().await.push(response.clone());
        Ok(())
    }

    async fn get_twin(&self) -> ClientResult<TwinDocument> {
        self.record(MockCall::GetTwin).await?;
        Ok(self.twin.lock().await.clone())
    }

    async fn update_reported_properties(
        &self,
        patch: &serde_json::Value,
    ) -> ClientResult<Option<u64>> {
        self.record(MockCall::UpdateReportedProperties).await?;
        let mut patches = self.reported_patches.lock().await;
        patches.push(patch.clone());
        Ok(Some(patches.len() as u64))
    }

    async fn complete_message(&self, _lock_token: &str) -> ClientResult<()> {
        self.record(MockCall::CompleteMessage).await
    }

    async fn abandon_message(&self, _lock_token: &str) -> ClientResult<()> {
        self.record(MockCall::AbandonMessage).await
    }

    async fn reject_message(&self, _lock_token: &str) -> ClientResult<()> {
        self.record(MockCall::RejectMessage).await
    }

    async fn enable_methods(&self) -> ClientResult<()> {
        self.record(MockCall::EnableMethods).await
    }

    async fn disable_methods(&self) -> ClientResult<()> {
        self.record(MockCall::DisableMethods).await
    }

    async fn enable_twin_patch(&self) -> ClientResult<()> {
        self.record(MockCall::EnableTwinPatch).await
    }

    async fn disable_twin_patch(&self) -> ClientResult<()> {
        self.record(MockCall::DisableTwinPatch).await
    }

    async fn enable_receive_message(&self) -> ClientResult<()> {
        self.record(MockCall::EnableReceiveMessage).await
    }

    async fn disable_receive_message(&self) -> ClientResult<()> {
        self.record(MockCall::DisableReceiveMessage).await
    }
}

/// Mock credential source for testing
///
/// Hands out one-hour grants that are due for refresh after `refresh_in`.
/// Refresh failures are scripted with [`MockCredentialSource::fail_next_refresh`].
#[derive(Debug)]
pub struct MockCredentialSource {
    refresh_in: Duration,
    current_delay: Duration,
    refresh_failures: Mutex<VecDeque<ClientError>>,
    current_calls: Mutex<u32>,
    refresh_calls: Mutex<u32>,
}

impl MockCredentialSource {
    pub fn new(refresh_in: Duration) -> Self {
        Self::with_current_delay(refresh_in, Duration::ZERO)
    }

    /// Source whose `current` takes `current_delay` to answer
    pub fn with_current_delay(refresh_in: Duration, current_delay: Duration) -> Self {
        Self {
            refresh_in,
            current_delay,
            refresh_failures: Mutex::new(VecDeque::new()),
            current_calls: Mutex::new(0),
            refresh_calls: Mutex::new(0),
        }
    }

    pub async fn fail_next_refresh(&self, error: ClientError) {
        self.refresh_failures.lock().await.push_back(error);
    }

    pub async fn current_count(&self) -> u32 {
        *self.current_calls.lock().await
    }

    pub async fn refresh_count(&self) -> u32 {
        *self.refresh_calls.lock().await
    }

    fn grant(&self) -> TokenGrant {
        let now = Utc::now();
        let refresh_in =
            chrono::Duration::from_std(self.refresh_in).unwrap_or(chrono::Duration::zero());
        TokenGrant {
            token: format!(
                "SharedAccessSignature sr=mock&sig=mock&se={}",
                (now + chrono::Duration::hours(1)).timestamp()
            ),
            expires_at: now + chrono::Duration::hours(1),
            refresh_at: now + refresh_in,
        }
    }
}

#[async_trait]
impl CredentialSource for MockCredentialSource {
    async fn current(&self) -> ClientResult<TokenGrant> {
        *self.current_calls.lock().await += 1;
        if !self.current_delay.is_zero() {
            tokio::time::sleep(self.current_delay).await;
        }
        Ok(self.grant())
    }

    async fn refresh(&self) -> ClientResult<TokenGrant> {
        *self.refresh_calls.lock().await += 1;
        match self.refresh_failures.lock().await.pop_front() {
            Some(error) => Err(error),
            None => Ok(self.grant()),
        }
    }
}

/// Status sink that records every delivered transition
#[derive(Debug, Default)]
pub struct RecordingStatusSink {
    events: StdMutex<Vec<ConnectionStatusInfo>>,
}

impl RecordingStatusSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ConnectionStatusInfo> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Poll until at least `count` events were recorded or `timeout` passes
    pub async fn wait_for_events(&self, count: usize, timeout: Duration) -> Vec<ConnectionStatusInfo> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let events = self.events();
            if events.len() >= count || tokio::time::Instant::now() >= deadline {
                return events;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

impl ConnectionStatusSink for RecordingStatusSink {
    fn on_connection_status_changed(&self, info: ConnectionStatusInfo) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(info);
    }
}

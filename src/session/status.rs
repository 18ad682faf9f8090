//! Connection status events delivered to the caller
//!
//! The guardian reports every connection transition exactly once, in order,
//! through a caller-supplied [`ConnectionStatusSink`]. The latest value is also
//! kept in a tokio `watch` channel for callers that prefer polling.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Connection status as seen by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
    DisconnectedRetrying,
    Closed,
}

/// Why the connection status changed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatusChangeReason {
    ConnectionOk,
    CommunicationError,
    RetryExpired,
    ClientClosed,
    BadCredential,
    DeviceDisabled,
    ExpiredSasToken,
}

/// One connection status transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatusInfo {
    pub status: ConnectionStatus,
    pub reason: ConnectionStatusChangeReason,
}

impl ConnectionStatusInfo {
    pub fn new(status: ConnectionStatus, reason: ConnectionStatusChangeReason) -> Self {
        Self { status, reason }
    }

    pub fn connected() -> Self {
        Self::new(
            ConnectionStatus::Connected,
            ConnectionStatusChangeReason::ConnectionOk,
        )
    }

    pub fn retrying() -> Self {
        Self::new(
            ConnectionStatus::DisconnectedRetrying,
            ConnectionStatusChangeReason::CommunicationError,
        )
    }

    pub fn disconnected(reason: ConnectionStatusChangeReason) -> Self {
        Self::new(ConnectionStatus::Disconnected, reason)
    }

    pub fn client_closed() -> Self {
        Self::new(
            ConnectionStatus::Closed,
            ConnectionStatusChangeReason::ClientClosed,
        )
    }
}

impl fmt::Display for ConnectionStatusInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}/{:?}", self.status, self.reason)
    }
}

/// Receiver of connection status changes.
///
/// Called synchronously from guardian tasks, so implementations must return
/// quickly and must not panic.
pub trait ConnectionStatusSink: Send + Sync {
    fn on_connection_status_changed(&self, info: ConnectionStatusInfo);
}

impl<F> ConnectionStatusSink for F
where
    F: Fn(ConnectionStatusInfo) + Send + Sync,
{
    fn on_connection_status_changed(&self, info: ConnectionStatusInfo) {
        self(info)
    }
}

/// Fan-out of status transitions to the sink and the watch channel
#[derive(Clone)]
pub struct StatusEmitter {
    sink: Option<Arc<dyn ConnectionStatusSink>>,
    latest_tx: Arc<watch::Sender<Option<ConnectionStatusInfo>>>,
}

impl StatusEmitter {
    pub fn new(sink: Option<Arc<dyn ConnectionStatusSink>>) -> Self {
        let (latest_tx, _) = watch::channel(None);
        Self {
            sink,
            latest_tx: Arc::new(latest_tx),
        }
    }

    /// Deliver a transition. A panicking sink is logged and otherwise ignored.
    pub fn emit(&self, info: ConnectionStatusInfo) {
        match info.status {
            ConnectionStatus::Connected | ConnectionStatus::Closed => {
                info!(status = ?info.status, reason = ?info.reason, "Connection status changed");
            }
            ConnectionStatus::Disconnected | ConnectionStatus::DisconnectedRetrying => {
                warn!(status = ?info.status, reason = ?info.reason, "Connection status changed");
            }
        }

        self.latest_tx.send_replace(Some(info));

        if let Some(sink) = &self.sink {
            let delivered =
                catch_unwind(AssertUnwindSafe(|| sink.on_connection_status_changed(info)));
            if delivered.is_err() {
                error!(status = %info, "Connection status sink panicked");
            }
        }
    }

    /// Most recent transition, if any
    pub fn latest(&self) -> Option<ConnectionStatusInfo> {
        *self.latest_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<ConnectionStatusInfo>> {
        self.latest_tx.subscribe()
    }
}

impl fmt::Debug for StatusEmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusEmitter")
            .field("has_sink", &self.sink.is_some())
            .field("latest", &self.latest())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_emit_reaches_closure_sink_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let sink: Arc<dyn ConnectionStatusSink> =
            Arc::new(move |info: ConnectionStatusInfo| seen_clone.lock().unwrap().push(info));

        let emitter = StatusEmitter::new(Some(sink));
        emitter.emit(ConnectionStatusInfo::connected());
        emitter.emit(ConnectionStatusInfo::retrying());
        emitter.emit(ConnectionStatusInfo::client_closed());

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                ConnectionStatusInfo::connected(),
                ConnectionStatusInfo::retrying(),
                ConnectionStatusInfo::client_closed(),
            ]
        );
    }

    #[test]
    fn test_latest_tracks_last_emission() {
        let emitter = StatusEmitter::new(None);
        assert_eq!(emitter.latest(), None);

        emitter.emit(ConnectionStatusInfo::connected());
        emitter.emit(ConnectionStatusInfo::disconnected(
            ConnectionStatusChangeReason::RetryExpired,
        ));

        assert_eq!(
            emitter.latest(),
            Some(ConnectionStatusInfo::disconnected(
                ConnectionStatusChangeReason::RetryExpired
            ))
        );
    }

    #[test]
    fn test_panicking_sink_is_contained() {
        let sink: Arc<dyn ConnectionStatusSink> =
            Arc::new(|_info: ConnectionStatusInfo| panic!("sink failure"));
        let emitter = StatusEmitter::new(Some(sink));

        emitter.emit(ConnectionStatusInfo::connected());
        assert_eq!(emitter.latest(), Some(ConnectionStatusInfo::connected()));
    }

    #[tokio::test]
    async fn test_subscribe_sees_updates() {
        let emitter = StatusEmitter::new(None);
        let mut rx = emitter.subscribe();

        emitter.emit(ConnectionStatusInfo::connected());
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), Some(ConnectionStatusInfo::connected()));
    }

    #[test]
    fn test_status_display() {
        assert_eq!(
            ConnectionStatusInfo::client_closed().to_string(),
            "Closed/ClientClosed"
        );
    }
}

//! Transport layer for hub communication
//!
//! [`TransportHandler`] is the narrow capability the connection guardian wraps:
//! open/close, unary sends, twin requests and feature subscriptions for one
//! wire protocol. Handlers never retry and never reconnect on their own; loss
//! of the connection is reported once through the [`DisconnectSignal`]
//! returned by `open`.

use crate::error::{ClientError, ClientResult};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::oneshot;

pub mod mqtt;

/// Capability-typed transport primitive for one wire protocol
///
/// Callers cancel an in-flight operation by dropping its future; methods take
/// no cancellation token of their own.
#[async_trait::async_trait]
pub trait TransportHandler: Send + Sync {
    /// Establish the connection and return its loss signal
    async fn open(&self) -> ClientResult<DisconnectSignal>;

    /// Tear the connection down. Must tolerate being called when not open.
    async fn close(&self) -> ClientResult<()>;

    /// Send one device-to-cloud message
    async fn send_event(&self, message: &Message) -> ClientResult<()>;

    /// Send a batch of device-to-cloud messages
    async fn send_events(&self, messages: &[Message]) -> ClientResult<()>;

    /// Answer a direct-method invocation
    async fn send_method_response(&self, response: &MethodResponse) -> ClientResult<()>;

    /// Fetch the full twin document
    async fn get_twin(&self) -> ClientResult<TwinDocument>;

    /// Patch reported properties; returns the new reported version when known
    async fn update_reported_properties(
        &self,
        patch: &serde_json::Value,
    ) -> ClientResult<Option<u64>>;

    /// Settle a cloud-to-device message as processed
    async fn complete_message(&self, lock_token: &str) -> ClientResult<()>;

    /// Return a cloud-to-device message to the queue
    async fn abandon_message(&self, lock_token: &str) -> ClientResult<()>;

    /// Dead-letter a cloud-to-device message
    async fn reject_message(&self, lock_token: &str) -> ClientResult<()>;

    async fn enable_methods(&self) -> ClientResult<()>;
    async fn disable_methods(&self) -> ClientResult<()>;
    async fn enable_twin_patch(&self) -> ClientResult<()>;
    async fn disable_twin_patch(&self) -> ClientResult<()>;
    async fn enable_receive_message(&self) -> ClientResult<()>;
    async fn disable_receive_message(&self) -> ClientResult<()>;
}

/// Fires at most once per opened connection.
///
/// Resolves to `Some(error)` when the transport lost the connection on its
/// own, and to `None` when the sending side was dropped, which is what a
/// caller-initiated close does.
#[derive(Debug)]
pub struct DisconnectSignal {
    rx: oneshot::Receiver<ClientError>,
}

/// Sending half of a [`DisconnectSignal`], kept by the transport
#[derive(Debug)]
pub struct DisconnectNotifier {
    tx: oneshot::Sender<ClientError>,
}

impl DisconnectSignal {
    pub fn channel() -> (DisconnectNotifier, DisconnectSignal) {
        let (tx, rx) = oneshot::channel();
        (DisconnectNotifier { tx }, DisconnectSignal { rx })
    }

    /// Wait for the connection to end
    pub async fn wait(self) -> Option<ClientError> {
        self.rx.await.ok()
    }
}

impl DisconnectNotifier {
    /// Report an unexpected loss. Consumes the notifier so it fires once.
    pub fn notify(self, error: ClientError) {
        // Receiver gone means nobody is watching this connection any more
        let _ = self.tx.send(error);
    }

    pub fn is_watched(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Device-to-cloud or cloud-to-device message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub body: Bytes,
    pub message_id: String,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub properties: HashMap<String, String>,
    /// Set on received messages; used to complete/abandon/reject
    pub lock_token: Option<String>,
}

impl Message {
    pub fn new<B: Into<Bytes>>(body: B) -> Self {
        Self {
            body: body.into(),
            message_id: uuid::Uuid::new_v4().to_string(),
            content_type: None,
            content_encoding: None,
            properties: HashMap::new(),
            lock_token: None,
        }
    }

    /// JSON message with UTF-8 encoding
    pub fn json(value: &serde_json::Value) -> ClientResult<Self> {
        let body = serde_json::to_vec(value)?;
        Ok(Self::new(body)
            .with_content_type("application/json")
            .with_content_encoding("utf-8"))
    }

    pub fn with_content_type<S: Into<String>>(mut self, content_type: S) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_content_encoding<S: Into<String>>(mut self, encoding: S) -> Self {
        self.content_encoding = Some(encoding.into());
        self
    }

    pub fn with_property<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// Device twin: desired and reported property sections
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TwinDocument {
    #[serde(default)]
    pub desired: serde_json::Value,
    #[serde(default)]
    pub reported: serde_json::Value,
}

impl TwinDocument {
    /// `$version` of the desired section, if present
    pub fn desired_version(&self) -> Option<u64> {
        self.desired.get("$version").and_then(|v| v.as_u64())
    }
}

/// Direct-method invocation from the cloud
#[derive(Debug, Clone, PartialEq)]
pub struct MethodRequest {
    pub name: String,
    pub request_id: String,
    pub payload: Bytes,
}

/// Reply to a [`MethodRequest`]
#[derive(Debug, Clone, PartialEq)]
pub struct MethodResponse {
    pub request_id: String,
    pub status: u16,
    pub payload: Bytes,
}

impl MethodResponse {
    pub fn new<B: Into<Bytes>>(request_id: impl Into<String>, status: u16, payload: B) -> Self {
        Self {
            request_id: request_id.into(),
            status,
            payload: payload.into(),
        }
    }
}

/// Desired-property patch pushed by the cloud
#[derive(Debug, Clone, PartialEq)]
pub struct DesiredPropertyPatch {
    pub version: Option<u64>,
    pub patch: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_disconnect_signal_fires_error() {
        let (notifier, signal) = DisconnectSignal::channel();
        assert!(notifier.is_watched());
        notifier.notify(ClientError::communication("socket closed"));

        let error = signal.wait().await;
        assert!(matches!(error, Some(ClientError::Communication { .. })));
    }

    #[tokio::test]
    async fn test_dropped_notifier_means_clean_close() {
        let (notifier, signal) = DisconnectSignal::channel();
        drop(notifier);
        assert!(signal.wait().await.is_none());
    }

    #[test]
    fn test_notifier_sees_dropped_signal() {
        let (notifier, signal) = DisconnectSignal::channel();
        drop(signal);
        assert!(!notifier.is_watched());
    }

    #[test]
    fn test_json_message() {
        let message = Message::json(&json!({"temperature": 21.5}))
            .unwrap()
            .with_property("alert", "false");

        assert_eq!(message.content_type.as_deref(), Some("application/json"));
        assert_eq!(message.content_encoding.as_deref(), Some("utf-8"));
        assert_eq!(message.properties.get("alert").map(String::as_str), Some("false"));
        assert!(!message.message_id.is_empty());
        assert_eq!(&message.body[..], br#"{"temperature":21.5}"#);
    }

    #[test]
    fn test_twin_desired_version() {
        let twin: TwinDocument = serde_json::from_value(json!({
            "desired": {"interval": 5, "$version": 7},
            "reported": {"$version": 3}
        }))
        .unwrap();
        assert_eq!(twin.desired_version(), Some(7));
    }
}

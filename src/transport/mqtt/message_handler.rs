//! Pure routing of inbound hub traffic
//!
//! Topic classification and payload decoding live here; the only I/O is the
//! [`MessageForwarder`] handing decoded traffic to the application.

use crate::transport::{DesiredPropertyPatch, Message, MethodRequest};
use rumqttc::{Event, Outgoing, Packet, Publish, SubscribeReasonCode};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use url::form_urlencoded;

/// Classification of an inbound publish topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundTopic {
    /// `$iothub/methods/POST/{name}/?$rid={rid}`
    MethodRequest { name: String, request_id: String },
    /// `$iothub/twin/res/{status}/?$rid={rid}[&$version={v}]`
    TwinResponse {
        status: u16,
        request_id: String,
        version: Option<u64>,
    },
    /// `$iothub/twin/PATCH/properties/desired/?$version={v}`
    DesiredPatch { version: Option<u64> },
    /// `devices/{id}/messages/devicebound/{property bag}`
    CloudMessage { properties: HashMap<String, String> },
    Unknown,
}

/// Routing decisions for rumqttc events
#[derive(Debug, Clone)]
pub enum EventRoute {
    ConnectionAcknowledged,
    Publish(Publish),
    /// SUBSCRIBE or UNSUBSCRIBE written with the packet id rumqttc assigned
    SubscriptionRequestSent { packet_id: u16 },
    /// SubAck accepting every filter
    SubscriptionConfirmed { packet_id: u16 },
    /// Any rejected subscription in a SubAck
    SubscriptionRejected { packet_id: u16 },
    UnsubscribeConfirmed { packet_id: u16 },
    /// Broker sent DISCONNECT
    Disconnected,
    /// Our DISCONNECT was written to the socket
    DisconnectSent,
    /// PingResp, PubAck, outgoing packets and the like
    Infrastructure,
}

/// Pure message routing decisions
pub struct MessageHandler;

impl MessageHandler {
    pub fn route_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(Packet::ConnAck(_)) => EventRoute::ConnectionAcknowledged,
            Event::Incoming(Packet::Publish(publish)) => EventRoute::Publish(publish.clone()),
            Event::Incoming(Packet::SubAck(ack)) => {
                if ack
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure))
                {
                    EventRoute::SubscriptionRejected { packet_id: ack.pkid }
                } else {
                    EventRoute::SubscriptionConfirmed { packet_id: ack.pkid }
                }
            }
            Event::Incoming(Packet::UnsubAck(ack)) => {
                EventRoute::UnsubscribeConfirmed { packet_id: ack.pkid }
            }
            Event::Outgoing(Outgoing::Subscribe(packet_id))
            | Event::Outgoing(Outgoing::Unsubscribe(packet_id)) => {
                EventRoute::SubscriptionRequestSent {
                    packet_id: *packet_id,
                }
            }
            Event::Incoming(Packet::Disconnect) => EventRoute::Disconnected,
            Event::Outgoing(Outgoing::Disconnect) => EventRoute::DisconnectSent,
            _ => EventRoute::Infrastructure,
        }
    }

    /// Classify an inbound topic for `device_id` (pure function)
    pub fn classify_topic(topic: &str, device_id: &str) -> InboundTopic {
        let (path, query) = match topic.split_once('?') {
            Some((path, query)) => (path, query),
            None => (topic, ""),
        };
        let params: HashMap<String, String> = form_urlencoded::parse(query.as_bytes())
            .into_owned()
            .collect();

        if let Some(rest) = path.strip_prefix("$iothub/methods/POST/") {
            let name = rest.trim_end_matches('/');
            return match params.get("$rid") {
                Some(rid) if !name.is_empty() => InboundTopic::MethodRequest {
                    name: name.to_string(),
                    request_id: rid.clone(),
                },
                _ => InboundTopic::Unknown,
            };
        }

        if let Some(rest) = path.strip_prefix("$iothub/twin/res/") {
            let status = rest.trim_end_matches('/').parse::<u16>();
            return match (status, params.get("$rid")) {
                (Ok(status), Some(rid)) => InboundTopic::TwinResponse {
                    status,
                    request_id: rid.clone(),
                    version: parse_version(&params),
                },
                _ => InboundTopic::Unknown,
            };
        }

        if path.starts_with("$iothub/twin/PATCH/properties/desired/") {
            return InboundTopic::DesiredPatch {
                version: parse_version(&params),
            };
        }

        let c2d_prefix = format!("devices/{device_id}/messages/devicebound/");
        if let Some(bag) = topic.strip_prefix(&c2d_prefix) {
            let properties = form_urlencoded::parse(bag.as_bytes())
                .into_owned()
                .collect();
            return InboundTopic::CloudMessage { properties };
        }

        InboundTopic::Unknown
    }

    /// Build a received message from its property bag (pure function).
    /// System properties (`$.mid`, `$.ct`, `$.ce`) populate the message
    /// fields and everything else lands in `properties`.
    pub fn decode_cloud_message(
        payload: bytes::Bytes,
        mut properties: HashMap<String, String>,
    ) -> Message {
        let mut message = Message::new(payload);
        if let Some(id) = properties.remove("$.mid") {
            message.message_id = id;
        }
        message.content_type = properties.remove("$.ct");
        message.content_encoding = properties.remove("$.ce");
        message.lock_token = Some(message.message_id.clone());
        properties.retain(|key, _| !key.starts_with("$."));
        message.properties = properties;
        message
    }

    /// Decode a desired-property patch payload (pure function)
    pub fn decode_desired_patch(
        payload: &[u8],
        version: Option<u64>,
    ) -> Result<DesiredPropertyPatch, serde_json::Error> {
        let patch: serde_json::Value = serde_json::from_slice(payload)?;
        let version = version.or_else(|| patch.get("$version").and_then(|v| v.as_u64()));
        Ok(DesiredPropertyPatch { version, patch })
    }
}

fn parse_version(params: &HashMap<String, String>) -> Option<u64> {
    params.get("$version").and_then(|v| v.parse().ok())
}

/// Receiving ends for inbound hub traffic
#[derive(Debug)]
pub struct InboundReceivers {
    pub method_requests: mpsc::Receiver<MethodRequest>,
    pub desired_patches: mpsc::Receiver<DesiredPropertyPatch>,
    pub messages: mpsc::Receiver<Message>,
}

/// Hands decoded inbound traffic to the application (impure I/O)
#[derive(Debug, Clone)]
pub struct MessageForwarder {
    method_requests: mpsc::Sender<MethodRequest>,
    desired_patches: mpsc::Sender<DesiredPropertyPatch>,
    messages: mpsc::Sender<Message>,
}

impl MessageForwarder {
    pub fn channel(capacity: usize) -> (Self, InboundReceivers) {
        let (method_tx, method_rx) = mpsc::channel(capacity);
        let (patch_tx, patch_rx) = mpsc::channel(capacity);
        let (message_tx, message_rx) = mpsc::channel(capacity);
        (
            Self {
                method_requests: method_tx,
                desired_patches: patch_tx,
                messages: message_tx,
            },
            InboundReceivers {
                method_requests: method_rx,
                desired_patches: patch_rx,
                messages: message_rx,
            },
        )
    }

    pub async fn forward_method(&self, request: MethodRequest) {
        debug!(method = %request.name, request_id = %request.request_id, "Forwarding method request");
        if self.method_requests.send(request).await.is_err() {
            warn!("Method request dropped: receiver closed");
        }
    }

    pub async fn forward_patch(&self, patch: DesiredPropertyPatch) {
        debug!(version = ?patch.version, "Forwarding desired property patch");
        if self.desired_patches.send(patch).await.is_err() {
            warn!("Desired property patch dropped: receiver closed");
        }
    }

    pub async fn forward_message(&self, message: Message) {
        debug!(message_id = %message.message_id, "Forwarding cloud message");
        if self.messages.send(message).await.is_err() {
            warn!("Cloud message dropped: receiver closed");
        }
    }
}

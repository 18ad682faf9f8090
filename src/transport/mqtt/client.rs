//! Impure I/O half of the MQTT transport
//!
//! [`MqttTransport`] owns at most one live rumqttc connection. Each `open`
//! fetches the current credentials, waits for the ConnAck and hands the
//! event loop to a background task that routes inbound traffic and fires the
//! connection's [`DisconnectSignal`] when the socket dies.
//!
//! Subscriptions only count as done once the hub acknowledges them. rumqttc
//! assigns packet ids inside the event loop, so waiters are queued in request
//! order and bound to a packet id when the event loop reports the outgoing
//! SUBSCRIBE or UNSUBSCRIBE.

use super::connection::{
    configure_mqtt_options, map_connection_error, map_twin_status, MqttSettings, TopicBuilder,
};
use super::message_handler::{
    EventRoute, InboundReceivers, InboundTopic, MessageForwarder, MessageHandler,
};
use crate::auth::CredentialSource;
use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::transport::{
    DisconnectNotifier, DisconnectSignal, Message, MethodRequest, MethodResponse,
    TransportHandler, TwinDocument,
};
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{AsyncClient, ClientError as MqttClientError, EventLoop, Publish, QoS};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Capacity of rumqttc's request channel
const REQUEST_CHANNEL_CAPACITY: usize = 64;

/// Capacity of each inbound channel handed to the application
const INBOUND_CHANNEL_CAPACITY: usize = 32;

/// How long `close` waits for DISCONNECT to be flushed
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Twin response routed back to the waiting request
#[derive(Debug)]
struct TwinReply {
    status: u16,
    version: Option<u64>,
    payload: Bytes,
}

type PendingTwinRequests = Arc<StdMutex<HashMap<String, oneshot::Sender<TwinReply>>>>;

fn lock_pending(
    pending: &PendingTwinRequests,
) -> MutexGuard<'_, HashMap<String, oneshot::Sender<TwinReply>>> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Removes a twin request from the pending table when the caller stops
/// waiting, whether it got a reply, timed out or was dropped
struct PendingGuard {
    pending: PendingTwinRequests,
    request_id: String,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        lock_pending(&self.pending).remove(&self.request_id);
    }
}

type AckWaiter = oneshot::Sender<ClientResult<()>>;

/// Waiters for SubAck and UnsubAck
#[derive(Default)]
struct SubscriptionTracker {
    /// Requests handed to rumqttc but not yet written, in request order
    queued: VecDeque<AckWaiter>,
    /// Written requests keyed by packet id
    in_flight: HashMap<u16, AckWaiter>,
}

impl SubscriptionTracker {
    fn enqueue(&mut self, waiter: AckWaiter) {
        self.queued.push_back(waiter);
    }

    /// Undo the latest `enqueue` when its request never reached rumqttc
    fn withdraw_last(&mut self) {
        self.queued.pop_back();
    }

    fn sent(&mut self, packet_id: u16) {
        match self.queued.pop_front() {
            Some(waiter) => {
                self.in_flight.insert(packet_id, waiter);
            }
            None => debug!(packet_id, "Subscription request with no waiter"),
        }
    }

    fn acknowledged(&mut self, packet_id: u16, result: ClientResult<()>) {
        match self.in_flight.remove(&packet_id) {
            Some(waiter) => {
                let _ = waiter.send(result);
            }
            None => debug!(packet_id, "Subscription acknowledgement with no waiter"),
        }
    }

    fn clear(&mut self) {
        self.queued.clear();
        self.in_flight.clear();
    }
}

type PendingSubscriptions = Arc<StdMutex<SubscriptionTracker>>;

fn lock_subscriptions(pending: &PendingSubscriptions) -> MutexGuard<'_, SubscriptionTracker> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

enum SubscriptionRequest {
    Subscribe(String, QoS),
    Unsubscribe(String),
}

/// One live connection
struct ActiveConnection {
    client: AsyncClient,
    pending: PendingTwinRequests,
    subscriptions: PendingSubscriptions,
    /// Keeps tracker order equal to rumqttc's request order
    request_order: Arc<Mutex<()>>,
    closing: CancellationToken,
    handle: JoinHandle<()>,
}

/// State shared with the event loop task
struct EventLoopContext {
    device_id: String,
    pending: PendingTwinRequests,
    subscriptions: PendingSubscriptions,
    forwarder: MessageForwarder,
    closing: CancellationToken,
}

/// IoT hub transport over MQTT 3.1.1
pub struct MqttTransport {
    settings: MqttSettings,
    credentials: Arc<dyn CredentialSource>,
    forwarder: MessageForwarder,
    active: Mutex<Option<ActiveConnection>>,
    request_counter: AtomicU64,
}

impl std::fmt::Debug for MqttTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttTransport")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl MqttTransport {
    /// Create the transport and the receivers for inbound method requests,
    /// desired-property patches and cloud messages
    pub fn new(
        settings: MqttSettings,
        credentials: Arc<dyn CredentialSource>,
    ) -> (Self, InboundReceivers) {
        let (forwarder, inbound) = MessageForwarder::channel(INBOUND_CHANNEL_CAPACITY);
        let transport = Self {
            settings,
            credentials,
            forwarder,
            active: Mutex::new(None),
            request_counter: AtomicU64::new(1),
        };
        (transport, inbound)
    }

    pub fn from_config(
        config: &ClientConfig,
        credentials: Arc<dyn CredentialSource>,
    ) -> ClientResult<(Self, InboundReceivers)> {
        let settings = MqttSettings::from_config(config)?;
        Ok(Self::new(settings, credentials))
    }

    pub fn settings(&self) -> &MqttSettings {
        &self.settings
    }

    fn next_request_id(&self) -> String {
        self.request_counter.fetch_add(1, Ordering::Relaxed).to_string()
    }

    async fn client(&self) -> ClientResult<AsyncClient> {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|active| active.client.clone())
            .ok_or(ClientError::NotOpen)
    }

    async fn publish(&self, topic: String, qos: QoS, payload: Vec<u8>) -> ClientResult<()> {
        let client = self.client().await?;
        client
            .publish(topic, qos, false, payload)
            .await
            .map_err(map_request_error)
    }

    async fn subscribe(&self, topic: String, qos: QoS) -> ClientResult<()> {
        debug!(topic = %topic, "Subscribing");
        self.acknowledged_request(SubscriptionRequest::Subscribe(topic, qos), "subscribe")
            .await
    }

    async fn unsubscribe(&self, topic: String) -> ClientResult<()> {
        debug!(topic = %topic, "Unsubscribing");
        self.acknowledged_request(SubscriptionRequest::Unsubscribe(topic), "unsubscribe")
            .await
    }

    /// Send a SUBSCRIBE or UNSUBSCRIBE and wait for the hub's acknowledgement
    async fn acknowledged_request(
        &self,
        request: SubscriptionRequest,
        operation: &str,
    ) -> ClientResult<()> {
        let (client, subscriptions, request_order) = {
            let active = self.active.lock().await;
            let active = active.as_ref().ok_or(ClientError::NotOpen)?;
            (
                active.client.clone(),
                active.subscriptions.clone(),
                active.request_order.clone(),
            )
        };

        let (tx, rx) = oneshot::channel();
        {
            let _order = request_order.lock().await;
            lock_subscriptions(&subscriptions).enqueue(tx);
            let queued = match request {
                SubscriptionRequest::Subscribe(topic, qos) => client.subscribe(topic, qos).await,
                SubscriptionRequest::Unsubscribe(topic) => client.unsubscribe(topic).await,
            };
            if let Err(e) = queued {
                lock_subscriptions(&subscriptions).withdraw_last();
                return Err(map_request_error(e));
            }
        }

        match tokio::time::timeout(self.settings.operation_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClientError::communication(format!(
                "Connection lost while awaiting {operation} acknowledgement"
            ))),
            Err(_) => Err(ClientError::timeout(operation)),
        }
    }

    /// Publish a twin request and wait for the response with the same `$rid`
    async fn twin_request(
        &self,
        topic: impl FnOnce(&str) -> String,
        payload: Vec<u8>,
        operation: &str,
    ) -> ClientResult<TwinReply> {
        let (client, pending) = {
            let active = self.active.lock().await;
            let active = active.as_ref().ok_or(ClientError::NotOpen)?;
            (active.client.clone(), active.pending.clone())
        };

        let request_id = self.next_request_id();
        let (tx, rx) = oneshot::channel();
        lock_pending(&pending).insert(request_id.clone(), tx);
        let _guard = PendingGuard {
            pending,
            request_id: request_id.clone(),
        };

        client
            .publish(topic(&request_id), QoS::AtMostOnce, false, payload)
            .await
            .map_err(map_request_error)?;

        let reply = match tokio::time::timeout(self.settings.operation_timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => {
                return Err(ClientError::communication(format!(
                    "Connection lost while awaiting {operation} response"
                )))
            }
            Err(_) => return Err(ClientError::timeout(operation)),
        };

        map_twin_status(reply.status, operation)?;
        Ok(reply)
    }

    /// Tear down any live connection without reporting it as lost
    async fn shutdown_active(&self) {
        let Some(active) = self.active.lock().await.take() else {
            return;
        };

        active.closing.cancel();
        if let Err(e) = active.client.disconnect().await {
            debug!(error = %e, "Event loop already stopped");
        }

        let mut handle = active.handle;
        if tokio::time::timeout(CLOSE_GRACE, &mut handle).await.is_err() {
            warn!("MQTT event loop did not stop in time, aborting");
            handle.abort();
        }
    }
}

#[async_trait]
impl TransportHandler for MqttTransport {
    async fn open(&self) -> ClientResult<DisconnectSignal> {
        self.shutdown_active().await;

        let grant = self.credentials.current().await?;
        let options = configure_mqtt_options(&self.settings, &grant.token)?;
        let (client, mut event_loop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);

        info!(
            device_id = %self.settings.device_id,
            endpoint = %self.settings.endpoint,
            "Connecting to IoT hub"
        );
        match tokio::time::timeout(
            self.settings.operation_timeout,
            wait_for_connack(&mut event_loop),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(ClientError::timeout("MQTT connect")),
        }

        let (notifier, signal) = DisconnectSignal::channel();
        let pending = PendingTwinRequests::default();
        let subscriptions = PendingSubscriptions::default();
        let closing = CancellationToken::new();
        let context = EventLoopContext {
            device_id: self.settings.device_id.clone(),
            pending: pending.clone(),
            subscriptions: subscriptions.clone(),
            forwarder: self.forwarder.clone(),
            closing: closing.clone(),
        };
        let handle = tokio::spawn(run_event_loop(event_loop, context, notifier));

        *self.active.lock().await = Some(ActiveConnection {
            client,
            pending,
            subscriptions,
            request_order: Arc::new(Mutex::new(())),
            closing,
            handle,
        });

        // Twin GET and reported-property PATCH both answer on this topic
        if let Err(e) = self
            .subscribe(
                TopicBuilder::twin_response_subscription().to_string(),
                QoS::AtMostOnce,
            )
            .await
        {
            self.shutdown_active().await;
            return Err(e);
        }

        info!(device_id = %self.settings.device_id, "Connected to IoT hub");
        Ok(signal)
    }

    async fn close(&self) -> ClientResult<()> {
        self.shutdown_active().await;
        debug!(device_id = %self.settings.device_id, "MQTT connection closed");
        Ok(())
    }

    async fn send_event(&self, message: &Message) -> ClientResult<()> {
        let topic = TopicBuilder::build_event_topic(&self.settings.device_id, message);
        self.publish(topic, QoS::AtLeastOnce, message.body.to_vec())
            .await
    }

    async fn send_events(&self, messages: &[Message]) -> ClientResult<()> {
        for message in messages {
            self.send_event(message).await?;
        }
        Ok(())
    }

    async fn send_method_response(&self, response: &MethodResponse) -> ClientResult<()> {
        let topic = TopicBuilder::build_method_response_topic(response.status, &response.request_id);
        self.publish(topic, QoS::AtMostOnce, response.payload.to_vec())
            .await
    }

    async fn get_twin(&self) -> ClientResult<TwinDocument> {
        let reply = self
            .twin_request(TopicBuilder::build_twin_get_topic, Vec::new(), "twin GET")
            .await?;
        Ok(serde_json::from_slice(&reply.payload)?)
    }

    async fn update_reported_properties(
        &self,
        patch: &serde_json::Value,
    ) -> ClientResult<Option<u64>> {
        let payload = serde_json::to_vec(patch)?;
        let reply = self
            .twin_request(
                TopicBuilder::build_reported_patch_topic,
                payload,
                "reported properties PATCH",
            )
            .await?;
        Ok(reply.version)
    }

    async fn complete_message(&self, lock_token: &str) -> ClientResult<()> {
        // QoS 1 deliveries are acknowledged by rumqttc on receipt
        debug!(lock_token = %lock_token, "Cloud message completed");
        Ok(())
    }

    async fn abandon_message(&self, _lock_token: &str) -> ClientResult<()> {
        Err(ClientError::unsupported("abandon message over MQTT"))
    }

    async fn reject_message(&self, _lock_token: &str) -> ClientResult<()> {
        Err(ClientError::unsupported("reject message over MQTT"))
    }

    async fn enable_methods(&self) -> ClientResult<()> {
        self.subscribe(
            TopicBuilder::methods_subscription().to_string(),
            QoS::AtMostOnce,
        )
        .await
    }

    async fn disable_methods(&self) -> ClientResult<()> {
        self.unsubscribe(TopicBuilder::methods_subscription().to_string())
            .await
    }

    async fn enable_twin_patch(&self) -> ClientResult<()> {
        self.subscribe(
            TopicBuilder::desired_patch_subscription().to_string(),
            QoS::AtMostOnce,
        )
        .await
    }

    async fn disable_twin_patch(&self) -> ClientResult<()> {
        self.unsubscribe(TopicBuilder::desired_patch_subscription().to_string())
            .await
    }

    async fn enable_receive_message(&self) -> ClientResult<()> {
        self.subscribe(
            TopicBuilder::build_c2d_subscription(&self.settings.device_id),
            QoS::AtLeastOnce,
        )
        .await
    }

    async fn disable_receive_message(&self) -> ClientResult<()> {
        self.unsubscribe(TopicBuilder::build_c2d_subscription(
            &self.settings.device_id,
        ))
        .await
    }
}

fn map_request_error(error: MqttClientError) -> ClientError {
    ClientError::communication(format!("MQTT request failed: {error}"))
}

async fn wait_for_connack(event_loop: &mut EventLoop) -> ClientResult<()> {
    loop {
        match event_loop.poll().await {
            Ok(event) => {
                if let EventRoute::ConnectionAcknowledged = MessageHandler::route_event(&event) {
                    return Ok(());
                }
            }
            Err(e) => return Err(map_connection_error(&e)),
        }
    }
}

async fn run_event_loop(
    mut event_loop: EventLoop,
    context: EventLoopContext,
    notifier: DisconnectNotifier,
) {
    loop {
        match event_loop.poll().await {
            Ok(event) => match MessageHandler::route_event(&event) {
                EventRoute::Publish(publish) => context.dispatch(publish).await,
                route @ (EventRoute::SubscriptionRequestSent { .. }
                | EventRoute::SubscriptionConfirmed { .. }
                | EventRoute::UnsubscribeConfirmed { .. }
                | EventRoute::SubscriptionRejected { .. }) => context.track_subscription(&route),
                EventRoute::DisconnectSent => {
                    debug!("DISCONNECT flushed");
                    break;
                }
                EventRoute::Disconnected => {
                    if !context.closing.is_cancelled() {
                        notifier.notify(ClientError::communication("Hub closed the connection"));
                    }
                    break;
                }
                EventRoute::ConnectionAcknowledged | EventRoute::Infrastructure => {}
            },
            Err(e) => {
                if !context.closing.is_cancelled() {
                    let error = map_connection_error(&e);
                    warn!(error = %error, "MQTT connection lost");
                    notifier.notify(error);
                }
                break;
            }
        }
    }

    // Waiters on this connection's requests see a closed channel
    lock_pending(&context.pending).clear();
    lock_subscriptions(&context.subscriptions).clear();
}

impl EventLoopContext {
    fn track_subscription(&self, route: &EventRoute) {
        let mut subscriptions = lock_subscriptions(&self.subscriptions);
        match *route {
            EventRoute::SubscriptionRequestSent { packet_id } => subscriptions.sent(packet_id),
            EventRoute::SubscriptionConfirmed { packet_id }
            | EventRoute::UnsubscribeConfirmed { packet_id } => {
                subscriptions.acknowledged(packet_id, Ok(()))
            }
            EventRoute::SubscriptionRejected { packet_id } => {
                warn!(packet_id, "Hub rejected subscription");
                subscriptions.acknowledged(
                    packet_id,
                    Err(ClientError::unauthorized("Hub rejected subscription")),
                );
            }
            _ => {}
        }
    }

    async fn dispatch(&self, publish: Publish) {
        match MessageHandler::classify_topic(&publish.topic, &self.device_id) {
            InboundTopic::TwinResponse {
                status,
                request_id,
                version,
            } => {
                let waiter = lock_pending(&self.pending).remove(&request_id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(TwinReply {
                            status,
                            version,
                            payload: publish.payload,
                        });
                    }
                    None => debug!(request_id = %request_id, "Twin response with no waiter"),
                }
            }
            InboundTopic::MethodRequest { name, request_id } => {
                self.forwarder
                    .forward_method(MethodRequest {
                        name,
                        request_id,
                        payload: publish.payload,
                    })
                    .await;
            }
            InboundTopic::DesiredPatch { version } => {
                match MessageHandler::decode_desired_patch(&publish.payload, version) {
                    Ok(patch) => self.forwarder.forward_patch(patch).await,
                    Err(e) => warn!(error = %e, "Malformed desired property patch"),
                }
            }
            InboundTopic::CloudMessage { properties } => {
                let message = MessageHandler::decode_cloud_message(publish.payload, properties);
                self.forwarder.forward_message(message).await;
            }
            InboundTopic::Unknown => {
                debug!(topic = %publish.topic, "Ignoring publish on unexpected topic");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockCredentialSource;
    use rumqttc::{Event, Outgoing, Packet, SubAck, SubscribeReasonCode, UnsubAck};
    use url::Url;

    fn transport(endpoint: &str) -> (MqttTransport, InboundReceivers) {
        let settings = MqttSettings {
            device_id: "dev1".to_string(),
            hub_hostname: "hub.example.net".to_string(),
            endpoint: Url::parse(endpoint).unwrap(),
            keep_alive: Duration::from_secs(30),
            operation_timeout: Duration::from_millis(500),
        };
        MqttTransport::new(
            settings,
            Arc::new(MockCredentialSource::new(Duration::from_secs(60))),
        )
    }

    #[tokio::test]
    async fn test_operations_require_open_connection() {
        let (transport, _inbound) = transport("mqtt://127.0.0.1:1");

        assert!(matches!(
            transport.send_event(&Message::new("x")).await,
            Err(ClientError::NotOpen)
        ));
        assert!(matches!(transport.get_twin().await, Err(ClientError::NotOpen)));
        assert!(matches!(
            transport.enable_methods().await,
            Err(ClientError::NotOpen)
        ));
        // Closing a transport that never opened is a no-op
        assert!(transport.close().await.is_ok());
    }

    #[tokio::test]
    async fn test_open_against_unreachable_broker_is_transient() {
        let (transport, _inbound) = transport("mqtt://127.0.0.1:1");

        let error = transport.open().await.unwrap_err();
        assert!(error.is_transient(), "unexpected error: {error:?}");
        assert!(matches!(transport.client().await, Err(ClientError::NotOpen)));
    }

    #[tokio::test]
    async fn test_abandon_and_reject_unsupported() {
        let (transport, _inbound) = transport("mqtt://127.0.0.1:1");

        assert!(transport.complete_message("m-1").await.is_ok());
        assert!(matches!(
            transport.abandon_message("m-1").await,
            Err(ClientError::Unsupported { .. })
        ));
        assert!(matches!(
            transport.reject_message("m-1").await,
            Err(ClientError::Unsupported { .. })
        ));
    }

    fn context(forwarder: MessageForwarder) -> EventLoopContext {
        EventLoopContext {
            device_id: "dev1".to_string(),
            pending: PendingTwinRequests::default(),
            subscriptions: PendingSubscriptions::default(),
            forwarder,
            closing: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_subscription_acks_resolve_waiters_in_request_order() {
        let (forwarder, _inbound) = MessageForwarder::channel(4);
        let context = context(forwarder);

        let (methods_tx, methods_rx) = oneshot::channel();
        let (patch_tx, patch_rx) = oneshot::channel();
        {
            let mut subscriptions = lock_subscriptions(&context.subscriptions);
            subscriptions.enqueue(methods_tx);
            subscriptions.enqueue(patch_tx);
        }

        for event in [
            Event::Outgoing(Outgoing::Subscribe(11)),
            Event::Outgoing(Outgoing::Subscribe(12)),
            Event::Incoming(Packet::SubAck(SubAck::new(
                12,
                vec![SubscribeReasonCode::Failure],
            ))),
            Event::Incoming(Packet::SubAck(SubAck::new(
                11,
                vec![SubscribeReasonCode::Success(QoS::AtMostOnce)],
            ))),
        ] {
            context.track_subscription(&MessageHandler::route_event(&event));
        }

        assert!(methods_rx.await.unwrap().is_ok());
        assert!(matches!(
            patch_rx.await.unwrap(),
            Err(ClientError::Unauthorized { .. })
        ));
        let subscriptions = lock_subscriptions(&context.subscriptions);
        assert!(subscriptions.queued.is_empty());
        assert!(subscriptions.in_flight.is_empty());
    }

    #[tokio::test]
    async fn test_unsubscribe_ack_and_withdrawn_request() {
        let (forwarder, _inbound) = MessageForwarder::channel(4);
        let context = context(forwarder);

        let (dropped_tx, _dropped_rx) = oneshot::channel();
        let (unsub_tx, unsub_rx) = oneshot::channel();
        {
            let mut subscriptions = lock_subscriptions(&context.subscriptions);
            subscriptions.enqueue(unsub_tx);
            // A request rumqttc refused never produces an outgoing packet
            subscriptions.enqueue(dropped_tx);
            subscriptions.withdraw_last();
        }

        context.track_subscription(&MessageHandler::route_event(&Event::Outgoing(
            Outgoing::Unsubscribe(4),
        )));
        context.track_subscription(&MessageHandler::route_event(&Event::Incoming(
            Packet::UnsubAck(UnsubAck { pkid: 4 }),
        )));

        assert!(unsub_rx.await.unwrap().is_ok());
        assert!(lock_subscriptions(&context.subscriptions).queued.is_empty());
    }

    #[tokio::test]
    async fn test_lost_connection_fails_subscription_waiters() {
        let mut tracker = SubscriptionTracker::default();
        let (tx, rx) = oneshot::channel();
        tracker.enqueue(tx);
        tracker.sent(21);
        tracker.clear();

        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn test_dispatch_routes_twin_reply_and_method() {
        let (forwarder, mut inbound) = MessageForwarder::channel(4);
        let context = context(forwarder);
        let pending = context.pending.clone();

        let (tx, rx) = oneshot::channel();
        lock_pending(&pending).insert("7".to_string(), tx);
        context
            .dispatch(Publish::new(
                "$iothub/twin/res/204/?$rid=7&$version=3",
                QoS::AtMostOnce,
                Vec::new(),
            ))
            .await;
        let reply = rx.await.unwrap();
        assert_eq!(reply.status, 204);
        assert_eq!(reply.version, Some(3));
        assert!(lock_pending(&pending).is_empty());

        context
            .dispatch(Publish::new(
                "$iothub/methods/POST/reboot/?$rid=9",
                QoS::AtMostOnce,
                "{}",
            ))
            .await;
        let request = inbound.method_requests.recv().await.unwrap();
        assert_eq!(request.name, "reboot");
        assert_eq!(request.request_id, "9");
    }
}

//! Pure connection configuration for the IoT hub MQTT transport
//!
//! Option building, topic construction and error classification. Nothing in
//! here performs I/O.

use crate::config::{ClientConfig, ConfigError};
use crate::error::ClientError;
use crate::transport::Message;
use rumqttc::{ConnectReturnCode, ConnectionError, MqttOptions, Transport as RumqttcTransport};
use std::time::Duration;
use url::form_urlencoded;
use url::Url;

/// API version sent in the MQTT user name
pub const API_VERSION: &str = "2021-04-12";

/// Hub message size limit
pub const MAX_PACKET_SIZE: usize = 256 * 1024;

/// Settings the MQTT transport needs from the client configuration
#[derive(Debug, Clone, PartialEq)]
pub struct MqttSettings {
    pub device_id: String,
    pub hub_hostname: String,
    pub endpoint: Url,
    pub keep_alive: Duration,
    pub operation_timeout: Duration,
}

impl MqttSettings {
    pub fn from_config(config: &ClientConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            device_id: config.device.id.clone(),
            hub_hostname: config.device.hub_hostname.clone(),
            endpoint: config.endpoint()?,
            keep_alive: config.keep_alive(),
            operation_timeout: config.operation_timeout(),
        })
    }

    /// User name the hub expects: `{hub}/{device}/?api-version=...`
    pub fn username(&self) -> String {
        format!(
            "{}/{}/?api-version={}",
            self.hub_hostname, self.device_id, API_VERSION
        )
    }

    pub fn uses_tls(&self) -> bool {
        matches!(self.endpoint.scheme(), "mqtts" | "ssl")
    }
}

/// Build rumqttc options for one connection attempt (pure function)
pub fn configure_mqtt_options(settings: &MqttSettings, sas_token: &str) -> Result<MqttOptions, ClientError> {
    let host = settings
        .endpoint
        .host_str()
        .ok_or_else(|| ClientError::protocol(format!("Endpoint {} has no host", settings.endpoint)))?;
    let port = settings
        .endpoint
        .port()
        .unwrap_or(if settings.uses_tls() { 8883 } else { 1883 });

    // The hub identifies the device by client id; it must equal the device id
    let mut options = MqttOptions::new(settings.device_id.clone(), host, port);
    if settings.uses_tls() {
        options.set_transport(RumqttcTransport::tls_with_default_config());
    }
    options.set_credentials(settings.username(), sas_token);
    options.set_keep_alive(settings.keep_alive);
    options.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);
    options.set_clean_session(true);

    Ok(options)
}

/// IoT hub topic construction
pub struct TopicBuilder;

impl TopicBuilder {
    /// Device-to-cloud topic with the message's properties encoded as a
    /// property bag: `devices/{id}/messages/events/{bag}`
    pub fn build_event_topic(device_id: &str, message: &Message) -> String {
        let mut bag = form_urlencoded::Serializer::new(String::new());
        bag.append_pair("$.mid", &message.message_id);
        if let Some(content_type) = &message.content_type {
            bag.append_pair("$.ct", content_type);
        }
        if let Some(encoding) = &message.content_encoding {
            bag.append_pair("$.ce", encoding);
        }

        let mut properties: Vec<_> = message.properties.iter().collect();
        properties.sort();
        for (key, value) in properties {
            bag.append_pair(key, value);
        }

        format!("devices/{device_id}/messages/events/{}", bag.finish())
    }

    /// Cloud-to-device subscription: `devices/{id}/messages/devicebound/#`
    pub fn build_c2d_subscription(device_id: &str) -> String {
        format!("devices/{device_id}/messages/devicebound/#")
    }

    pub fn build_c2d_prefix(device_id: &str) -> String {
        format!("devices/{device_id}/messages/devicebound/")
    }

    pub fn methods_subscription() -> &'static str {
        "$iothub/methods/POST/#"
    }

    /// `$iothub/methods/res/{status}/?$rid={rid}`
    pub fn build_method_response_topic(status: u16, request_id: &str) -> String {
        format!("$iothub/methods/res/{status}/?$rid={request_id}")
    }

    pub fn twin_response_subscription() -> &'static str {
        "$iothub/twin/res/#"
    }

    pub fn desired_patch_subscription() -> &'static str {
        "$iothub/twin/PATCH/properties/desired/#"
    }

    /// `$iothub/twin/GET/?$rid={rid}`
    pub fn build_twin_get_topic(request_id: &str) -> String {
        format!("$iothub/twin/GET/?$rid={request_id}")
    }

    /// `$iothub/twin/PATCH/properties/reported/?$rid={rid}`
    pub fn build_reported_patch_topic(request_id: &str) -> String {
        format!("$iothub/twin/PATCH/properties/reported/?$rid={request_id}")
    }
}

/// Classify a refused ConnAck (pure function)
pub fn map_connack_code(code: ConnectReturnCode) -> ClientError {
    match code {
        ConnectReturnCode::BadUserNamePassword
        | ConnectReturnCode::NotAuthorized
        | ConnectReturnCode::BadClientId => {
            ClientError::unauthorized(format!("Connection refused: {code:?}"))
        }
        ConnectReturnCode::ServiceUnavailable => {
            ClientError::server_busy("Connection refused: service unavailable")
        }
        ConnectReturnCode::RefusedProtocolVersion => {
            ClientError::protocol("Connection refused: unsupported protocol version")
        }
        ConnectReturnCode::Success => ClientError::protocol("ConnAck reported success as an error"),
    }
}

/// Classify an event loop error (pure function)
pub fn map_connection_error(error: &ConnectionError) -> ClientError {
    match error {
        ConnectionError::ConnectionRefused(code) => map_connack_code(*code),
        ConnectionError::NetworkTimeout | ConnectionError::FlushTimeout => {
            ClientError::timeout(format!("MQTT network: {error}"))
        }
        other => ClientError::communication(format!("MQTT connection error: {other}")),
    }
}

/// Classify a twin response status (pure function)
pub fn map_twin_status(status: u16, operation: &str) -> Result<(), ClientError> {
    match status {
        200..=299 => Ok(()),
        401 => Err(ClientError::unauthorized(format!("{operation} rejected with 401"))),
        404 => Err(ClientError::device_not_found(format!("{operation} returned 404"))),
        429 => Err(ClientError::server_busy(format!("{operation} throttled (429)"))),
        500..=599 => Err(ClientError::server_busy(format!(
            "{operation} failed with {status}"
        ))),
        _ => Err(ClientError::protocol(format!(
            "{operation} failed with unexpected status {status}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> MqttSettings {
        MqttSettings {
            device_id: "thermostat-01".to_string(),
            hub_hostname: "myhub.azure-devices.net".to_string(),
            endpoint: Url::parse("mqtts://myhub.azure-devices.net:8883").unwrap(),
            keep_alive: Duration::from_secs(230),
            operation_timeout: Duration::from_secs(30),
        }
    }

    #[test]
    fn test_username_format() {
        assert_eq!(
            settings().username(),
            "myhub.azure-devices.net/thermostat-01/?api-version=2021-04-12"
        );
    }

    #[test]
    fn test_configure_options() {
        let options = configure_mqtt_options(&settings(), "SharedAccessSignature sr=x").unwrap();
        assert_eq!(options.client_id(), "thermostat-01");
        assert_eq!(
            options.broker_address(),
            ("myhub.azure-devices.net".to_string(), 8883)
        );
        assert_eq!(options.keep_alive(), Duration::from_secs(230));
    }

    #[test]
    fn test_plain_endpoint_default_port() {
        let mut plain = settings();
        plain.endpoint = Url::parse("mqtt://localhost").unwrap();
        assert!(!plain.uses_tls());

        let options = configure_mqtt_options(&plain, "token").unwrap();
        assert_eq!(options.broker_address(), ("localhost".to_string(), 1883));
    }

    #[test]
    fn test_event_topic_property_bag() {
        let message = Message::new("{}")
            .with_content_type("application/json")
            .with_property("alert", "high temp");
        let mut expected_id = form_urlencoded::Serializer::new(String::new());
        expected_id.append_pair("$.mid", &message.message_id);

        let topic = TopicBuilder::build_event_topic("dev1", &message);
        assert!(topic.starts_with("devices/dev1/messages/events/"));
        assert!(topic.contains(&expected_id.finish()));
        assert!(topic.contains("%24.ct=application%2Fjson"));
        assert!(topic.contains("alert=high+temp"));
    }

    #[test]
    fn test_request_topics() {
        assert_eq!(
            TopicBuilder::build_method_response_topic(200, "7"),
            "$iothub/methods/res/200/?$rid=7"
        );
        assert_eq!(TopicBuilder::build_twin_get_topic("1"), "$iothub/twin/GET/?$rid=1");
        assert_eq!(
            TopicBuilder::build_reported_patch_topic("2"),
            "$iothub/twin/PATCH/properties/reported/?$rid=2"
        );
        assert_eq!(
            TopicBuilder::build_c2d_subscription("dev1"),
            "devices/dev1/messages/devicebound/#"
        );
    }

    #[test]
    fn test_connack_mapping() {
        assert!(matches!(
            map_connack_code(ConnectReturnCode::NotAuthorized),
            ClientError::Unauthorized { .. }
        ));
        assert!(matches!(
            map_connack_code(ConnectReturnCode::BadUserNamePassword),
            ClientError::Unauthorized { .. }
        ));
        assert!(map_connack_code(ConnectReturnCode::ServiceUnavailable).is_transient());
    }

    #[test]
    fn test_connection_error_mapping() {
        let io = ConnectionError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert!(map_connection_error(&io).is_transient());
        assert!(map_connection_error(&ConnectionError::NetworkTimeout).is_transient());
        assert!(matches!(
            map_connection_error(&ConnectionError::ConnectionRefused(
                ConnectReturnCode::NotAuthorized
            )),
            ClientError::Unauthorized { .. }
        ));
    }

    #[test]
    fn test_twin_status_mapping() {
        assert!(map_twin_status(200, "twin GET").is_ok());
        assert!(map_twin_status(204, "twin PATCH").is_ok());
        assert!(matches!(
            map_twin_status(401, "twin GET"),
            Err(ClientError::Unauthorized { .. })
        ));
        assert!(matches!(
            map_twin_status(404, "twin GET"),
            Err(ClientError::DeviceNotFound { .. })
        ));
        assert!(map_twin_status(429, "twin GET").unwrap_err().is_transient());
        assert!(map_twin_status(503, "twin GET").unwrap_err().is_transient());
        assert!(matches!(
            map_twin_status(400, "twin PATCH"),
            Err(ClientError::Protocol { .. })
        ));
    }
}

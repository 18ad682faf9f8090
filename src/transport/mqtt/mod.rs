//! IoT hub transport over MQTT
//!
//! Pure functions are kept apart from I/O:
//!
//! - [`connection`] - option building, topic construction, error mapping
//! - [`message_handler`] - inbound topic classification and forwarding
//! - [`client`] - the [`MqttTransport`] that owns the live connection
//!
//! # Usage
//!
//! ```rust,no_run
//! use hublink::auth::EnvTokenSource;
//! use hublink::config::ClientConfig;
//! use hublink::transport::mqtt::MqttTransport;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ClientConfig::load_from_file(std::path::Path::new("hublink.toml"))?;
//! let credentials = Arc::new(EnvTokenSource::new(
//!     config.device.sas_token_env.clone(),
//!     Duration::from_secs(300),
//! ));
//! let (transport, inbound) = MqttTransport::from_config(&config, credentials)?;
//! # let _ = (transport, inbound);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod connection;
pub mod message_handler;

pub use client::MqttTransport;
pub use connection::{configure_mqtt_options, MqttSettings, TopicBuilder};
pub use message_handler::{EventRoute, InboundReceivers, InboundTopic, MessageHandler};

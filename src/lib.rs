//! hublink - resilient IoT hub device client
//!
//! A connection guardian that keeps a device's logical session to its IoT hub
//! alive across transport failures. It retries operations under a pluggable
//! policy, recovers lost connections along with the features that were
//! enabled, renews credentials in the background and reports every
//! connection transition to the caller.
//!
//! # Overview
//!
//! - [`retry`] - retry policies and the executor that applies them
//! - [`session`] - connection guardian, status events, token refresh, health
//! - [`transport`] - the transport contract and the MQTT implementation
//! - [`auth`] - SAS token grants and credential sources
//! - [`config`] - TOML configuration
//! - [`observability`] - structured logging setup
//!
//! # Quick Start
//!
//! ```rust
//! use hublink::retry::{ExponentialBackoff, RetryLimit};
//! use hublink::session::{ConnectionGuardian, GuardianOptions};
//! use hublink::testing::MockTransport;
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//!
//! # tokio_test::block_on(async {
//! let policy = ExponentialBackoff::new(
//!     Duration::from_millis(100),
//!     Duration::from_secs(10),
//!     0.25,
//!     RetryLimit::MaxAttempts(5),
//! );
//! let options = GuardianOptions {
//!     policy: Arc::new(policy),
//!     ..Default::default()
//! };
//! let guardian = ConnectionGuardian::new(Arc::new(MockTransport::new()), options);
//!
//! let cancel = CancellationToken::new();
//! guardian.open(&cancel).await?;
//! guardian.enable_methods(&cancel).await?;
//! guardian.close(&cancel).await?;
//! # Ok::<(), hublink::ClientError>(())
//! # });
//! ```

pub mod auth;
pub mod config;
pub mod error;
pub mod observability;
pub mod retry;
pub mod session;
pub mod testing;
pub mod transport;

pub use auth::{CredentialSource, EnvTokenSource, TokenGrant};
pub use config::{ClientConfig, ConfigError};
pub use error::{ClientError, ClientResult, ErrorCategory};
pub use retry::{
    ExponentialBackoff, FixedInterval, NoRetry, RetryDecision, RetryExecutor, RetryLimit,
    RetryPolicy,
};
pub use session::{
    ConnectionGuardian, ConnectionState, ConnectionStatus, ConnectionStatusChangeReason,
    ConnectionStatusInfo, ConnectionStatusSink, Feature, GuardianOptions,
};
pub use transport::mqtt::MqttTransport;
pub use transport::{Message, MethodResponse, TransportHandler, TwinDocument};

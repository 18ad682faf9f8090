//! Durable logical session over a transport
//!
//! - [`state`] - pure connection state and feature flags
//! - [`status`] - status events and the sink they are delivered to
//! - [`health`] - pure health assessment
//! - [`refresh`] - background credential renewal
//! - [`guardian`] - the connection guardian tying it all together

pub mod guardian;
pub mod health;
pub mod refresh;
pub mod state;
pub mod status;

pub use guardian::{ConnectionGuardian, GuardianOptions};
pub use health::{ConnectionQuality, HealthMetrics};
pub use refresh::TokenRefreshLoop;
pub use state::{ConnectionState, Feature, FeatureFlags, SessionSnapshot};
pub use status::{
    ConnectionStatus, ConnectionStatusChangeReason, ConnectionStatusInfo, ConnectionStatusSink,
    StatusEmitter,
};

//! Pure connection state and feature-flag bookkeeping
//!
//! These types hold no I/O. The guardian owns one [`GuardState`] behind its
//! state lock and publishes [`SessionSnapshot`] copies for lock-free reads.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Connection state owned by the connection guardian
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Initial state, also reached after close or a fatal disconnect
    #[default]
    Closed,
    /// Transport open (or reopen) in flight
    Opening,
    /// Steady state, operations are accepted
    Open,
}

/// Subscription-like capabilities a caller can turn on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Feature {
    /// Direct-method invocation
    Methods,
    /// Desired-property patch notifications
    TwinPatch,
    /// Cloud-to-device message delivery
    ReceiveMessage,
}

impl Feature {
    pub const ALL: [Feature; 3] = [Feature::Methods, Feature::TwinPatch, Feature::ReceiveMessage];

    pub fn as_str(&self) -> &'static str {
        match self {
            Feature::Methods => "methods",
            Feature::TwinPatch => "twin-patch",
            Feature::ReceiveMessage => "receive-message",
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which features the caller has enabled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FeatureFlags {
    pub methods_enabled: bool,
    pub twin_patch_enabled: bool,
    pub receive_message_enabled: bool,
}

impl FeatureFlags {
    pub fn is_enabled(&self, feature: Feature) -> bool {
        match feature {
            Feature::Methods => self.methods_enabled,
            Feature::TwinPatch => self.twin_patch_enabled,
            Feature::ReceiveMessage => self.receive_message_enabled,
        }
    }

    pub fn set(&mut self, feature: Feature, enabled: bool) {
        match feature {
            Feature::Methods => self.methods_enabled = enabled,
            Feature::TwinPatch => self.twin_patch_enabled = enabled,
            Feature::ReceiveMessage => self.receive_message_enabled = enabled,
        }
    }

    /// Features currently on, in a stable order
    pub fn enabled(&self) -> Vec<Feature> {
        Feature::ALL
            .into_iter()
            .filter(|feature| self.is_enabled(*feature))
            .collect()
    }
}

/// Read-only copy of the guardian state published after every mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionSnapshot {
    pub state: ConnectionState,
    pub features: FeatureFlags,
    pub disposed: bool,
}

/// Decide whether a feature toggle is allowed (pure function).
///
/// Enabling requires the flag to be off and disabling requires it to be on;
/// anything else is a caller contract violation.
pub fn check_feature_transition(
    state: ConnectionState,
    flags: &FeatureFlags,
    feature: Feature,
    enable: bool,
) -> Result<(), crate::error::ClientError> {
    use crate::error::ClientError;

    if state != ConnectionState::Open {
        return Err(ClientError::NotOpen);
    }
    match (enable, flags.is_enabled(feature)) {
        (true, true) => Err(ClientError::FeatureAlreadyEnabled { feature }),
        (false, false) => Err(ClientError::FeatureNotEnabled { feature }),
        _ => Ok(()),
    }
}

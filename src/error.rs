//! Error taxonomy for the device client
//!
//! Every operation of the connection guardian, retry executor and transport
//! handlers returns [`ClientError`]. Errors are grouped into categories that
//! decide whether they are retried, surfaced as a connection status change, or
//! treated as a programming error.

use crate::config::ConfigError;
use crate::session::state::Feature;
use crate::session::status::ConnectionStatusChangeReason;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Main error type for device client operations
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Communication error: {message}")]
    Communication { message: String },

    #[error("Server busy: {message}")]
    ServerBusy { message: String },

    #[error("Operation timed out: {operation}")]
    Timeout { operation: String },

    #[error("Unauthorized: {message}")]
    Unauthorized { message: String },

    #[error("Credential has expired")]
    TokenExpired,

    #[error("Device disabled: {message}")]
    DeviceDisabled { message: String },

    #[error("Device not found: {message}")]
    DeviceNotFound { message: String },

    #[error("Retry exhausted after {attempts} attempts: {source}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        source: Box<ClientError>,
    },

    #[error("Connection is not open")]
    NotOpen,

    #[error("Client has been disposed")]
    Disposed,

    #[error("Feature already enabled: {feature}")]
    FeatureAlreadyEnabled { feature: Feature },

    #[error("Feature not enabled: {feature}")]
    FeatureNotEnabled { feature: Feature },

    #[error("Operation not supported by this transport: {operation}")]
    Unsupported { operation: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Coarse error classes used for retry and status decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Network or service hiccup, safe to retry
    Transient,
    /// Credential rejected or expired
    Authorization,
    /// Device disabled on the hub
    DeviceDisabled,
    /// Device or resource does not exist
    NotFound,
    /// Retry policy gave up on a transient error
    RetryExhausted,
    /// Caller misuse (operation before open, double enable, ...)
    ContractViolation,
    /// Caller requested cancellation
    Cancelled,
    /// Local failure (config, serialization, malformed frames)
    Internal,
}

impl ClientError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            ClientError::Communication { .. }
            | ClientError::ServerBusy { .. }
            | ClientError::Timeout { .. } => ErrorCategory::Transient,
            ClientError::Unauthorized { .. } | ClientError::TokenExpired => {
                ErrorCategory::Authorization
            }
            ClientError::DeviceDisabled { .. } => ErrorCategory::DeviceDisabled,
            ClientError::DeviceNotFound { .. } => ErrorCategory::NotFound,
            ClientError::RetryExhausted { .. } => ErrorCategory::RetryExhausted,
            ClientError::NotOpen
            | ClientError::Disposed
            | ClientError::FeatureAlreadyEnabled { .. }
            | ClientError::FeatureNotEnabled { .. }
            | ClientError::Unsupported { .. } => ErrorCategory::ContractViolation,
            ClientError::Cancelled => ErrorCategory::Cancelled,
            ClientError::Protocol { .. }
            | ClientError::Config(_)
            | ClientError::Serialization(_) => ErrorCategory::Internal,
        }
    }

    /// Whether the error belongs to the transient (retryable) category
    pub fn is_transient(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ClientError::Cancelled)
    }

    /// Errors no retry predicate may override: credential, device and
    /// contract failures, plus cancellation
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Authorization
                | ErrorCategory::DeviceDisabled
                | ErrorCategory::NotFound
                | ErrorCategory::ContractViolation
                | ErrorCategory::Cancelled
        )
    }

    /// Status reason reported when this error ends an open or recovery attempt.
    ///
    /// Returns `None` for cancellation, which is never reported as a
    /// connection status change.
    pub fn status_reason(&self) -> Option<ConnectionStatusChangeReason> {
        match self {
            ClientError::Cancelled => None,
            ClientError::Unauthorized { .. } => Some(ConnectionStatusChangeReason::BadCredential),
            ClientError::TokenExpired => Some(ConnectionStatusChangeReason::ExpiredSasToken),
            ClientError::DeviceDisabled { .. } | ClientError::DeviceNotFound { .. } => {
                Some(ConnectionStatusChangeReason::DeviceDisabled)
            }
            ClientError::RetryExhausted { source, .. } => match source.status_reason() {
                Some(ConnectionStatusChangeReason::RetryExpired) | None => {
                    Some(ConnectionStatusChangeReason::RetryExpired)
                }
                other => other,
            },
            _ => Some(ConnectionStatusChangeReason::RetryExpired),
        }
    }

    /// The innermost error, unwrapping any `RetryExhausted` layers
    pub fn root_cause(&self) -> &ClientError {
        match self {
            ClientError::RetryExhausted { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Error text with credentials redacted, safe for logs and status events
    pub fn sanitized(&self) -> String {
        sanitize_error_message(&self.to_string())
    }

    pub fn communication<S: Into<String>>(message: S) -> Self {
        Self::Communication {
            message: message.into(),
        }
    }

    pub fn server_busy<S: Into<String>>(message: S) -> Self {
        Self::ServerBusy {
            message: message.into(),
        }
    }

    pub fn timeout<S: Into<String>>(operation: S) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    pub fn unauthorized<S: Into<String>>(message: S) -> Self {
        Self::Unauthorized {
            message: message.into(),
        }
    }

    pub fn device_disabled<S: Into<String>>(message: S) -> Self {
        Self::DeviceDisabled {
            message: message.into(),
        }
    }

    pub fn device_not_found<S: Into<String>>(message: S) -> Self {
        Self::DeviceNotFound {
            message: message.into(),
        }
    }

    pub fn unsupported<S: Into<String>>(operation: S) -> Self {
        Self::Unsupported {
            operation: operation.into(),
        }
    }

    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }
}

static SECRET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(sig|password|token|key|secret)[=:]\s*[^\s&]+").expect("valid secret regex")
});

static SAS_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"SharedAccessSignature\s+\S+").expect("valid SAS regex")
});

const MAX_MESSAGE_LEN: usize = 500;

/// Redact credentials from an error message and bound its length
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = SAS_PATTERN
        .replace_all(message, "SharedAccessSignature ***")
        .to_string();
    sanitized = SECRET_PATTERN
        .replace_all(&sanitized, "${1}=***")
        .to_string();

    if sanitized.len() > MAX_MESSAGE_LEN {
        let truncate_suffix = "...[truncated]";
        let mut cut = MAX_MESSAGE_LEN - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], truncate_suffix);
    }

    sanitized
}

/// Result type for device client operations
pub type ClientResult<T> = Result<T, ClientError>;

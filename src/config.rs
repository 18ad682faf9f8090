//! Device client configuration
//!
//! A single TOML file describes the device identity, the retry policy used for
//! every transport operation, credential renewal and which features the runner
//! turns on after connecting. Secrets never live in the file; only the name of
//! the environment variable holding the SAS token does.

use crate::retry::{ExponentialBackoff, FixedInterval, NoRetry, RetryLimit, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Main client configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    pub device: DeviceSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub token: TokenSection,
    #[serde(default)]
    pub features: FeaturesSection,
    #[serde(default)]
    pub telemetry: TelemetrySection,
}

/// Device identity and hub endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceSection {
    /// Device identifier (must match [a-zA-Z0-9._:-]+)
    pub id: String,
    /// IoT hub host name, e.g. "myhub.azure-devices.net"
    pub hub_hostname: String,
    /// Broker URL; derived from the host name when absent
    pub endpoint_url: Option<String>,
    /// Environment variable containing the SAS token
    #[serde(default = "default_sas_token_env")]
    pub sas_token_env: String,
    /// MQTT keep-alive interval in seconds (default: 230)
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    /// Timeout for request/response round trips such as twin GET (default: 30)
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_secs: u64,
}

fn default_sas_token_env() -> String {
    "HUBLINK_SAS_TOKEN".to_string()
}

fn default_keep_alive() -> u64 {
    230
}

fn default_operation_timeout() -> u64 {
    30
}

/// Retry policy selection
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PolicyKind {
    #[default]
    Exponential,
    Fixed,
    None,
}

/// Retry section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrySection {
    #[serde(default)]
    pub policy: PolicyKind,
    /// Total invocations allowed per operation
    pub max_attempts: Option<u32>,
    /// Time budget per operation, measured from the first invocation
    pub max_elapsed_secs: Option<u64>,
    /// Exponential base delay, or the fixed interval
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Exponential delay cap
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Jitter ratio in 0.0..=1.0
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_base_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_jitter() -> f64 {
    0.25
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            policy: PolicyKind::default(),
            max_attempts: None,
            max_elapsed_secs: None,
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
        }
    }
}

impl RetrySection {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == Some(0) {
            return Err(ConfigError::InvalidConfig(
                "retry.max_attempts must be greater than 0 or omitted for unlimited".to_string(),
            ));
        }
        if self.max_attempts.is_some() && self.max_elapsed_secs.is_some() {
            return Err(ConfigError::InvalidConfig(
                "retry.max_attempts and retry.max_elapsed_secs are mutually exclusive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ConfigError::InvalidConfig(format!(
                "retry.jitter must be within 0.0..=1.0, got {}",
                self.jitter
            )));
        }
        match self.policy {
            PolicyKind::Fixed if self.base_delay_ms == 0 => Err(ConfigError::InvalidConfig(
                "retry.base_delay_ms must be greater than 0 for the fixed policy".to_string(),
            )),
            PolicyKind::Exponential if self.max_delay_ms < self.base_delay_ms => {
                Err(ConfigError::InvalidConfig(
                    "retry.max_delay_ms must not be smaller than retry.base_delay_ms".to_string(),
                ))
            }
            _ => Ok(()),
        }
    }

    pub fn limit(&self) -> RetryLimit {
        match (self.max_attempts, self.max_elapsed_secs) {
            (Some(max), _) => RetryLimit::MaxAttempts(max),
            (None, Some(secs)) => RetryLimit::MaxElapsed(Duration::from_secs(secs)),
            (None, None) => RetryLimit::Unlimited,
        }
    }

    pub fn build_policy(&self) -> Arc<dyn RetryPolicy> {
        let base = Duration::from_millis(self.base_delay_ms);
        match self.policy {
            PolicyKind::None => Arc::new(NoRetry),
            PolicyKind::Fixed => Arc::new(FixedInterval::new(base, self.limit())),
            PolicyKind::Exponential => Arc::new(ExponentialBackoff::new(
                base,
                Duration::from_millis(self.max_delay_ms),
                self.jitter,
                self.limit(),
            )),
        }
    }
}

/// Credential renewal
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TokenSection {
    /// Refresh this long before the token expires (default: 300)
    #[serde(default = "default_renew_before")]
    pub renew_before_secs: u64,
}

fn default_renew_before() -> u64 {
    300
}

impl Default for TokenSection {
    fn default() -> Self {
        Self {
            renew_before_secs: default_renew_before(),
        }
    }
}

/// Features the runner enables after the first open
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FeaturesSection {
    #[serde(default)]
    pub methods: bool,
    #[serde(default)]
    pub twin_patch: bool,
    #[serde(default)]
    pub receive_messages: bool,
}

/// Telemetry heartbeat sent by the runner
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TelemetrySection {
    /// Heartbeat interval in seconds (default: 10)
    #[serde(default = "default_telemetry_interval")]
    pub interval_secs: u64,
}

fn default_telemetry_interval() -> u64 {
    10
}

impl Default for TelemetrySection {
    fn default() -> Self {
        Self {
            interval_secs: default_telemetry_interval(),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid device ID format: {0}")]
    InvalidDeviceId(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ClientConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: ClientConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_device_id(&self.device.id)?;

        if self.device.hub_hostname.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "device.hub_hostname must not be empty".to_string(),
            ));
        }
        if self.device.keep_alive_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "device.keep_alive_secs must be greater than 0".to_string(),
            ));
        }
        if self.device.operation_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "device.operation_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.telemetry.interval_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "telemetry.interval_secs must be greater than 0".to_string(),
            ));
        }

        self.endpoint()?;
        self.retry.validate()
    }

    /// Broker endpoint, explicit or derived from the hub host name
    pub fn endpoint(&self) -> Result<url::Url, ConfigError> {
        let raw = self
            .device
            .endpoint_url
            .clone()
            .unwrap_or_else(|| format!("mqtts://{}:8883", self.device.hub_hostname));

        let endpoint = url::Url::parse(&raw)
            .map_err(|e| ConfigError::InvalidConfig(format!("Invalid endpoint URL '{raw}': {e}")))?;

        match endpoint.scheme() {
            "mqtt" | "mqtts" | "ssl" | "tcp" => {}
            other => {
                return Err(ConfigError::InvalidConfig(format!(
                    "Unsupported endpoint scheme '{other}', expected mqtt or mqtts"
                )))
            }
        }
        if endpoint.host_str().is_none() {
            return Err(ConfigError::InvalidConfig(format!(
                "Endpoint URL '{raw}' has no host"
            )));
        }

        Ok(endpoint)
    }

    /// Get the SAS token from its environment variable
    pub fn sas_token(&self) -> Result<String, ConfigError> {
        std::env::var(&self.device.sas_token_env)
            .map_err(|_| ConfigError::EnvVarNotFound(self.device.sas_token_env.clone()))
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.device.keep_alive_secs)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.device.operation_timeout_secs)
    }

    pub fn renew_before(&self) -> Duration {
        Duration::from_secs(self.token.renew_before_secs)
    }

    pub fn telemetry_interval(&self) -> Duration {
        Duration::from_secs(self.telemetry.interval_secs)
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[device]
id = "test-device"
hub_hostname = "test-hub.azure-devices.net"

[retry]
policy = "fixed"
max_attempts = 3
base_delay_ms = 10
"#;
        Self::from_toml_str(toml_content).expect("Test config should parse")
    }
}

/// Validate device ID format
pub fn validate_device_id(device_id: &str) -> Result<(), ConfigError> {
    let valid_chars = device_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | ':'));

    if device_id.is_empty() || !valid_chars {
        return Err(ConfigError::InvalidDeviceId(format!(
            "Device ID '{device_id}' must match pattern [a-zA-Z0-9._:-]+"
        )));
    }

    Ok(())
}

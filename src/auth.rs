//! Credential capability consumed by the transport and the token refresh loop
//!
//! Token generation is external. A [`CredentialSource`] only hands out the
//! current token together with the point in time at which it should be
//! renewed.

use crate::config::ConfigError;
use crate::error::{ClientError, ClientResult};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::fmt;
use std::time::Duration;

/// A credential and its renewal schedule
#[derive(Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub refresh_at: DateTime<Utc>,
}

impl TokenGrant {
    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }

    /// The refresh deadline on the tokio clock; past deadlines map to now
    pub fn refresh_deadline(&self) -> tokio::time::Instant {
        let now = tokio::time::Instant::now();
        match (self.refresh_at - Utc::now()).to_std() {
            Ok(remaining) => now + remaining,
            Err(_) => now,
        }
    }
}

impl fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenGrant")
            .field("token", &"***")
            .field("expires_at", &self.expires_at)
            .field("refresh_at", &self.refresh_at)
            .finish()
    }
}

/// Source of time-limited credentials
#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// The credential to use for the next connection attempt
    async fn current(&self) -> ClientResult<TokenGrant>;

    /// Obtain a renewed credential
    async fn refresh(&self) -> ClientResult<TokenGrant>;
}

/// Reads a SAS token from an environment variable.
///
/// The variable is re-read on every call so an external agent can rotate the
/// token in place.
#[derive(Debug, Clone)]
pub struct EnvTokenSource {
    env_var: String,
    renew_before: Duration,
}

impl EnvTokenSource {
    pub fn new<S: Into<String>>(env_var: S, renew_before: Duration) -> Self {
        Self {
            env_var: env_var.into(),
            renew_before,
        }
    }

    fn read_grant(&self) -> ClientResult<TokenGrant> {
        let token = std::env::var(&self.env_var)
            .map_err(|_| ClientError::Config(ConfigError::EnvVarNotFound(self.env_var.clone())))?;
        grant_from_sas(token, self.renew_before)
    }
}

#[async_trait]
impl CredentialSource for EnvTokenSource {
    async fn current(&self) -> ClientResult<TokenGrant> {
        self.read_grant()
    }

    async fn refresh(&self) -> ClientResult<TokenGrant> {
        self.read_grant()
    }
}

/// Build a grant from a SAS token, renewing `renew_before` ahead of expiry
pub fn grant_from_sas(token: String, renew_before: Duration) -> ClientResult<TokenGrant> {
    let expires_at = parse_sas_expiry(&token)?;
    let now = Utc::now();
    if expires_at <= now {
        return Err(ClientError::TokenExpired);
    }

    let renew_before = chrono::Duration::from_std(renew_before).unwrap_or(chrono::Duration::zero());
    let refresh_at = (expires_at - renew_before).max(now);

    Ok(TokenGrant {
        token,
        expires_at,
        refresh_at,
    })
}

/// Extract the `se=` expiry (unix seconds) from a SAS token
pub fn parse_sas_expiry(token: &str) -> ClientResult<DateTime<Utc>> {
    let fields = token
        .trim()
        .strip_prefix("SharedAccessSignature")
        .unwrap_or(token)
        .trim();

    let expiry = url::form_urlencoded::parse(fields.as_bytes())
        .find(|(key, _)| key == "se")
        .map(|(_, value)| value.into_owned())
        .ok_or_else(|| ClientError::unauthorized("SAS token has no se= expiry field"))?;

    let seconds: i64 = expiry
        .parse()
        .map_err(|_| ClientError::unauthorized(format!("SAS token expiry '{expiry}' is not a number")))?;

    Utc.timestamp_opt(seconds, 0)
        .single()
        .ok_or_else(|| ClientError::unauthorized(format!("SAS token expiry '{seconds}' is out of range")))
}

//! Retry policies
//!
//! A policy is a pure decision function: given the index of the failed
//! attempt, the error and the time spent so far, it says whether to try again
//! and how long to wait. Policies keep no state between calls.

use crate::error::ClientError;
use rand::Rng;
use std::fmt::Debug;
use std::time::Duration;

/// Outcome of a retry decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again after the given delay
    Retry(Duration),
    /// Give up
    Stop,
}

impl RetryDecision {
    pub fn should_retry(&self) -> bool {
        matches!(self, RetryDecision::Retry(_))
    }

    pub fn delay(&self) -> Option<Duration> {
        match self {
            RetryDecision::Retry(delay) => Some(*delay),
            RetryDecision::Stop => None,
        }
    }
}

/// Retry decision contract.
///
/// `attempt` is the 0-based index of the invocation that just failed and
/// `elapsed` is the time since the first invocation started.
pub trait RetryPolicy: Send + Sync + Debug {
    fn should_retry(&self, attempt: u32, last_error: &ClientError, elapsed: Duration)
        -> RetryDecision;
}

/// Bound applied by the bounded policies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryLimit {
    /// Retry forever
    #[default]
    Unlimited,
    /// At most this many invocations in total
    MaxAttempts(u32),
    /// Stop once this much time has passed since the first invocation
    MaxElapsed(Duration),
}

impl RetryLimit {
    /// Whether another invocation is allowed after `attempt` failed (pure function)
    pub fn permits(&self, attempt: u32, elapsed: Duration) -> bool {
        match self {
            RetryLimit::Unlimited => true,
            RetryLimit::MaxAttempts(max) => attempt.saturating_add(1) < *max,
            RetryLimit::MaxElapsed(max) => elapsed < *max,
        }
    }

    /// Maximum number of invocations, if bounded by count
    pub fn max_attempts(&self) -> Option<u32> {
        match self {
            RetryLimit::MaxAttempts(max) => Some(*max),
            _ => None,
        }
    }
}

/// Never retries
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetry;

impl RetryPolicy for NoRetry {
    fn should_retry(&self, _attempt: u32, _last_error: &ClientError, _elapsed: Duration) -> RetryDecision {
        RetryDecision::Stop
    }
}

/// Retries after a constant delay
#[derive(Debug, Clone, Copy)]
pub struct FixedInterval {
    pub interval: Duration,
    pub limit: RetryLimit,
}

impl FixedInterval {
    pub fn new(interval: Duration, limit: RetryLimit) -> Self {
        Self { interval, limit }
    }
}

impl RetryPolicy for FixedInterval {
    fn should_retry(&self, attempt: u32, _last_error: &ClientError, elapsed: Duration) -> RetryDecision {
        if self.limit.permits(attempt, elapsed) {
            RetryDecision::Retry(self.interval)
        } else {
            RetryDecision::Stop
        }
    }
}

/// Exponential backoff with symmetric jitter
///
/// delay = min(max_delay, base_delay * 2^attempt), then moved by a random
/// amount within `jitter * delay` in either direction and clamped to
/// `[0, max_delay]`.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Jitter ratio in 0.0..=1.0
    pub jitter: f64,
    pub limit: RetryLimit,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            jitter: 0.25,
            limit: RetryLimit::Unlimited,
        }
    }
}

impl ExponentialBackoff {
    pub fn new(base_delay: Duration, max_delay: Duration, jitter: f64, limit: RetryLimit) -> Self {
        Self {
            base_delay,
            max_delay,
            jitter: jitter.clamp(0.0, 1.0),
            limit,
        }
    }

    /// Backoff before jitter for a failed attempt (pure function)
    pub fn base_backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt.min(31)).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    fn apply_jitter(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let spread = delay.as_secs_f64() * self.jitter;
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        let jittered = (delay.as_secs_f64() + offset).max(0.0);
        Duration::from_secs_f64(jittered).min(self.max_delay)
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn should_retry(&self, attempt: u32, _last_error: &ClientError, elapsed: Duration) -> RetryDecision {
        if !self.limit.permits(attempt, elapsed) {
            return RetryDecision::Stop;
        }
        RetryDecision::Retry(self.apply_jitter(self.base_backoff(attempt)))
    }
}

/// Default retryability predicate: transient errors only
pub fn default_retryable(error: &ClientError) -> bool {
    error.is_transient()
}

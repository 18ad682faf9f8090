//! Retry policies and the run-with-retry executor
//!
//! Policies decide, the executor drives. Neither knows about connection
//! state; the connection guardian composes them around transport calls.

pub mod executor;
pub mod policy;

pub use executor::{sleep_or_cancel, RetryExecutor};
pub use policy::{
    default_retryable, ExponentialBackoff, FixedInterval, NoRetry, RetryDecision, RetryLimit,
    RetryPolicy,
};

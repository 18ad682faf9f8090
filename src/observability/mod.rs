//! Observability for the device client
//!
//! Structured logging via `tracing`, configured from the environment, plus
//! span macros for connection, recovery and retry operations.

pub mod logging;

pub use logging::{init_default_logging, init_logging, parse_level, LogFormat};

// Span macros for structured logging
pub use logging::{connection_span, recovery_span, retry_span};

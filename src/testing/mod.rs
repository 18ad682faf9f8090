//! Testing utilities and mock implementations
//!
//! Mocks for the transport, credential source and status sink, so the
//! connection guardian can be tested without a hub or network.

pub mod mocks;

pub use mocks::*;

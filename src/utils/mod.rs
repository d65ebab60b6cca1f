//! The `utils` module provides definitions shared across the bridge:
//! the top-level startup error type and tracing initialisation.

pub mod error;
pub mod logging;

pub use error::BridgeError;

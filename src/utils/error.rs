//! Startup-fatal errors.
//!
//! Anything in here aborts the process with a non-zero exit code. Per-message
//! failures never surface as a `BridgeError`; the dispatcher logs and moves on.

use thiserror::Error;

use crate::broker::BrokerError;
use crate::config::ConfigError;
use crate::inventory::InventoryError;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("inventory error: {0}")]
    Inventory(#[from] InventoryError),

    #[error("unable to connect to inventory service at {url}")]
    InventoryUnreachable { url: String },

    #[error("consumer stream closed by the broker")]
    ConsumerClosed,
}

use async_trait::async_trait;
use thiserror::Error;

use crate::event::VmEvent;

/// Failures reported by an inventory backend.
#[derive(Debug, Error)]
pub enum InventoryError {
    /// Connectivity problems, timeouts, 5xx and throttling.
    #[error("transient inventory failure: {message}")]
    Transient { message: String },

    /// The service understood the request and refused it.
    #[error("inventory rejected the request: {message}")]
    Permanent { message: String },

    #[error("inventory client used before connect()")]
    NotConnected,
}

impl InventoryError {
    pub fn is_transient(&self) -> bool {
        matches!(self, InventoryError::Transient { .. })
    }
}

/// Idempotent facade over the inventory service.
///
/// Implementations are shared by every in-flight task and must tolerate
/// concurrent `reconcile` calls, including for the same hostname.
#[async_trait]
pub trait Inventory: Send + Sync {
    /// Must succeed before the first `reconcile`.
    async fn connect(&self) -> Result<(), InventoryError>;

    fn is_connected(&self) -> bool;

    /// Converges the service's record of `event.hostname` to the event.
    /// Calling it twice with the same event leaves the same final state.
    async fn reconcile(&self, event: &VmEvent) -> Result<(), InventoryError>;
}

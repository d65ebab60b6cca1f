//! The `inventory` module is the bridge's view of the network inventory
//! service: an idempotent upsert target keyed by VM hostname.
//!
//! `Inventory` is the seam the dispatcher depends on; `NetboxClient` is the
//! HTTP implementation used in production.

pub mod client;
pub mod netbox;

pub use client::{Inventory, InventoryError};
pub use netbox::NetboxClient;

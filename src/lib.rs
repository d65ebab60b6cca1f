//! # rh-bridge
//!
//! `rh-bridge` is a one-way bridge between a RabbitMQ queue and a Netbox
//! inventory. It consumes VM descriptions, reconciles each one into the
//! inventory (creating or updating the VM), announces successes on an
//! outgoing queue and reschedules failures through a delayed-message
//! exchange until a per-message retry budget runs out.
//!
//! ## Core Modules
//!
//! - `broker`: AMQP session, topology declaration and publishing.
//! - `config`: Loads settings from an optional file and the environment.
//! - `dispatch`: The consume loop, per-delivery tasks and the retry policy.
//! - `event`: The VM event model and its JSON codec.
//! - `inventory`: The idempotent inventory facade and its Netbox client.
//! - `supervisor`: Cancellation root driven by operator signals.
//! - `utils`: Startup errors and logging setup.

pub mod app;
pub mod broker;
pub mod config;
pub mod dispatch;
pub mod event;
pub mod inventory;
pub mod supervisor;
pub mod utils;

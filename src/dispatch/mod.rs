//! The `dispatch` module drives the reconciliation pipeline: it pulls
//! deliveries off the consumer, fans each one out to its own task, and turns
//! the inventory outcome into a publish through the retry policy.
//!
//! ```text
//! RECEIVED ──decode──▶ RECONCILING ──ok──▶ NOTIFYING ──▶ DONE
//!     │                     │
//!     └─malformed─▶ DROPPED └─err──▶ REDELIVERING ──▶ DONE
//!                                └─budget spent──▶ DROPPED
//! ```

pub mod dispatcher;
pub mod policy;
pub mod worker;

pub use dispatcher::{Dispatcher, StopReason};
pub use policy::{Action, Outcome, RetryPolicy};
pub use worker::{Disposition, DropReason, WorkerContext, process};

#[cfg(test)]
mod tests;

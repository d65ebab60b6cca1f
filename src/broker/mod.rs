//! The `broker` module owns everything AMQP: the session (connection plus
//! its single shared channel), the declarative topology, and the publish
//! seam used by the dispatcher.
//!
//! Incoming work arrives on a queue fronted by a delayed-message exchange of
//! the same name, so a redelivery is simply a publish to that exchange with
//! an `x-delay` header.

pub mod delivery;
pub mod publisher;
pub mod session;
pub mod topology;

use thiserror::Error;

pub use delivery::InboundDelivery;
pub use publisher::{AmqpPublisher, Publication, Publisher};
pub use session::BrokerSession;
pub use topology::{Route, Topology};

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("amqp error: {0}")]
    Amqp(#[from] lapin::Error),

    #[error("broker refused publish to exchange {exchange:?} with routing key {routing_key:?}")]
    Nacked {
        exchange: String,
        routing_key: String,
    },
}

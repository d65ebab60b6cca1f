//! Queue, exchange and binding declarations.
//!
//! Every declaration is idempotent, so running `declare` on each start is
//! safe as long as the existing objects were created with the same options.

use lapin::options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions};
use lapin::types::{AMQPValue, FieldTable, LongString};
use lapin::{Channel, ExchangeKind};
use tracing::info;

use super::BrokerError;
use crate::config::BrokerSettings;

/// Exchange type provided by the RabbitMQ delayed-message plugin.
pub const DELAYED_EXCHANGE_TYPE: &str = "x-delayed-message";
pub const DELAYED_TYPE_ARGUMENT: &str = "x-delayed-type";
/// The broker's default (nameless, direct) exchange.
pub const DEFAULT_EXCHANGE: &str = "";

/// Where a message gets published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub exchange: String,
    pub routing_key: String,
}

#[derive(Debug, Clone)]
pub struct Topology {
    incoming: String,
    outgoing: String,
}

impl Topology {
    pub fn new(incoming: impl Into<String>, outgoing: impl Into<String>) -> Self {
        Self {
            incoming: incoming.into(),
            outgoing: outgoing.into(),
        }
    }

    pub fn from_settings(settings: &BrokerSettings) -> Self {
        Self::new(
            settings.incoming_queue.clone(),
            settings.outgoing_queue.clone(),
        )
    }

    pub fn incoming_queue(&self) -> &str {
        &self.incoming
    }

    pub fn outgoing_queue(&self) -> &str {
        &self.outgoing
    }

    /// Durable, shared, kept when the last consumer leaves.
    pub fn queue_options() -> QueueDeclareOptions {
        QueueDeclareOptions {
            durable: true,
            exclusive: false,
            auto_delete: false,
            ..QueueDeclareOptions::default()
        }
    }

    pub fn exchange_options() -> ExchangeDeclareOptions {
        ExchangeDeclareOptions {
            durable: true,
            auto_delete: false,
            internal: false,
            ..ExchangeDeclareOptions::default()
        }
    }

    pub fn exchange_kind() -> ExchangeKind {
        ExchangeKind::Custom(DELAYED_EXCHANGE_TYPE.to_string())
    }

    /// The delayed exchange routes like a direct one once the delay expires.
    pub fn exchange_arguments() -> FieldTable {
        let mut args = FieldTable::default();
        args.insert(
            DELAYED_TYPE_ARGUMENT.into(),
            AMQPValue::LongString(LongString::from("direct")),
        );
        args
    }

    /// Redeliveries go back through the delayed exchange named after the
    /// incoming queue.
    pub fn redelivery_route(&self) -> Route {
        Route {
            exchange: self.incoming.clone(),
            routing_key: self.incoming.clone(),
        }
    }

    pub fn success_route(&self) -> Route {
        Route {
            exchange: DEFAULT_EXCHANGE.to_string(),
            routing_key: self.outgoing.clone(),
        }
    }

    pub async fn declare(&self, channel: &Channel) -> Result<(), BrokerError> {
        for queue in [&self.incoming, &self.outgoing] {
            channel
                .queue_declare(queue, Self::queue_options(), FieldTable::default())
                .await?;
            info!(queue = %queue, "declared queue");
        }

        channel
            .exchange_declare(
                &self.incoming,
                Self::exchange_kind(),
                Self::exchange_options(),
                Self::exchange_arguments(),
            )
            .await?;
        info!(exchange = %self.incoming, "declared delayed exchange");

        channel
            .queue_bind(
                &self.incoming,
                &self.incoming,
                &self.incoming,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        info!(queue = %self.incoming, exchange = %self.incoming, "bound queue to exchange");

        Ok(())
    }
}

use futures::StreamExt;
use futures::stream::BoxStream;
use lapin::options::{BasicConsumeOptions, ConfirmSelectOptions};
use lapin::types::FieldTable;
use lapin::{Channel, Connection, ConnectionProperties};
use tracing::{info, warn};

use super::BrokerError;
use super::delivery::InboundDelivery;
use super::publisher::AmqpPublisher;
use super::topology::Topology;

pub type DeliveryStream = BoxStream<'static, Result<InboundDelivery, BrokerError>>;

/// A broker connection and the single channel shared by consumer and
/// publishers.
pub struct BrokerSession {
    connection: Connection,
    channel: Channel,
}

impl BrokerSession {
    pub async fn connect(url: &str) -> Result<Self, BrokerError> {
        let connection = Connection::connect(url, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;
        // publishes resolve once the broker has taken responsibility for them
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        info!("connected to message broker");
        Ok(Self {
            connection,
            channel,
        })
    }

    pub async fn declare(&self, topology: &Topology) -> Result<(), BrokerError> {
        topology.declare(&self.channel).await
    }

    pub fn publisher(&self) -> AmqpPublisher {
        AmqpPublisher::new(self.channel.clone())
    }

    /// Starts an auto-ack consumer on `queue`.
    pub async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, BrokerError> {
        let options = BasicConsumeOptions {
            no_ack: true,
            exclusive: false,
            no_local: false,
            ..BasicConsumeOptions::default()
        };
        let consumer = self
            .channel
            .basic_consume(queue, consumer_tag, options, FieldTable::default())
            .await?;
        info!(queue, consumer_tag, "registered consumer");

        Ok(consumer
            .map(|delivery| delivery.map(InboundDelivery::from).map_err(BrokerError::from))
            .boxed())
    }

    pub async fn close(self) {
        if let Err(e) = self.channel.close(200, "bye").await {
            warn!(error = %e, "failed to close channel");
        }
        if let Err(e) = self.connection.close(200, "bye").await {
            warn!(error = %e, "failed to close connection");
        }
    }
}

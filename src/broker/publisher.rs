use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lapin::options::BasicPublishOptions;
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::{BasicProperties, Channel};

use super::BrokerError;
use super::topology::Route;
use crate::event::codec::CONTENT_TYPE;

pub const DELAY_HEADER: &str = "x-delay";

/// A message ready to be handed to the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct Publication {
    pub route: Route,
    pub payload: Vec<u8>,
    /// Visibility delay applied by the delayed exchange.
    pub delay: Option<Duration>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl Publication {
    pub fn new(route: Route, payload: Vec<u8>) -> Self {
        Self {
            route,
            payload,
            delay: None,
            timestamp: None,
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn stamped(mut self, timestamp: Option<DateTime<Utc>>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Value of the `x-delay` header, in milliseconds.
    pub fn delay_millis(&self) -> Option<i64> {
        self.delay
            .map(|delay| i64::try_from(delay.as_millis()).unwrap_or(i64::MAX))
    }

    pub fn properties(&self) -> BasicProperties {
        let timestamp = self.timestamp.unwrap_or_else(Utc::now).timestamp().max(0) as u64;
        let mut properties = BasicProperties::default()
            .with_content_type(ShortString::from(CONTENT_TYPE))
            .with_timestamp(timestamp);

        if let Some(millis) = self.delay_millis() {
            let mut headers = FieldTable::default();
            headers.insert(DELAY_HEADER.into(), AMQPValue::LongLongInt(millis));
            properties = properties.with_headers(headers);
        }

        properties
    }
}

/// Publish seam shared by every in-flight task.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, publication: Publication) -> Result<(), BrokerError>;
}

/// Publishes on the session's channel. `lapin::Channel` serialises concurrent
/// publishes internally, so clones can be used from any task.
#[derive(Clone)]
pub struct AmqpPublisher {
    channel: Channel,
}

impl AmqpPublisher {
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl Publisher for AmqpPublisher {
    async fn publish(&self, publication: Publication) -> Result<(), BrokerError> {
        let confirmation = self
            .channel
            .basic_publish(
                &publication.route.exchange,
                &publication.route.routing_key,
                BasicPublishOptions::default(),
                &publication.payload,
                publication.properties(),
            )
            .await?
            .await?;

        match confirmation {
            Confirmation::Nack(_) => Err(BrokerError::Nacked {
                exchange: publication.route.exchange,
                routing_key: publication.route.routing_key,
            }),
            _ => Ok(()),
        }
    }
}

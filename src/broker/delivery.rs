use chrono::{DateTime, Utc};
use lapin::message::Delivery;

/// The parts of a broker delivery the bridge cares about.
///
/// Deliveries are consumed with auto-ack, so there is nothing to settle once
/// one has been received.
#[derive(Debug, Clone)]
pub struct InboundDelivery {
    pub payload: Vec<u8>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl InboundDelivery {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            timestamp: None,
        }
    }
}

impl From<Delivery> for InboundDelivery {
    fn from(delivery: Delivery) -> Self {
        let timestamp = (*delivery.properties.timestamp())
            .and_then(|secs| i64::try_from(secs).ok())
            .and_then(|secs| DateTime::from_timestamp(secs, 0));

        Self {
            payload: delivery.data,
            timestamp,
        }
    }
}

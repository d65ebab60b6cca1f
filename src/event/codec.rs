//! Payload bytes <-> `VmEvent`.
//!
//! Payloads are JSON objects. A missing `fail_count` defaults to
//! [`DEFAULT_FAIL_COUNT`](super::DEFAULT_FAIL_COUNT); a present one always wins.

use chrono::{DateTime, Utc};
use thiserror::Error;

use super::message::VmEvent;

pub const CONTENT_TYPE: &str = "application/json";

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed payload: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("payload has an empty hostname")]
    EmptyHostname,

    #[error("failed to encode event for {hostname}: {source}")]
    Encode {
        hostname: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Decodes a delivery payload, stamping it with the delivery's timestamp.
pub fn decode(payload: &[u8], timestamp: Option<DateTime<Utc>>) -> Result<VmEvent, CodecError> {
    let mut event: VmEvent = serde_json::from_slice(payload).map_err(CodecError::Malformed)?;

    if event.hostname.trim().is_empty() {
        return Err(CodecError::EmptyHostname);
    }

    event.timestamp = timestamp;
    Ok(event)
}

pub fn encode(event: &VmEvent) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(event).map_err(|source| CodecError::Encode {
        hostname: event.hostname.clone(),
        source,
    })
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Retry budget given to events whose payload does not carry one.
pub const DEFAULT_FAIL_COUNT: u32 = 20;

fn default_fail_count() -> u32 {
    DEFAULT_FAIL_COUNT
}

/// An explicit `null` keeps the default budget, same as a missing field.
fn fail_count_or_default<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<u32>::deserialize(deserializer)?.unwrap_or(DEFAULT_FAIL_COUNT))
}

/// A VM description consumed from the incoming queue.
///
/// The logical identity of a VM is its `hostname`. Everything else in the
/// payload besides `fail_count` is opaque to the bridge: it is collected into
/// `fields`, handed to the inventory client and re-emitted unchanged.
///
/// # Example
///
/// ```rust
/// use rh_bridge::event::VmEvent;
///
/// let event: VmEvent = serde_json::from_str(r#"{"hostname":"vm-a","vcpus":2}"#).unwrap();
/// assert_eq!(event.fail_count, 20);
/// assert_eq!(event.fields["vcpus"], 2);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmEvent {
    pub hostname: String,

    /// Remaining reconciliation attempts, including the current one.
    #[serde(
        default = "default_fail_count",
        deserialize_with = "fail_count_or_default"
    )]
    pub fail_count: u32,

    /// Taken from the delivery metadata, never from the payload.
    #[serde(skip)]
    pub timestamp: Option<DateTime<Utc>>,

    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl VmEvent {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            fail_count: DEFAULT_FAIL_COUNT,
            timestamp: None,
            fields: Map::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_fail_count(mut self, fail_count: u32) -> Self {
        self.fail_count = fail_count;
        self
    }

    #[cfg(test)]
    pub(crate) fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Copy of this event carrying a different retry budget.
    pub fn with_budget(&self, fail_count: u32) -> Self {
        Self {
            fail_count,
            ..self.clone()
        }
    }
}

use serde::Deserialize;

/// Top-level configuration settings for the bridge.
///
/// Built once at startup and never mutated afterwards; the dispatcher
/// receives the pieces it needs by value.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub broker: BrokerSettings,
    pub inventory: InventorySettings,
    pub worker: WorkerSettings,
    pub log_level: String,
}

/// Connection and topology settings for the message broker.
#[derive(Debug, Deserialize, Clone)]
pub struct BrokerSettings {
    pub url: String,
    /// Name of the consumed queue and of the delayed exchange in front of it.
    pub incoming_queue: String,
    pub outgoing_queue: String,
    pub retry_delay_secs: u64,
    pub consumer_tag: String,
}

/// Settings consumed by the inventory client.
#[derive(Debug, Deserialize, Clone)]
pub struct InventorySettings {
    pub url: String,
    pub token: String,
    pub timeout_secs: u64,
}

/// Limits applied by the dispatcher.
#[derive(Debug, Deserialize, Clone)]
pub struct WorkerSettings {
    pub max_in_flight: usize,
    pub shutdown_grace_secs: u64,
}

/// Flat view of the raw sources (config file + environment).
///
/// Keys are the lower-cased environment variable names, so
/// `RABBITMQ_INCOMING_QUEUE` lands in `rabbitmq_incoming_queue`.
/// Every value is optional here; required ones are checked when merging.
#[derive(Debug, Default, Deserialize)]
pub struct PartialSettings {
    pub rabbitmq_url: Option<String>,
    pub rabbitmq_incoming_queue: Option<String>,
    pub rabbitmq_outgoing_queue: Option<String>,
    pub rabbitmq_retry_delay: Option<String>,
    pub rabbitmq_consumer_tag: Option<String>,
    pub worker_max_in_flight: Option<usize>,
    pub worker_shutdown_grace_secs: Option<u64>,
    pub netbox_api_url: Option<String>,
    pub netbox_api_token: Option<String>,
    pub netbox_timeout_secs: Option<u64>,
    pub log_level: Option<String>,
}

impl BrokerSettings {
    pub const DEFAULT_RETRY_DELAY_SECS: u64 = 5;
    pub const DEFAULT_CONSUMER_TAG: &'static str = "consumer";
}

impl InventorySettings {
    pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
}

/// Provides default values for the optional worker knobs.
impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            max_in_flight: 64,
            shutdown_grace_secs: 10,
        }
    }
}

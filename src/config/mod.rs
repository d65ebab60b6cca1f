mod settings;

use config::{Config, Environment, File};
use tracing::warn;

pub use config::ConfigError;
pub use settings::{BrokerSettings, InventorySettings, PartialSettings, Settings, WorkerSettings};


/// Loads the configuration from `config/default` (optional) and the process
/// environment, the latter taking precedence.
pub fn load_config() -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(Environment::default());

    let config = builder.build()?;
    let partial: PartialSettings = config.try_deserialize()?;

    merge(partial)
}

/// Folds a partial configuration into complete `Settings`, filling in
/// defaults and rejecting missing required values.
pub fn merge(partial: PartialSettings) -> Result<Settings, ConfigError> {
    let worker_defaults = WorkerSettings::default();

    Ok(Settings {
        broker: BrokerSettings {
            url: required(partial.rabbitmq_url, "RABBITMQ_URL")?,
            incoming_queue: required(partial.rabbitmq_incoming_queue, "RABBITMQ_INCOMING_QUEUE")?,
            outgoing_queue: required(partial.rabbitmq_outgoing_queue, "RABBITMQ_OUTGOING_QUEUE")?,
            retry_delay_secs: parse_retry_delay(partial.rabbitmq_retry_delay.as_deref()),
            consumer_tag: partial
                .rabbitmq_consumer_tag
                .unwrap_or_else(|| BrokerSettings::DEFAULT_CONSUMER_TAG.to_string()),
        },
        inventory: InventorySettings {
            url: required(partial.netbox_api_url, "NETBOX_API_URL")?,
            token: required(partial.netbox_api_token, "NETBOX_API_TOKEN")?,
            timeout_secs: partial
                .netbox_timeout_secs
                .unwrap_or(InventorySettings::DEFAULT_TIMEOUT_SECS),
        },
        worker: WorkerSettings {
            max_in_flight: partial
                .worker_max_in_flight
                .filter(|n| *n > 0)
                .unwrap_or(worker_defaults.max_in_flight),
            shutdown_grace_secs: partial
                .worker_shutdown_grace_secs
                .unwrap_or(worker_defaults.shutdown_grace_secs),
        },
        log_level: partial.log_level.unwrap_or_else(|| "info".to_string()),
    })
}

fn required(value: Option<String>, key: &str) -> Result<String, ConfigError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ConfigError::NotFound(key.to_string())),
    }
}

/// An unparsable retry delay keeps the default rather than aborting startup.
fn parse_retry_delay(raw: Option<&str>) -> u64 {
    match raw {
        None => BrokerSettings::DEFAULT_RETRY_DELAY_SECS,
        Some(value) => value.trim().parse().unwrap_or_else(|_| {
            warn!(
                value,
                default = BrokerSettings::DEFAULT_RETRY_DELAY_SECS,
                "ignoring invalid RABBITMQ_RETRY_DELAY"
            );
            BrokerSettings::DEFAULT_RETRY_DELAY_SECS
        }),
    }
}

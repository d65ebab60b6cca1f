//! Startup wiring: broker session, topology, inventory client, dispatcher.

use std::sync::Arc;

use tracing::{error, info};

use crate::broker::{BrokerSession, Topology};
use crate::config::Settings;
use crate::dispatch::{Dispatcher, RetryPolicy, StopReason, WorkerContext};
use crate::inventory::{Inventory, NetboxClient};
use crate::supervisor::Supervisor;
use crate::utils::BridgeError;

/// Runs the bridge until an operator signal or broker teardown.
///
/// Returns `Ok(())` only when the operator asked for the stop.
pub async fn run(settings: Settings) -> Result<(), BridgeError> {
    let topology = Topology::from_settings(&settings.broker);

    let session = BrokerSession::connect(&settings.broker.url).await?;
    session.declare(&topology).await?;

    let netbox = NetboxClient::from_settings(&settings.inventory);
    netbox.connect().await?;
    if !netbox.is_connected() {
        return Err(BridgeError::InventoryUnreachable {
            url: netbox.base_url().to_string(),
        });
    }

    // consume only once the inventory is reachable: deliveries are auto-acked
    let deliveries = session
        .consume(topology.incoming_queue(), &settings.broker.consumer_tag)
        .await?;

    let ctx = WorkerContext::new(
        Arc::new(netbox),
        Arc::new(session.publisher()),
        &topology,
        RetryPolicy::from_settings(&settings.broker),
    );
    let dispatcher = Dispatcher::from_settings(ctx, &settings.worker);

    let supervisor = Supervisor::new();
    let signals = supervisor.watch_signals();
    info!(
        incoming = topology.incoming_queue(),
        outgoing = topology.outgoing_queue(),
        retry_delay_secs = settings.broker.retry_delay_secs,
        "bridge started, press Ctrl-C to exit"
    );

    let reason = dispatcher.run(deliveries, supervisor.token()).await;
    signals.abort();
    session.close().await;

    match reason {
        StopReason::Cancelled => {
            info!("bridge stopped");
            Ok(())
        }
        StopReason::ConsumerClosed | StopReason::ConsumerFailed => {
            error!(?reason, "broker consumer went away");
            Err(BridgeError::ConsumerClosed)
        }
    }
}

//! Per-delivery processing.
//!
//! Each delivery is handled start to finish by [`process`], which never
//! fails: every error is logged and folded into the returned [`Disposition`].

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{Span, error, info, warn};

use super::policy::{Action, Outcome, RetryPolicy};
use crate::broker::{BrokerError, InboundDelivery, Publication, Publisher, Route, Topology};
use crate::event::{self, VmEvent};
use crate::inventory::Inventory;

/// How a delivery ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Notified,
    NotifyFailed,
    Redelivered { fail_count: u32 },
    RedeliveryFailed { fail_count: u32 },
    Dropped(DropReason),
    /// Shutdown cut the task short after the grace period.
    Abandoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Malformed,
    Exhausted,
}

/// Everything a task needs, shared by all tasks.
pub struct WorkerContext {
    pub inventory: Arc<dyn Inventory>,
    pub publisher: Arc<dyn Publisher>,
    pub policy: RetryPolicy,
    success_route: Route,
    redelivery_route: Route,
}

impl WorkerContext {
    pub fn new(
        inventory: Arc<dyn Inventory>,
        publisher: Arc<dyn Publisher>,
        topology: &Topology,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            inventory,
            publisher,
            policy,
            success_route: topology.success_route(),
            redelivery_route: topology.redelivery_route(),
        }
    }
}

pub async fn process(
    ctx: &WorkerContext,
    delivery: InboundDelivery,
    cancel: &CancellationToken,
) -> Disposition {
    let event = match event::decode(&delivery.payload, delivery.timestamp) {
        Ok(event) => event,
        Err(e) => {
            warn!(
                error = %e,
                payload = %String::from_utf8_lossy(&delivery.payload),
                "dropping undecodable message"
            );
            return Disposition::Dropped(DropReason::Malformed);
        }
    };
    Span::current().record("hostname", event.hostname.as_str());

    let outcome = tokio::select! {
        _ = cancel.cancelled() => {
            warn!(hostname = %event.hostname, "shutdown interrupted reconciliation");
            return Disposition::Abandoned;
        }
        result = ctx.inventory.reconcile(&event) => match result {
            Ok(()) => {
                info!(outcome = "success", hostname = %event.hostname, "VM is up to date");
                Outcome::Reconciled
            }
            Err(e) if e.is_transient() => {
                warn!(error = %e, fail_count = event.fail_count, "error creating or updating VM");
                Outcome::Failed
            }
            Err(e) => {
                error!(error = %e, fail_count = event.fail_count, "inventory rejected VM");
                Outcome::Failed
            }
        },
    };

    match ctx.policy.decide(outcome, event.fail_count) {
        Action::EmitSuccess => notify(ctx, &event, cancel).await,
        Action::Redeliver { fail_count, delay } => {
            redeliver(ctx, &event.with_budget(fail_count), delay, cancel).await
        }
        Action::Drop => {
            error!(
                hostname = %event.hostname,
                "retry budget exhausted, dropping message"
            );
            Disposition::Dropped(DropReason::Exhausted)
        }
    }
}

async fn notify(ctx: &WorkerContext, event: &VmEvent, cancel: &CancellationToken) -> Disposition {
    let payload = match event::encode(event) {
        Ok(payload) => payload,
        Err(e) => {
            error!(error = %e, "failed to encode success message");
            return Disposition::NotifyFailed;
        }
    };
    let publication =
        Publication::new(ctx.success_route.clone(), payload).stamped(event.timestamp);

    match publish(ctx, publication, cancel).await {
        Some(Ok(())) => {
            info!(outcome = "success", hostname = %event.hostname, "sent success message");
            Disposition::Notified
        }
        Some(Err(e)) => {
            warn!(error = %e, hostname = %event.hostname, "error publishing success message");
            Disposition::NotifyFailed
        }
        None => Disposition::Abandoned,
    }
}

async fn redeliver(
    ctx: &WorkerContext,
    event: &VmEvent,
    delay: Duration,
    cancel: &CancellationToken,
) -> Disposition {
    let fail_count = event.fail_count;
    let payload = match event::encode(event) {
        Ok(payload) => payload,
        Err(e) => {
            error!(error = %e, "failed to encode redelivery");
            return Disposition::RedeliveryFailed { fail_count };
        }
    };
    let publication = Publication::new(ctx.redelivery_route.clone(), payload)
        .delayed(delay)
        .stamped(event.timestamp);

    match publish(ctx, publication, cancel).await {
        Some(Ok(())) => {
            warn!(
                hostname = %event.hostname,
                fail_count,
                delay_secs = delay.as_secs(),
                "re-sent message for another attempt"
            );
            Disposition::Redelivered { fail_count }
        }
        Some(Err(e)) => {
            error!(error = %e, hostname = %event.hostname, "error re-publishing message, message lost");
            Disposition::RedeliveryFailed { fail_count }
        }
        None => Disposition::Abandoned,
    }
}

/// `None` when shutdown cancelled the publish.
async fn publish(
    ctx: &WorkerContext,
    publication: Publication,
    cancel: &CancellationToken,
) -> Option<Result<(), BrokerError>> {
    tokio::select! {
        _ = cancel.cancelled() => {
            warn!("shutdown interrupted publish");
            None
        }
        result = ctx.publisher.publish(publication) => Some(result),
    }
}

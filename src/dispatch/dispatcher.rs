//! Consume loop and task fan-out.
//!
//! Concurrency and usage notes:
//! - At most `max_in_flight` deliveries are processed at once. The loop waits
//!   for a free slot before pulling the next delivery, so a surge on the
//!   queue is absorbed by the broker rather than by this process.
//! - Cancellation is observed between deliveries. Once it fires the loop
//!   stops consuming and drains in-flight tasks for up to `shutdown_grace`;
//!   tasks still running after that are told to abandon their work.
//! - The end of the consumer stream (or a consumer error) cancels the
//!   shutdown token itself, bringing the whole process down.

use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, error, field, info, info_span, warn};
use uuid::Uuid;

use super::worker::{WorkerContext, process};
use crate::broker::{BrokerError, InboundDelivery};
use crate::config::WorkerSettings;

/// Why the consume loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The shutdown token was cancelled from outside.
    Cancelled,
    /// The consumer stream ended: the broker closed the channel.
    ConsumerClosed,
    ConsumerFailed,
}

pub struct Dispatcher {
    ctx: Arc<WorkerContext>,
    slots: Arc<Semaphore>,
    tracker: TaskTracker,
    shutdown_grace: Duration,
}

impl Dispatcher {
    pub fn new(ctx: WorkerContext, max_in_flight: usize, shutdown_grace: Duration) -> Self {
        Self {
            ctx: Arc::new(ctx),
            slots: Arc::new(Semaphore::new(max_in_flight.max(1))),
            tracker: TaskTracker::new(),
            shutdown_grace,
        }
    }

    pub fn from_settings(ctx: WorkerContext, settings: &WorkerSettings) -> Self {
        Self::new(
            ctx,
            settings.max_in_flight,
            Duration::from_secs(settings.shutdown_grace_secs),
        )
    }

    /// Number of deliveries currently being processed.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Runs until `shutdown` is cancelled or the consumer goes away, then
    /// drains in-flight tasks.
    pub async fn run<S>(&self, mut deliveries: S, shutdown: CancellationToken) -> StopReason
    where
        S: Stream<Item = Result<InboundDelivery, BrokerError>> + Unpin,
    {
        let abandon = CancellationToken::new();
        info!("waiting for messages");

        let reason = loop {
            let permit = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break StopReason::Cancelled,
                permit = self.slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break StopReason::Cancelled,
                },
            };

            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break StopReason::Cancelled,
                next = deliveries.next() => next,
            };

            match next {
                Some(Ok(delivery)) => {
                    let ctx = self.ctx.clone();
                    let abandon = abandon.clone();
                    let span = info_span!(
                        "delivery",
                        delivery_id = %Uuid::new_v4(),
                        hostname = field::Empty
                    );
                    self.tracker.spawn(
                        async move {
                            let disposition = process(&ctx, delivery, &abandon).await;
                            debug!(?disposition, "delivery finished");
                            drop(permit);
                        }
                        .instrument(span),
                    );
                }
                Some(Err(e)) => {
                    error!(error = %e, "consumer failed");
                    shutdown.cancel();
                    break StopReason::ConsumerFailed;
                }
                None => {
                    info!("end of queue reached, shutting down");
                    shutdown.cancel();
                    break StopReason::ConsumerClosed;
                }
            }
        };

        self.drain(&abandon).await;
        reason
    }

    async fn drain(&self, abandon: &CancellationToken) {
        self.tracker.close();
        if self.tracker.is_empty() {
            return;
        }

        info!(in_flight = self.in_flight(), "draining in-flight deliveries");
        if tokio::time::timeout(self.shutdown_grace, self.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                in_flight = self.in_flight(),
                "grace period elapsed, abandoning in-flight deliveries"
            );
            abandon.cancel();
            self.tracker.wait().await;
        }
    }
}

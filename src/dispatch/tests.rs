use super::dispatcher::{Dispatcher, StopReason};
use super::policy::{Action, Outcome, RetryPolicy};
use super::worker::{Disposition, DropReason, WorkerContext, process};
use crate::broker::{BrokerError, InboundDelivery, Publication, Publisher, Topology};
use crate::config::BrokerSettings;
use crate::event::VmEvent;
use crate::inventory::{Inventory, InventoryError};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futures::channel::mpsc;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

const INCOMING: &str = "vm.incoming";
const OUTGOING: &str = "vm.outgoing";

/// Inventory fake that fails a scripted number of times before converging.
#[derive(Default)]
struct ScriptedInventory {
    failures_left: Mutex<usize>,
    permanent: bool,
    delay: Option<Duration>,
    calls: Mutex<Vec<VmEvent>>,
    records: Mutex<HashMap<String, VmEvent>>,
}

impl ScriptedInventory {
    fn healthy() -> Self {
        Self::default()
    }

    fn failing(times: usize) -> Self {
        Self {
            failures_left: Mutex::new(times),
            ..Self::default()
        }
    }

    fn always_failing() -> Self {
        Self::failing(usize::MAX)
    }

    fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    fn calls(&self) -> Vec<VmEvent> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Inventory for ScriptedInventory {
    async fn connect(&self) -> Result<(), InventoryError> {
        Ok(())
    }

    fn is_connected(&self) -> bool {
        true
    }

    async fn reconcile(&self, event: &VmEvent) -> Result<(), InventoryError> {
        self.calls.lock().unwrap().push(event.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        {
            let mut left = self.failures_left.lock().unwrap();
            if *left > 0 {
                *left -= 1;
                return Err(if self.permanent {
                    InventoryError::Permanent {
                        message: "bad request".to_string(),
                    }
                } else {
                    InventoryError::Transient {
                        message: "503 Service Unavailable".to_string(),
                    }
                });
            }
        }
        let mut record = event.clone();
        record.fail_count = 0;
        record.timestamp = None;
        self.records
            .lock()
            .unwrap()
            .insert(event.hostname.clone(), record);
        Ok(())
    }
}

/// Inventory fake that blocks every call until the test releases it.
struct GatedInventory {
    gate: Semaphore,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl GatedInventory {
    fn new() -> Self {
        Self {
            gate: Semaphore::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Inventory for GatedInventory {
    async fn connect(&self) -> Result<(), InventoryError> {
        Ok(())
    }

    fn is_connected(&self) -> bool {
        true
    }

    async fn reconcile(&self, _event: &VmEvent) -> Result<(), InventoryError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        if let Ok(permit) = self.gate.acquire().await {
            permit.forget();
        }
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct RecordingPublisher {
    published: Mutex<Vec<Publication>>,
    fail: AtomicBool,
}

impl RecordingPublisher {
    fn broken() -> Self {
        Self {
            fail: AtomicBool::new(true),
            ..Self::default()
        }
    }

    fn published(&self) -> Vec<Publication> {
        self.published.lock().unwrap().clone()
    }

    fn to_incoming(&self) -> Vec<Publication> {
        self.published()
            .into_iter()
            .filter(|p| p.route.exchange == INCOMING)
            .collect()
    }

    fn to_outgoing(&self) -> Vec<Publication> {
        self.published()
            .into_iter()
            .filter(|p| p.route.routing_key == OUTGOING)
            .collect()
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(&self, publication: Publication) -> Result<(), BrokerError> {
        self.published.lock().unwrap().push(publication.clone());
        if self.fail.load(Ordering::SeqCst) {
            return Err(BrokerError::Nacked {
                exchange: publication.route.exchange,
                routing_key: publication.route.routing_key,
            });
        }
        Ok(())
    }
}

fn context(
    inventory: Arc<dyn Inventory>,
    publisher: Arc<RecordingPublisher>,
    delay_secs: u64,
) -> WorkerContext {
    WorkerContext::new(
        inventory,
        publisher,
        &Topology::new(INCOMING, OUTGOING),
        RetryPolicy::from_secs(delay_secs),
    )
}

fn body(publication: &Publication) -> Value {
    serde_json::from_slice(&publication.payload).unwrap()
}

/// Processes `payload`, feeding every redelivery back in the way the delayed
/// exchange would, until the chain ends.
async fn run_chain(
    ctx: &WorkerContext,
    publisher: &RecordingPublisher,
    payload: &[u8],
) -> Vec<Disposition> {
    let cancel = CancellationToken::new();
    let mut dispositions = Vec::new();
    let mut next = Some(payload.to_vec());

    while let Some(payload) = next.take() {
        let disposition = process(ctx, InboundDelivery::new(payload), &cancel).await;
        if let Disposition::Redelivered { .. } = disposition {
            next = publisher.to_incoming().last().map(|p| p.payload.clone());
        }
        dispositions.push(disposition);
    }
    dispositions
}

// ---- retry policy ----

#[test]
fn test_policy_success_always_notifies() {
    let policy = RetryPolicy::default();
    for budget in [0, 1, 20] {
        assert_eq!(policy.decide(Outcome::Reconciled, budget), Action::EmitSuccess);
    }
}

#[test]
fn test_policy_redelivers_with_decremented_budget() {
    let policy = RetryPolicy::default();
    assert_eq!(
        policy.decide(Outcome::Failed, 20),
        Action::Redeliver {
            fail_count: 19,
            delay: Duration::from_secs(5),
        }
    );
    assert_eq!(
        policy.decide(Outcome::Failed, 2),
        Action::Redeliver {
            fail_count: 1,
            delay: Duration::from_secs(5),
        }
    );
}

#[test]
fn test_policy_delay_follows_broker_settings() {
    assert_eq!(
        RetryPolicy::default().delay(),
        Duration::from_secs(BrokerSettings::DEFAULT_RETRY_DELAY_SECS)
    );

    let settings = BrokerSettings {
        url: "amqp://localhost".to_string(),
        incoming_queue: INCOMING.to_string(),
        outgoing_queue: OUTGOING.to_string(),
        retry_delay_secs: 30,
        consumer_tag: BrokerSettings::DEFAULT_CONSUMER_TAG.to_string(),
    };
    assert_eq!(
        RetryPolicy::from_settings(&settings).delay(),
        Duration::from_secs(30)
    );
}

#[test]
fn test_policy_drops_when_budget_reaches_zero() {
    let policy = RetryPolicy::default();
    assert_eq!(policy.decide(Outcome::Failed, 1), Action::Drop);
    assert_eq!(policy.decide(Outcome::Failed, 0), Action::Drop);
}

#[test]
fn test_policy_budget_strictly_decreases() {
    let policy = RetryPolicy::from_secs(1);
    let mut budget = 50;
    let mut attempts = 0;
    loop {
        attempts += 1;
        match policy.decide(Outcome::Failed, budget) {
            Action::Redeliver { fail_count, .. } => {
                assert!(fail_count < budget);
                budget = fail_count;
            }
            Action::Drop => break,
            Action::EmitSuccess => unreachable!(),
        }
    }
    assert_eq!(attempts, 50);
}

// ---- per-delivery processing ----

#[tokio::test]
async fn test_happy_path_notifies_once() {
    let inventory = Arc::new(ScriptedInventory::healthy());
    let publisher = Arc::new(RecordingPublisher::default());
    let ctx = context(inventory.clone(), publisher.clone(), 5);

    let dispositions = run_chain(&ctx, &publisher, br#"{"hostname":"vm-a"}"#).await;

    assert_eq!(dispositions, vec![Disposition::Notified]);
    assert_eq!(inventory.calls().len(), 1);
    assert!(publisher.to_incoming().is_empty());

    let notifications = publisher.to_outgoing();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].route.exchange, "");
    assert_eq!(notifications[0].delay, None);
    assert_eq!(
        body(&notifications[0]),
        json!({"hostname": "vm-a", "fail_count": 20})
    );
}

#[tokio::test]
async fn test_transient_failures_then_success() {
    let inventory = Arc::new(ScriptedInventory::failing(2));
    let publisher = Arc::new(RecordingPublisher::default());
    let ctx = context(inventory.clone(), publisher.clone(), 5);

    let dispositions =
        run_chain(&ctx, &publisher, br#"{"hostname":"vm-b","fail_count":3}"#).await;

    assert_eq!(
        dispositions,
        vec![
            Disposition::Redelivered { fail_count: 2 },
            Disposition::Redelivered { fail_count: 1 },
            Disposition::Notified,
        ]
    );

    let redeliveries = publisher.to_incoming();
    assert_eq!(redeliveries.len(), 2);
    for (publication, expected) in redeliveries.iter().zip([2, 1]) {
        assert_eq!(publication.route.routing_key, INCOMING);
        assert_eq!(publication.delay_millis(), Some(5000));
        assert_eq!(body(publication)["fail_count"], expected);
    }

    let calls = inventory.calls();
    assert_eq!(calls.len(), 3);
    assert_eq!(calls.last().unwrap().fail_count, 1);
    assert_eq!(publisher.to_outgoing().len(), 1);
}

#[tokio::test]
async fn test_exhausted_budget_drops_without_publishing() {
    let inventory = Arc::new(ScriptedInventory::always_failing());
    let publisher = Arc::new(RecordingPublisher::default());
    let ctx = context(inventory.clone(), publisher.clone(), 5);

    let dispositions =
        run_chain(&ctx, &publisher, br#"{"hostname":"vm-c","fail_count":1}"#).await;

    assert_eq!(
        dispositions,
        vec![Disposition::Dropped(DropReason::Exhausted)]
    );
    assert_eq!(inventory.calls().len(), 1);
    assert!(publisher.published().is_empty());
}

#[tokio::test]
async fn test_default_budget_allows_nineteen_redeliveries() {
    let inventory = Arc::new(ScriptedInventory::always_failing());
    let publisher = Arc::new(RecordingPublisher::default());
    let ctx = context(inventory.clone(), publisher.clone(), 5);

    let dispositions = run_chain(&ctx, &publisher, br#"{"hostname":"vm-d"}"#).await;

    assert_eq!(dispositions.len(), 20);
    assert_eq!(
        dispositions.last(),
        Some(&Disposition::Dropped(DropReason::Exhausted))
    );
    assert_eq!(inventory.calls().len(), 20);

    let budgets: Vec<u64> = publisher
        .to_incoming()
        .iter()
        .map(|p| body(p)["fail_count"].as_u64().unwrap())
        .collect();
    assert_eq!(budgets, (1..=19).rev().collect::<Vec<u64>>());
    assert!(publisher.to_outgoing().is_empty());
}

#[tokio::test]
async fn test_permanent_errors_consume_the_budget() {
    let inventory = Arc::new(ScriptedInventory {
        failures_left: Mutex::new(usize::MAX),
        permanent: true,
        ..ScriptedInventory::default()
    });
    let publisher = Arc::new(RecordingPublisher::default());
    let ctx = context(inventory.clone(), publisher.clone(), 5);

    let dispositions =
        run_chain(&ctx, &publisher, br#"{"hostname":"vm-p","fail_count":3}"#).await;

    assert_eq!(dispositions.len(), 3);
    assert_eq!(publisher.to_incoming().len(), 2);
}

#[tokio::test]
async fn test_malformed_payload_is_dropped_silently() {
    let inventory = Arc::new(ScriptedInventory::healthy());
    let publisher = Arc::new(RecordingPublisher::default());
    let ctx = context(inventory.clone(), publisher.clone(), 5);

    let payloads: [&[u8]; 3] = [b"not-json", br#"{"hostname":""}"#, br#"{"vcpus":2}"#];
    for payload in payloads {
        let dispositions = run_chain(&ctx, &publisher, payload).await;
        assert_eq!(
            dispositions,
            vec![Disposition::Dropped(DropReason::Malformed)]
        );
    }
    assert!(inventory.calls().is_empty());
    assert!(publisher.published().is_empty());
}

#[tokio::test]
async fn test_custom_retry_delay_in_header() {
    let inventory = Arc::new(ScriptedInventory::failing(1));
    let publisher = Arc::new(RecordingPublisher::default());
    let ctx = context(inventory, publisher.clone(), 30);

    run_chain(&ctx, &publisher, br#"{"hostname":"vm-b","fail_count":3}"#).await;

    let redeliveries = publisher.to_incoming();
    assert_eq!(redeliveries.len(), 1);
    assert_eq!(redeliveries[0].delay_millis(), Some(30_000));
}

#[tokio::test]
async fn test_redelivery_keeps_opaque_fields() {
    let inventory = Arc::new(ScriptedInventory::failing(1));
    let publisher = Arc::new(RecordingPublisher::default());
    let ctx = context(inventory, publisher.clone(), 5);

    let payload = json!({
        "hostname": "vm-e",
        "fail_count": 4,
        "cluster": "pve",
        "disks": [{"size": 32}]
    });
    run_chain(&ctx, &publisher, payload.to_string().as_bytes()).await;

    let redelivered = body(&publisher.to_incoming()[0]);
    assert_eq!(
        redelivered,
        json!({
            "hostname": "vm-e",
            "fail_count": 3,
            "cluster": "pve",
            "disks": [{"size": 32}]
        })
    );
    assert_eq!(body(&publisher.to_outgoing()[0]), redelivered);
}

#[tokio::test]
async fn test_delivery_timestamp_is_carried_to_publications() {
    let inventory = Arc::new(ScriptedInventory::failing(1));
    let publisher = Arc::new(RecordingPublisher::default());
    let ctx = context(inventory, publisher.clone(), 5);
    let ts = Utc.with_ymd_and_hms(2024, 6, 1, 8, 30, 0).unwrap();

    let delivery = InboundDelivery {
        payload: br#"{"hostname":"vm-t","fail_count":2}"#.to_vec(),
        timestamp: Some(ts),
    };
    let disposition = process(&ctx, delivery, &CancellationToken::new()).await;

    assert_eq!(disposition, Disposition::Redelivered { fail_count: 1 });
    assert_eq!(publisher.to_incoming()[0].timestamp, Some(ts));
}

#[tokio::test]
async fn test_notification_publish_failure_is_not_retried() {
    let inventory = Arc::new(ScriptedInventory::healthy());
    let publisher = Arc::new(RecordingPublisher::broken());
    let ctx = context(inventory.clone(), publisher.clone(), 5);

    let dispositions = run_chain(&ctx, &publisher, br#"{"hostname":"vm-a"}"#).await;

    assert_eq!(dispositions, vec![Disposition::NotifyFailed]);
    assert_eq!(publisher.published().len(), 1);
    assert_eq!(inventory.calls().len(), 1);
}

#[tokio::test]
async fn test_redelivery_publish_failure_loses_message() {
    let inventory = Arc::new(ScriptedInventory::always_failing());
    let publisher = Arc::new(RecordingPublisher::broken());
    let ctx = context(inventory.clone(), publisher.clone(), 5);

    let dispositions =
        run_chain(&ctx, &publisher, br#"{"hostname":"vm-b","fail_count":5}"#).await;

    assert_eq!(
        dispositions,
        vec![Disposition::RedeliveryFailed { fail_count: 4 }]
    );
    assert_eq!(inventory.calls().len(), 1);
}

#[tokio::test]
async fn test_repeated_events_converge_to_one_record() {
    let inventory = Arc::new(ScriptedInventory::healthy());
    let publisher = Arc::new(RecordingPublisher::default());
    let ctx = context(inventory.clone(), publisher.clone(), 5);
    let payload = br#"{"hostname":"vm-i","vcpus":4}"#;

    run_chain(&ctx, &publisher, payload).await;
    let after_one = inventory.records.lock().unwrap().clone();
    for _ in 0..4 {
        run_chain(&ctx, &publisher, payload).await;
    }

    assert_eq!(*inventory.records.lock().unwrap(), after_one);
    assert_eq!(publisher.to_outgoing().len(), 5);
}

#[tokio::test]
async fn test_cancelled_task_abandons_reconciliation() {
    let inventory = Arc::new(ScriptedInventory::slow(Duration::from_secs(30)));
    let publisher = Arc::new(RecordingPublisher::default());
    let ctx = context(inventory, publisher.clone(), 5);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let disposition = process(
        &ctx,
        InboundDelivery::new(&br#"{"hostname":"vm-s"}"#[..]),
        &cancel,
    )
    .await;

    assert_eq!(disposition, Disposition::Abandoned);
    assert!(publisher.published().is_empty());
}

// ---- dispatcher ----

type Feed = mpsc::UnboundedSender<Result<InboundDelivery, BrokerError>>;

fn feed() -> (Feed, mpsc::UnboundedReceiver<Result<InboundDelivery, BrokerError>>) {
    mpsc::unbounded()
}

fn delivery(hostname: &str) -> Result<InboundDelivery, BrokerError> {
    Ok(InboundDelivery::new(
        json!({ "hostname": hostname }).to_string().into_bytes(),
    ))
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_dispatcher_processes_until_consumer_closes() {
    let inventory = Arc::new(ScriptedInventory::healthy());
    let publisher = Arc::new(RecordingPublisher::default());
    let dispatcher = Dispatcher::new(
        context(inventory.clone(), publisher.clone(), 5),
        8,
        Duration::from_secs(5),
    );
    let (tx, rx) = feed();
    for host in ["vm-1", "vm-2", "vm-3"] {
        tx.unbounded_send(delivery(host)).unwrap();
    }
    tx.unbounded_send(Ok(InboundDelivery::new(&b"not-json"[..])))
        .unwrap();
    drop(tx);

    let shutdown = CancellationToken::new();
    let reason = dispatcher.run(rx, shutdown.clone()).await;

    assert_eq!(reason, StopReason::ConsumerClosed);
    assert!(shutdown.is_cancelled());
    assert_eq!(inventory.calls().len(), 3);
    assert_eq!(publisher.to_outgoing().len(), 3);
    assert_eq!(dispatcher.in_flight(), 0);
}

#[tokio::test]
async fn test_dispatcher_stops_on_consumer_error() {
    let inventory = Arc::new(ScriptedInventory::healthy());
    let publisher = Arc::new(RecordingPublisher::default());
    let dispatcher = Dispatcher::new(
        context(inventory, publisher, 5),
        8,
        Duration::from_secs(1),
    );
    let (tx, rx) = feed();
    tx.unbounded_send(Err(BrokerError::Nacked {
        exchange: String::new(),
        routing_key: INCOMING.to_string(),
    }))
    .unwrap();

    let shutdown = CancellationToken::new();
    let reason = dispatcher.run(rx, shutdown.clone()).await;

    assert_eq!(reason, StopReason::ConsumerFailed);
    assert!(shutdown.is_cancelled());
}

#[tokio::test]
async fn test_dispatcher_caps_in_flight_reconciliations() {
    let inventory = Arc::new(GatedInventory::new());
    let publisher = Arc::new(RecordingPublisher::default());
    let dispatcher = Arc::new(Dispatcher::new(
        context(inventory.clone(), publisher.clone(), 5),
        2,
        Duration::from_secs(5),
    ));
    let (tx, rx) = feed();
    for i in 0..5 {
        tx.unbounded_send(delivery(&format!("vm-{i}"))).unwrap();
    }
    drop(tx);

    let shutdown = CancellationToken::new();
    let run = {
        let dispatcher = dispatcher.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { dispatcher.run(rx, shutdown).await })
    };

    wait_until(|| inventory.active.load(Ordering::SeqCst) == 2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(inventory.active.load(Ordering::SeqCst), 2);

    inventory.gate.add_permits(5);
    let reason = run.await.unwrap();

    assert_eq!(reason, StopReason::ConsumerClosed);
    assert_eq!(inventory.max_active.load(Ordering::SeqCst), 2);
    assert_eq!(publisher.to_outgoing().len(), 5);
}

#[tokio::test]
async fn test_shutdown_drains_in_flight_tasks_within_grace() {
    let inventory = Arc::new(ScriptedInventory::slow(Duration::from_millis(100)));
    let publisher = Arc::new(RecordingPublisher::default());
    let dispatcher = Arc::new(Dispatcher::new(
        context(inventory.clone(), publisher.clone(), 5),
        8,
        Duration::from_secs(5),
    ));
    let (tx, rx) = feed();
    tx.unbounded_send(delivery("vm-a")).unwrap();
    tx.unbounded_send(delivery("vm-b")).unwrap();

    let shutdown = CancellationToken::new();
    let run = {
        let dispatcher = dispatcher.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { dispatcher.run(rx, shutdown).await })
    };

    wait_until(|| inventory.calls().len() == 2).await;
    shutdown.cancel();
    let reason = run.await.unwrap();

    assert_eq!(reason, StopReason::Cancelled);
    assert_eq!(publisher.to_outgoing().len(), 2);

    // nothing sent after cancellation is consumed
    let _ = tx.unbounded_send(delivery("vm-late"));
    assert_eq!(inventory.calls().len(), 2);
}

#[tokio::test]
async fn test_shutdown_abandons_tasks_after_grace() {
    let inventory = Arc::new(ScriptedInventory::slow(Duration::from_secs(60)));
    let publisher = Arc::new(RecordingPublisher::default());
    let dispatcher = Arc::new(Dispatcher::new(
        context(inventory.clone(), publisher.clone(), 5),
        8,
        Duration::from_millis(50),
    ));
    let (tx, rx) = feed();
    tx.unbounded_send(delivery("vm-a")).unwrap();

    let shutdown = CancellationToken::new();
    let run = {
        let dispatcher = dispatcher.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { dispatcher.run(rx, shutdown).await })
    };

    wait_until(|| inventory.calls().len() == 1).await;
    shutdown.cancel();

    let reason = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("dispatcher should exit after the grace period")
        .unwrap();

    assert_eq!(reason, StopReason::Cancelled);
    assert!(publisher.published().is_empty());
    assert_eq!(dispatcher.in_flight(), 0);
    drop(tx);
}

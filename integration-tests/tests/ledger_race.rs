// Deterministic interleavings of two processes dispatching the same key

mod support;

use async_trait::async_trait;
use common::channels::ChannelRegistry;
use common::clock::{Clock, TokioClock};
use common::errors::StorageError;
use common::ledger::DeliveryLedger;
use common::models::{
    Channel, DeliveryRecord, DeliveryStatus, EventRef, IdempotencyKey, Identity, Recipient,
    ReminderClass, RoleTemplates, ScheduledEvent,
};
use common::notifier::{ChannelNotifier, ChannelOutcome, DeliveryOutcome};
use common::storage::{InMemoryLedgerStore, LedgerStore};
use common::telemetry::LogAlertNotifier;
use common::templates::{TemplateField, TemplateRenderer};
use std::sync::Arc;
use support::{at, template, ScriptedTransport};
use tokio::sync::{Barrier, Mutex, Notify};

/// Ledger store view of one process. Hooks pin the order in which the two
/// processes reach the shared store.
struct OrderedLedgerStore {
    process: &'static str,
    inner: Arc<InMemoryLedgerStore>,
    log: Arc<Mutex<Vec<String>>>,
    /// Awaited before the pre-send check
    wait_before_check: Option<Arc<Notify>>,
    /// Both processes meet here after their checks
    after_check: Option<Arc<Barrier>>,
    /// Signalled once an append has landed
    after_append: Option<Arc<Notify>>,
}

impl OrderedLedgerStore {
    fn new(process: &'static str, inner: Arc<InMemoryLedgerStore>, log: Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            process,
            inner,
            log,
            wait_before_check: None,
            after_check: None,
            after_append: None,
        }
    }
}

#[async_trait]
impl LedgerStore for OrderedLedgerStore {
    async fn append(&self, record: &DeliveryRecord) -> Result<(), StorageError> {
        let result = self.inner.append(record).await;
        self.log.lock().await.push(format!(
            "{}:append:{}:{}",
            self.process,
            record.status,
            if result.is_ok() { "ok" } else { "rejected" }
        ));
        if let Some(notify) = &self.after_append {
            notify.notify_one();
        }
        result
    }

    async fn find_sent(&self, key: &IdempotencyKey) -> Result<Option<DeliveryRecord>, StorageError> {
        if let Some(notify) = &self.wait_before_check {
            notify.notified().await;
        }
        let found = self.inner.find_sent(key).await;
        self.log.lock().await.push(format!(
            "{}:check:{}",
            self.process,
            matches!(found, Ok(Some(_)))
        ));
        if let Some(barrier) = &self.after_check {
            barrier.wait().await;
        }
        found
    }

    async fn history(&self, key: &IdempotencyKey) -> Result<Vec<DeliveryRecord>, StorageError> {
        self.inner.history(key).await
    }

    async fn recent(&self, limit: usize) -> Result<Vec<DeliveryRecord>, StorageError> {
        self.inner.recent(limit).await
    }
}

fn whatsapp_only() -> ReminderClass {
    ReminderClass::new(
        "near-term",
        chrono::Duration::minutes(15),
        chrono::Duration::minutes(1),
        chrono::Duration::minutes(5),
        vec![Channel::WhatsApp],
        RoleTemplates {
            owner: None,
            participant: Some(template(
                "before_course_class_15min_student_",
                vec![TemplateField::RecipientName, TemplateField::Subject],
            )),
        },
    )
    .unwrap()
}

fn recipient() -> Recipient {
    let event = ScheduledEvent {
        id: "evt-physics".to_string(),
        starts_at: at(10, 0, 0),
        subject: "Physics".to_string(),
        owner_id: Some("t-1".to_string()),
        participant_ids: vec!["s-1".to_string()],
    };
    Recipient::participant(
        EventRef::from(&event),
        &Identity {
            id: "s-1".to_string(),
            name: "Asha".to_string(),
            phone: Some("+91 98765 00002".to_string()),
            email: None,
        },
        "Mr. Rao",
    )
    .unwrap()
}

fn notifier(
    clock: Arc<dyn Clock>,
    store: OrderedLedgerStore,
    transport: Arc<ScriptedTransport>,
) -> ChannelNotifier {
    let mut registry = ChannelRegistry::new();
    registry.register(transport);
    ChannelNotifier::new(
        clock,
        Arc::new(DeliveryLedger::new(Arc::new(store), Arc::new(LogAlertNotifier))),
        registry,
        TemplateRenderer::new(chrono_tz::UTC),
        std::time::Duration::from_secs(5),
    )
}

fn single(outcomes: Vec<ChannelOutcome>) -> ChannelOutcome {
    assert_eq!(outcomes.len(), 1);
    outcomes.into_iter().next().unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_check_after_other_process_recorded_suppresses_send() {
    let clock: Arc<dyn Clock> = Arc::new(TokioClock::starting_at(at(9, 45, 0)));
    let shared = Arc::new(InMemoryLedgerStore::new());
    let log = Arc::new(Mutex::new(Vec::new()));
    let transport = ScriptedTransport::new(Channel::WhatsApp, clock.clone());
    let recorded = Arc::new(Notify::new());

    let mut first_store = OrderedLedgerStore::new("a", shared.clone(), log.clone());
    first_store.after_append = Some(recorded.clone());
    let mut second_store = OrderedLedgerStore::new("b", shared.clone(), log.clone());
    second_store.wait_before_check = Some(recorded);

    let first = notifier(clock.clone(), first_store, transport.clone());
    let second = notifier(clock.clone(), second_store, transport.clone());
    let class = whatsapp_only();
    let recipient = recipient();

    // The waiting process is polled first so it really has to wait
    let (second_out, first_out) = tokio::join!(
        second.notify(&recipient, &class),
        first.notify(&recipient, &class)
    );
    let (a, b) = (single(first_out), single(second_out));

    assert!(matches!(a.outcome, DeliveryOutcome::Sent { .. }));
    assert_eq!(b.outcome, DeliveryOutcome::AlreadySent);
    assert_eq!(transport.calls().await.len(), 1);
    assert_eq!(
        *log.lock().await,
        vec!["a:check:false", "a:append:sent:ok", "b:check:true"]
    );
    assert_eq!(shared.all().await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_both_checks_before_any_record_keeps_one_sent_record() {
    let clock: Arc<dyn Clock> = Arc::new(TokioClock::starting_at(at(9, 45, 0)));
    let shared = Arc::new(InMemoryLedgerStore::new());
    let log = Arc::new(Mutex::new(Vec::new()));
    let transport = ScriptedTransport::new(Channel::WhatsApp, clock.clone());
    let both_checked = Arc::new(Barrier::new(2));

    let mut first_store = OrderedLedgerStore::new("a", shared.clone(), log.clone());
    first_store.after_check = Some(both_checked.clone());
    let mut second_store = OrderedLedgerStore::new("b", shared.clone(), log.clone());
    second_store.after_check = Some(both_checked);

    let first = notifier(clock.clone(), first_store, transport.clone());
    let second = notifier(clock.clone(), second_store, transport.clone());
    let class = whatsapp_only();
    let recipient = recipient();

    let (a, b) = tokio::join!(
        first.notify(&recipient, &class),
        second.notify(&recipient, &class)
    );
    let (a, b) = (single(a), single(b));

    // The tolerated race: both provider calls go out, the ledger keeps one SENT
    assert_eq!(transport.calls().await.len(), 2);
    assert!(matches!(a.outcome, DeliveryOutcome::Sent { .. }));
    assert!(matches!(b.outcome, DeliveryOutcome::Sent { .. }));
    let flagged = [&a, &b]
        .iter()
        .filter(|o| o.ledger_error.is_some())
        .count();
    assert_eq!(flagged, 1);

    let records = shared.all().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, DeliveryStatus::Sent);

    let log = log.lock().await;
    assert_eq!(log.iter().filter(|l| l.ends_with(":check:false")).count(), 2);
    assert_eq!(log.iter().filter(|l| l.ends_with(":append:sent:rejected")).count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_record_from_one_process_does_not_block_the_other() {
    let clock: Arc<dyn Clock> = Arc::new(TokioClock::starting_at(at(9, 45, 0)));
    let shared = Arc::new(InMemoryLedgerStore::new());
    let log = Arc::new(Mutex::new(Vec::new()));
    let failing = ScriptedTransport::new(Channel::WhatsApp, clock.clone());
    failing.set_failing(true);
    let healthy = ScriptedTransport::new(Channel::WhatsApp, clock.clone());
    let recorded = Arc::new(Notify::new());

    let mut first_store = OrderedLedgerStore::new("a", shared.clone(), log.clone());
    first_store.after_append = Some(recorded.clone());
    let mut second_store = OrderedLedgerStore::new("b", shared.clone(), log.clone());
    second_store.wait_before_check = Some(recorded);

    let first = notifier(clock.clone(), first_store, failing);
    let second = notifier(clock.clone(), second_store, healthy.clone());
    let class = whatsapp_only();
    let recipient = recipient();

    let (a, b) = tokio::join!(
        first.notify(&recipient, &class),
        second.notify(&recipient, &class)
    );
    assert!(matches!(single(a).outcome, DeliveryOutcome::Failed { .. }));
    assert!(matches!(single(b).outcome, DeliveryOutcome::Sent { .. }));
    assert_eq!(healthy.calls().await.len(), 1);

    let statuses: Vec<DeliveryStatus> = shared.all().await.iter().map(|r| r.status).collect();
    assert_eq!(statuses, vec![DeliveryStatus::Failed, DeliveryStatus::Sent]);
}

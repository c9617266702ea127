// Shared wiring for end-to-end reminder tests

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use common::channels::{ChannelRegistry, ChannelTransport, TransportReceipt};
use common::clock::{Clock, TokioClock};
use common::coordinator::ReminderCoordinator;
use common::dispatch::DispatchScheduler;
use common::errors::{StorageError, TransportError};
use common::finder::CandidateFinder;
use common::ledger::DeliveryLedger;
use common::models::{
    Channel, DeliveryRecord, DeliveryStatus, Identity, ReminderClass, RoleTemplates,
    ScheduledEvent,
};
use common::notifier::ChannelNotifier;
use common::resolver::RecipientResolver;
use common::storage::{
    EventStore, InMemoryEventStore, InMemoryIdentityDirectory, InMemoryLedgerStore, LedgerStore,
};
use common::telemetry::LogAlertNotifier;
use common::templates::{MessageTemplate, TemplateField, TemplateMessage, TemplateRenderer};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

pub fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, h, m, s).unwrap()
}

/// Transport that records every call and can be switched to failing
pub struct ScriptedTransport {
    channel: Channel,
    failing: AtomicBool,
    calls: Mutex<Vec<(String, DateTime<Utc>)>>,
    clock: Arc<dyn Clock>,
}

impl ScriptedTransport {
    pub fn new(channel: Channel, clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            channel,
            failing: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
            clock,
        })
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub async fn calls(&self) -> Vec<(String, DateTime<Utc>)> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl ChannelTransport for ScriptedTransport {
    fn channel(&self) -> Channel {
        self.channel
    }

    async fn send_template(
        &self,
        contact: &str,
        _message: &TemplateMessage,
    ) -> Result<TransportReceipt, TransportError> {
        self.calls
            .lock()
            .await
            .push((contact.to_string(), self.clock.now()));
        if self.failing.load(Ordering::SeqCst) {
            return Err(TransportError::Rejected {
                status: 503,
                payload: r#"{"error":"provider unavailable"}"#.to_string(),
            });
        }
        Ok(TransportReceipt {
            provider_status: "200".to_string(),
            payload: r#"{"result":true}"#.to_string(),
        })
    }
}

/// Event store whose range queries can be taken offline
pub struct FlakyEventStore {
    pub inner: InMemoryEventStore,
    down: AtomicBool,
}

impl FlakyEventStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: InMemoryEventStore::new(),
            down: AtomicBool::new(false),
        })
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }
}

#[async_trait]
impl EventStore for FlakyEventStore {
    async fn query_by_start_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ScheduledEvent>, StorageError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("event store down".to_string()));
        }
        self.inner.query_by_start_range(start, end).await
    }

    async fn find_by_id(&self, event_id: &str) -> Result<Option<ScheduledEvent>, StorageError> {
        self.inner.find_by_id(event_id).await
    }

    async fn find_by_owner(
        &self,
        owner_id: &str,
        from: DateTime<Utc>,
    ) -> Result<Vec<ScheduledEvent>, StorageError> {
        self.inner.find_by_owner(owner_id, from).await
    }
}

pub fn template(name: &str, body: Vec<TemplateField>) -> MessageTemplate {
    MessageTemplate {
        name: name.to_string(),
        language_code: "en".to_string(),
        body,
        campaign_id: None,
        email_subject: None,
    }
}

/// 15 minute lead, 1 minute cadence, 5 minute tolerance, WhatsApp and email
pub fn near_term() -> Arc<ReminderClass> {
    Arc::new(
        ReminderClass::new(
            "near-term",
            Duration::minutes(15),
            Duration::minutes(1),
            Duration::minutes(5),
            vec![Channel::WhatsApp, Channel::Email],
            RoleTemplates {
                owner: Some(template(
                    "before_course_class_15mins_teachers_tv",
                    vec![
                        TemplateField::RecipientName,
                        TemplateField::CounterpartName,
                        TemplateField::Subject,
                    ],
                )),
                participant: Some(template(
                    "before_course_class_15min_student_",
                    vec![TemplateField::RecipientName, TemplateField::Subject],
                )),
            },
        )
        .unwrap(),
    )
}

/// Everything one scheduler process owns, over shared stores
pub struct Harness {
    pub clock: Arc<dyn Clock>,
    pub events: Arc<FlakyEventStore>,
    pub directory: Arc<InMemoryIdentityDirectory>,
    pub ledger_store: Arc<InMemoryLedgerStore>,
    pub whatsapp: Arc<ScriptedTransport>,
    pub email: Arc<ScriptedTransport>,
    pub resolver: Arc<RecipientResolver>,
    pub dispatcher: Arc<DispatchScheduler>,
    pub coordinator: ReminderCoordinator,
    pub class: Arc<ReminderClass>,
}

impl Harness {
    /// Owner t-1 with phone and email, participants s-1 (phone and email)
    /// and s-2 (phone only), one session at 10:00Z
    pub async fn start(now: DateTime<Utc>) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(TokioClock::starting_at(now));
        let events = FlakyEventStore::new();
        events
            .inner
            .insert(ScheduledEvent {
                id: "evt-physics".to_string(),
                starts_at: at(10, 0, 0),
                subject: "Physics".to_string(),
                owner_id: Some("t-1".to_string()),
                participant_ids: vec!["s-1".to_string(), "s-2".to_string()],
            })
            .await;

        let directory = Arc::new(InMemoryIdentityDirectory::new());
        for identity in [
            Identity {
                id: "t-1".to_string(),
                name: "Mr. Rao".to_string(),
                phone: Some("+91 98765-00001".to_string()),
                email: Some("Rao@School.example".to_string()),
            },
            Identity {
                id: "s-1".to_string(),
                name: "Asha".to_string(),
                phone: Some("+91 98765 00002".to_string()),
                email: Some("asha@example.com".to_string()),
            },
            Identity {
                id: "s-2".to_string(),
                name: "Ben".to_string(),
                phone: Some("(987) 650-0003".to_string()),
                email: None,
            },
        ] {
            directory.insert(identity).await;
        }

        Self::with_stores(clock, events, directory, Arc::new(InMemoryLedgerStore::new()))
    }

    pub fn with_stores(
        clock: Arc<dyn Clock>,
        events: Arc<FlakyEventStore>,
        directory: Arc<InMemoryIdentityDirectory>,
        ledger_store: Arc<InMemoryLedgerStore>,
    ) -> Self {
        let whatsapp = ScriptedTransport::new(Channel::WhatsApp, clock.clone());
        let email = ScriptedTransport::new(Channel::Email, clock.clone());
        let mut registry = ChannelRegistry::new();
        registry.register(whatsapp.clone());
        registry.register(email.clone());

        let store: Arc<dyn LedgerStore> = ledger_store.clone();
        let notifier = Arc::new(ChannelNotifier::new(
            clock.clone(),
            Arc::new(DeliveryLedger::new(store, Arc::new(LogAlertNotifier))),
            registry,
            TemplateRenderer::new(chrono_tz::Asia::Kolkata),
            std::time::Duration::from_secs(5),
        ));
        let dispatcher = Arc::new(DispatchScheduler::new(
            clock.clone(),
            notifier,
            events.clone(),
            Arc::new(LogAlertNotifier),
        ));
        let resolver = Arc::new(RecipientResolver::new(directory.clone()));
        let class = near_term();
        let coordinator = ReminderCoordinator::new(
            class.clone(),
            clock.clone(),
            Arc::new(CandidateFinder::new(events.clone())),
            resolver.clone(),
            dispatcher.clone(),
            Arc::new(LogAlertNotifier),
            8,
        );

        Self {
            clock,
            events,
            directory,
            ledger_store,
            whatsapp,
            email,
            resolver,
            dispatcher,
            coordinator,
            class,
        }
    }

    /// Resolve the session again and hand every recipient to the dispatcher,
    /// as a manual trigger or a later discovery would
    pub async fn rediscover(&self, event_id: &str) -> Vec<common::dispatch::ScheduleOutcome> {
        let event = self.events.find_by_id(event_id).await.unwrap().unwrap();
        let recipients = self.resolver.resolve(&event).await.unwrap();
        let mut outcomes = Vec::new();
        for recipient in recipients {
            let send_at = self.class.send_at(recipient.event().starts_at);
            outcomes.push(
                self.dispatcher
                    .schedule(recipient, self.class.clone(), send_at)
                    .await,
            );
        }
        outcomes
    }

    pub async fn records(&self) -> Vec<DeliveryRecord> {
        self.ledger_store.all().await
    }

    pub async fn sent(&self) -> Vec<DeliveryRecord> {
        self.records()
            .await
            .into_iter()
            .filter(|r| r.status == DeliveryStatus::Sent)
            .collect()
    }
}

// Reminder coordinator: one polling loop per reminder class

use crate::clock::Clock;
use crate::dispatch::{DispatchScheduler, ScheduleOutcome};
use crate::errors::{ResolutionError, StorageError};
use crate::finder::CandidateFinder;
use crate::models::{Recipient, RecipientRole, ReminderClass, ScheduledEvent};
use crate::notifier::ChannelOutcome;
use crate::resolver::RecipientResolver;
use crate::telemetry::{self, Alert, AlertKind, AlertNotifier};
use crate::window::{start_delay, MatchWindow, WindowTracker};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

/// Inline dispatch results of one recipient
#[derive(Debug, Clone, Serialize)]
pub struct RecipientReport {
    pub event_id: String,
    pub recipient_identity: String,
    pub role: RecipientRole,
    pub channels: Vec<ChannelOutcome>,
}

/// Summary of one poll tick
#[derive(Debug, Clone, Serialize)]
pub struct TickReport {
    pub class: String,
    pub window: MatchWindow,
    pub events_found: usize,
    pub events_skipped: usize,
    /// Events left for a later tick because the identity directory failed
    pub events_deferred: usize,
    pub recipients: usize,
    pub dispatched_now: usize,
    pub armed: usize,
    pub already_pending: usize,
    pub stale: usize,
    pub outcomes: Vec<RecipientReport>,
}

impl TickReport {
    fn new(class: &str, window: MatchWindow) -> Self {
        Self {
            class: class.to_string(),
            window,
            events_found: 0,
            events_skipped: 0,
            events_deferred: 0,
            recipients: 0,
            dispatched_now: 0,
            armed: 0,
            already_pending: 0,
            stale: 0,
            outcomes: Vec::new(),
        }
    }
}

/// An upcoming event with the recipients a reminder would go to
#[derive(Debug, Clone, Serialize)]
pub struct EventPreview {
    pub event: ScheduledEvent,
    pub recipients: Vec<Recipient>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped_reason: Option<String>,
}

/// Coordinator operations
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Run the polling loop until `stop` is called
    async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;

    /// Stop polling and abandon armed sends
    async fn stop(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;

    /// Discover and dispatch reminders due on one tick
    async fn run_tick(&self) -> Result<TickReport, StorageError>;
}

pub struct ReminderCoordinator {
    class: Arc<ReminderClass>,
    clock: Arc<dyn Clock>,
    finder: Arc<CandidateFinder>,
    resolver: Arc<RecipientResolver>,
    dispatcher: Arc<DispatchScheduler>,
    alerts: Arc<dyn AlertNotifier>,
    tracker: Mutex<WindowTracker>,
    max_concurrency: usize,
    shutdown_tx: broadcast::Sender<()>,
}

impl ReminderCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        class: Arc<ReminderClass>,
        clock: Arc<dyn Clock>,
        finder: Arc<CandidateFinder>,
        resolver: Arc<RecipientResolver>,
        dispatcher: Arc<DispatchScheduler>,
        alerts: Arc<dyn AlertNotifier>,
        max_concurrency: usize,
    ) -> Self {
        let (shutdown_tx, _shutdown_rx) = broadcast::channel(1);
        Self {
            class,
            clock,
            finder,
            resolver,
            dispatcher,
            alerts,
            tracker: Mutex::new(WindowTracker::new()),
            max_concurrency: max_concurrency.max(1),
            shutdown_tx,
        }
    }

    pub fn class(&self) -> &ReminderClass {
        &self.class
    }

    pub fn dispatcher(&self) -> &Arc<DispatchScheduler> {
        &self.dispatcher
    }

    /// Get a shutdown signal receiver
    pub fn shutdown_receiver(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    async fn report_tick_failure(&self, window: &MatchWindow, detail: &str) {
        error!(
            reminder_class = %self.class.name(),
            window = %window,
            error = %detail,
            "Poll tick failed, window left for the next tick"
        );
        telemetry::record_tick_failure(self.class.name());

        let alert = Alert {
            kind: AlertKind::CoverageGap,
            reminder_class: self.class.name().to_string(),
            subject: window.to_string(),
            detail: detail.to_string(),
        };
        if let Err(e) = self.alerts.send_alert(&alert).await {
            error!(error = %e, "Failed to send coverage alert");
        }
    }

    /// Resolve events, dropping the ones whose owner cannot be resolved.
    /// Returns the recipients and the first identity directory error, if any.
    async fn resolve_all(
        &self,
        events: Vec<ScheduledEvent>,
        report: &mut TickReport,
    ) -> (Vec<Recipient>, Option<StorageError>) {
        let resolved: Vec<_> = stream::iter(events)
            .map(|event| async move {
                let result = self.resolver.resolve(&event).await;
                (event.id, result)
            })
            .buffer_unordered(self.max_concurrency)
            .collect()
            .await;

        let mut recipients = Vec::new();
        let mut outage = None;
        for (event_id, result) in resolved {
            match result {
                Ok(resolved) => recipients.extend(
                    resolved
                        .into_iter()
                        .filter(|r| self.class.templates().for_role(r.role()).is_some()),
                ),
                Err(ResolutionError::Directory(e)) => {
                    warn!(event_id = %event_id, error = %e, "Identity directory failed, event deferred");
                    report.events_deferred += 1;
                    outage.get_or_insert(e);
                }
                Err(e) => {
                    warn!(event_id = %event_id, error = %e, "Skipping event: data integrity");
                    report.events_skipped += 1;
                }
            }
        }
        (recipients, outage)
    }

    /// Next `limit` events within `horizon` and who would be reminded
    pub async fn preview(
        &self,
        horizon: Duration,
        owner_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<EventPreview>, StorageError> {
        let events = self
            .finder
            .upcoming(self.clock.now(), horizon, owner_id, limit)
            .await?;

        let mut previews = Vec::with_capacity(events.len());
        for event in events {
            let preview = match self.resolver.resolve(&event).await {
                Ok(recipients) => EventPreview {
                    event,
                    recipients,
                    skipped_reason: None,
                },
                Err(e) => EventPreview {
                    event,
                    recipients: Vec::new(),
                    skipped_reason: Some(e.to_string()),
                },
            };
            previews.push(preview);
        }
        Ok(previews)
    }

    /// When the reminder for an event starting at `starts_at` goes out
    pub fn send_at(&self, starts_at: DateTime<Utc>) -> DateTime<Utc> {
        self.class.send_at(starts_at)
    }
}

#[async_trait]
impl Coordinator for ReminderCoordinator {
    #[instrument(skip(self), fields(reminder_class = %self.class.name()))]
    async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut shutdown_rx = self.shutdown_receiver();
        let cadence = self.class.poll_cadence().to_std()?;
        let delay = start_delay(self.clock.now(), self.class.poll_cadence());

        info!(
            poll_cadence_seconds = cadence.as_secs(),
            lead_seconds = self.class.lead().num_seconds(),
            first_tick_in_ms = delay.as_millis() as u64,
            "Starting reminder coordinator"
        );

        tokio::select! {
            _ = sleep(delay) => {}
            _ = shutdown_rx.recv() => {
                info!("Shutdown signal received before first tick");
                return Ok(());
            }
        }

        let mut poll_interval = interval(cadence);
        poll_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = poll_interval.tick() => {
                    match self.run_tick().await {
                        Ok(report) => {
                            if report.events_found > 0 {
                                info!(
                                    events = report.events_found,
                                    recipients = report.recipients,
                                    dispatched_now = report.dispatched_now,
                                    armed = report.armed,
                                    stale = report.stale,
                                    "Tick processed"
                                );
                            } else {
                                debug!(window = %report.window, "No events due");
                            }
                        }
                        // Already logged and alerted
                        Err(_) => {}
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping coordinator");
                    break;
                }
            }
        }

        info!("Reminder coordinator stopped");
        Ok(())
    }

    #[instrument(skip(self), fields(reminder_class = %self.class.name()))]
    async fn stop(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        info!("Stopping reminder coordinator");
        let _ = self.shutdown_tx.send(());
        self.dispatcher.shutdown().await;
        Ok(())
    }

    #[instrument(skip(self), fields(reminder_class = %self.class.name()))]
    async fn run_tick(&self) -> Result<TickReport, StorageError> {
        let started = std::time::Instant::now();
        let now = self.clock.now();

        // Held until the window is committed so ticks never interleave
        let mut tracker = self.tracker.lock().await;
        let window = tracker.next_window(now, &self.class);
        let events = match self.finder.find(&window).await {
            Ok(events) => events,
            Err(e) => {
                drop(tracker);
                self.report_tick_failure(&window, &e.to_string()).await;
                return Err(e);
            }
        };

        let mut report = TickReport::new(self.class.name(), window);
        report.events_found = events.len();

        let (recipients, outage) = self.resolve_all(events, &mut report).await;
        report.recipients = recipients.len();
        match outage {
            None => {
                tracker.commit(&window);
                drop(tracker);
            }
            Some(e) => {
                drop(tracker);
                let detail = format!(
                    "{} event(s) deferred, identity directory: {}",
                    report.events_deferred, e
                );
                self.report_tick_failure(&window, &detail).await;
            }
        }

        let scheduled: Vec<_> = stream::iter(recipients)
            .map(|recipient| async move {
                let event_id = recipient.event().event_id.clone();
                let identity = recipient.identity().to_string();
                let role = recipient.role();
                let send_at = self.class.send_at(recipient.event().starts_at);
                let outcome = self
                    .dispatcher
                    .schedule(recipient, self.class.clone(), send_at)
                    .await;
                (event_id, identity, role, outcome)
            })
            .buffer_unordered(self.max_concurrency)
            .collect()
            .await;

        for (event_id, recipient_identity, role, outcome) in scheduled {
            match outcome {
                ScheduleOutcome::DispatchedNow { outcomes } => {
                    report.dispatched_now += 1;
                    report.outcomes.push(RecipientReport {
                        event_id,
                        recipient_identity,
                        role,
                        channels: outcomes,
                    });
                }
                ScheduleOutcome::Armed { .. } => report.armed += 1,
                ScheduleOutcome::AlreadyPending => report.already_pending += 1,
                ScheduleOutcome::Stale => report.stale += 1,
            }
        }

        telemetry::record_tick_duration(self.class.name(), started.elapsed().as_secs_f64());
        Ok(report)
    }
}

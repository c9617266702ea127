// Dispatch scheduler: send now, or arm a deferred send for the exact instant

use crate::clock::Clock;
use crate::models::{Channel, Recipient, ReminderClass};
use crate::notifier::{ChannelNotifier, ChannelOutcome, DeliveryOutcome};
use crate::storage::EventStore;
use crate::telemetry::{self, Alert, AlertKind, AlertNotifier};
use crate::window::is_stale;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn, Instrument};

/// Identifies one armed reminder: (event, recipient, reminder class)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct DispatchKey {
    pub event_id: String,
    pub recipient_identity: String,
    pub reminder_class: String,
}

impl DispatchKey {
    pub fn new(recipient: &Recipient, class: &ReminderClass) -> Self {
        Self {
            event_id: recipient.event().event_id.clone(),
            recipient_identity: recipient.identity().to_string(),
            reminder_class: class.name().to_string(),
        }
    }
}

impl fmt::Display for DispatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.event_id, self.recipient_identity, self.reminder_class
        )
    }
}

/// Result of a `schedule` call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ScheduleOutcome {
    /// Due already: dispatched inline
    DispatchedNow { outcomes: Vec<ChannelOutcome> },
    /// Deferred send armed for `send_at`
    Armed { send_at: DateTime<Utc> },
    /// A deferred send for the same key is already armed
    AlreadyPending,
    /// Discovered more than the class tolerance after its send instant
    Stale,
}

struct PendingDispatch {
    generation: u64,
    send_at: DateTime<Utc>,
    // Dropping the sender abandons the deferred send
    _cancel: oneshot::Sender<()>,
}

type PendingMap = Arc<Mutex<HashMap<DispatchKey, PendingDispatch>>>;

/// Owns the keyed arena of armed deferred sends for one reminder class.
///
/// A channel whose pre-send ledger check fails keeps its key armed and is
/// retried one poll cadence later, for as long as the retry still falls
/// inside the class tolerance. Past that an `undelivered_reminder` alert is
/// raised.
pub struct DispatchScheduler {
    clock: Arc<dyn Clock>,
    notifier: Arc<ChannelNotifier>,
    events: Arc<dyn EventStore>,
    alerts: Arc<dyn AlertNotifier>,
    pending: PendingMap,
    handles: Mutex<Vec<JoinHandle<()>>>,
    next_generation: AtomicU64,
}

impl DispatchScheduler {
    pub fn new(
        clock: Arc<dyn Clock>,
        notifier: Arc<ChannelNotifier>,
        events: Arc<dyn EventStore>,
        alerts: Arc<dyn AlertNotifier>,
    ) -> Self {
        Self {
            clock,
            notifier,
            events,
            alerts,
            pending: Arc::new(Mutex::new(HashMap::new())),
            handles: Mutex::new(Vec::new()),
            next_generation: AtomicU64::new(0),
        }
    }

    #[instrument(
        skip(self, recipient, class),
        fields(
            event_id = %recipient.event().event_id,
            recipient = %recipient.identity(),
            reminder_class = %class.name()
        )
    )]
    pub async fn schedule(
        &self,
        recipient: Recipient,
        class: Arc<ReminderClass>,
        send_at: DateTime<Utc>,
    ) -> ScheduleOutcome {
        let now = self.clock.now();
        if is_stale(send_at, now, class.tolerance()) {
            info!(send_at = %send_at, now = %now, "Stale reminder skipped");
            telemetry::record_stale_skip(class.name());
            return ScheduleOutcome::Stale;
        }

        let key = DispatchKey::new(&recipient, &class);
        let mut pending = self.pending.lock().await;
        if pending.contains_key(&key) {
            debug!(key = %key, "Already armed");
            return ScheduleOutcome::AlreadyPending;
        }

        if send_at <= now {
            drop(pending);
            debug!(key = %key, "Send instant reached, dispatching inline");
            let outcomes = self.notifier.notify(&recipient, &class).await;

            let unchecked = ledger_unavailable(&outcomes);
            if !unchecked.is_empty() {
                let retry_in = retry_delay(&class);
                let next_attempt = self.clock.now() + class.poll_cadence();
                if is_stale(send_at, next_attempt, class.tolerance()) {
                    raise_undelivered(self.alerts.as_ref(), &key, &class, &unchecked, &outcomes)
                        .await;
                } else {
                    let mut pending = self.pending.lock().await;
                    // A concurrent schedule may have armed the key meanwhile
                    if !pending.contains_key(&key) {
                        self.arm(&mut pending, key, recipient, class, send_at, retry_in, unchecked)
                            .await;
                    }
                }
            }
            return ScheduleOutcome::DispatchedNow { outcomes };
        }

        let delay = (send_at - now).to_std().unwrap_or_default();
        let channels = class.channels().to_vec();
        self.arm(&mut pending, key, recipient, class, send_at, delay, channels)
            .await;
        ScheduleOutcome::Armed { send_at }
    }

    /// Insert the key into the arena and spawn its deferred send
    #[allow(clippy::too_many_arguments)]
    async fn arm(
        &self,
        pending: &mut HashMap<DispatchKey, PendingDispatch>,
        key: DispatchKey,
        recipient: Recipient,
        class: Arc<ReminderClass>,
        send_at: DateTime<Utc>,
        delay: std::time::Duration,
        channels: Vec<Channel>,
    ) {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (cancel_tx, cancel_rx) = oneshot::channel();
        pending.insert(
            key.clone(),
            PendingDispatch {
                generation,
                send_at,
                _cancel: cancel_tx,
            },
        );
        telemetry::update_pending_dispatches(class.name(), count_for_class(pending, class.name()));

        let task = DeferredDispatch {
            key: key.clone(),
            generation,
            send_at,
            recipient,
            class,
            channels,
            clock: self.clock.clone(),
            notifier: self.notifier.clone(),
            events: self.events.clone(),
            alerts: self.alerts.clone(),
            pending: self.pending.clone(),
        };
        let span = tracing::info_span!("deferred_dispatch", key = %key, send_at = %send_at);
        let handle = tokio::spawn(task.run(delay, cancel_rx).instrument(span));

        let mut handles = self.handles.lock().await;
        handles.retain(|h| !h.is_finished());
        handles.push(handle);

        debug!(key = %key, send_at = %send_at, "Deferred dispatch armed");
    }

    /// Abandon an armed send. Returns false if nothing was armed for the key.
    pub async fn cancel(&self, key: &DispatchKey) -> bool {
        let mut pending = self.pending.lock().await;
        let removed = pending.remove(key).is_some();
        if removed {
            telemetry::update_pending_dispatches(
                &key.reminder_class,
                count_for_class(&pending, &key.reminder_class),
            );
        }
        removed
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Armed sends, earliest first
    pub async fn pending(&self) -> Vec<(DispatchKey, DateTime<Utc>)> {
        let pending = self.pending.lock().await;
        let mut armed: Vec<(DispatchKey, DateTime<Utc>)> = pending
            .iter()
            .map(|(key, p)| (key.clone(), p.send_at))
            .collect();
        armed.sort_by(|a, b| a.1.cmp(&b.1));
        armed
    }

    /// Abandon every armed send without side effects. Sends already in
    /// flight run to completion.
    pub async fn shutdown(&self) -> usize {
        let mut pending = self.pending.lock().await;
        let abandoned = pending.len();
        let classes: Vec<String> = pending.keys().map(|k| k.reminder_class.clone()).collect();
        pending.clear();
        for class in classes {
            telemetry::update_pending_dispatches(&class, 0);
        }
        if abandoned > 0 {
            info!(abandoned = abandoned, "Armed reminders abandoned");
        }
        abandoned
    }

    /// Wait until every spawned deferred send has fired or been abandoned
    pub async fn wait_idle(&self) {
        let handles = std::mem::take(&mut *self.handles.lock().await);
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Deferred dispatch task ended abnormally");
            }
        }
    }
}

fn count_for_class(pending: &HashMap<DispatchKey, PendingDispatch>, class: &str) -> usize {
    pending.keys().filter(|k| k.reminder_class == class).count()
}

/// Channels whose pre-send ledger check failed, so nothing was attempted
fn ledger_unavailable(outcomes: &[ChannelOutcome]) -> Vec<Channel> {
    outcomes
        .iter()
        .filter(|o| matches!(o.outcome, DeliveryOutcome::LedgerUnavailable { .. }))
        .map(|o| o.channel)
        .collect()
}

fn retry_delay(class: &ReminderClass) -> std::time::Duration {
    class.poll_cadence().to_std().unwrap_or_default()
}

async fn raise_undelivered(
    alerts: &dyn AlertNotifier,
    key: &DispatchKey,
    class: &ReminderClass,
    channels: &[Channel],
    outcomes: &[ChannelOutcome],
) {
    let detail = outcomes
        .iter()
        .filter_map(|o| match &o.outcome {
            DeliveryOutcome::LedgerUnavailable { error } => Some(format!("{}: {}", o.channel, error)),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("; ");
    error!(
        key = %key,
        channels = ?channels,
        detail = %detail,
        "Ledger unavailable until the tolerance ran out, reminder not sent"
    );

    let alert = Alert {
        kind: AlertKind::UndeliveredReminder,
        reminder_class: class.name().to_string(),
        subject: key.to_string(),
        detail,
    };
    if let Err(e) = alerts.send_alert(&alert).await {
        error!(error = %e, "Failed to send undelivered reminder alert");
    }
}

/// State moved into a spawned deferred send
struct DeferredDispatch {
    key: DispatchKey,
    generation: u64,
    send_at: DateTime<Utc>,
    recipient: Recipient,
    class: Arc<ReminderClass>,
    /// Channels still to attempt
    channels: Vec<Channel>,
    clock: Arc<dyn Clock>,
    notifier: Arc<ChannelNotifier>,
    events: Arc<dyn EventStore>,
    alerts: Arc<dyn AlertNotifier>,
    pending: PendingMap,
}

impl DeferredDispatch {
    async fn run(mut self, mut delay: std::time::Duration, mut cancel_rx: oneshot::Receiver<()>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = &mut cancel_rx => {
                    debug!("Deferred dispatch abandoned");
                    return;
                }
            }
            if !self.fire().await {
                break;
            }
            delay = retry_delay(&self.class);
        }
        self.release().await;
    }

    /// One attempt. True when some channels should be tried again.
    async fn fire(&mut self) -> bool {
        if !self.still_scheduled().await {
            return false;
        }
        let outcomes = self
            .notifier
            .notify_channels(&self.recipient, &self.class, &self.channels)
            .await;
        debug!(channels = outcomes.len(), "Deferred dispatch completed");

        let unchecked = ledger_unavailable(&outcomes);
        if unchecked.is_empty() {
            return false;
        }
        let next_attempt = self.clock.now() + self.class.poll_cadence();
        if is_stale(self.send_at, next_attempt, self.class.tolerance()) {
            raise_undelivered(
                self.alerts.as_ref(),
                &self.key,
                &self.class,
                &unchecked,
                &outcomes,
            )
            .await;
            return false;
        }
        warn!(
            channels = ?unchecked,
            retry_at = %next_attempt,
            "Ledger unavailable, reminder stays armed for another attempt"
        );
        self.channels = unchecked;
        true
    }

    async fn release(&self) {
        let mut pending = self.pending.lock().await;
        let ours = pending
            .get(&self.key)
            .is_some_and(|p| p.generation == self.generation);
        if ours {
            pending.remove(&self.key);
        }
        telemetry::update_pending_dispatches(
            self.class.name(),
            count_for_class(&pending, self.class.name()),
        );
    }

    /// The event may have been cancelled or moved while the send was armed
    async fn still_scheduled(&self) -> bool {
        let event = self.recipient.event();
        match self.events.find_by_id(&event.event_id).await {
            Ok(Some(current)) if current.starts_at == event.starts_at => true,
            Ok(Some(current)) => {
                info!(
                    armed_for = %event.starts_at,
                    now_starts_at = %current.starts_at,
                    "Event was rescheduled, dropping armed reminder"
                );
                false
            }
            Ok(None) => {
                info!("Event no longer exists, dropping armed reminder");
                false
            }
            Err(e) => {
                warn!(error = %e, "Could not re-check event, sending as discovered");
                true
            }
        }
    }
}

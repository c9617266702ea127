// Channel notifier: per-channel fan-out with ledger checks and records

use crate::channels::ChannelRegistry;
use crate::clock::Clock;
use crate::errors::{LedgerError, TransportError};
use crate::ledger::DeliveryLedger;
use crate::models::{
    Channel, DeliveryRecord, DeliveryStatus, IdempotencyKey, Recipient, ReminderClass,
};
use crate::telemetry;
use crate::templates::{TemplateMessage, TemplateRenderer};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

/// What happened on one channel for one recipient
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Sent { provider_status: String },
    Failed { error: String },
    /// A SENT record already exists for the key
    AlreadySent,
    /// No contact value, or no transport configured for the channel
    Ineligible { reason: String },
    /// The pre-send check could not reach the ledger store; nothing was sent
    LedgerUnavailable { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelOutcome {
    pub channel: Channel,
    #[serde(flatten)]
    pub outcome: DeliveryOutcome,
    /// Set when the attempt happened but its record could not be written
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ledger_error: Option<String>,
}

impl ChannelOutcome {
    fn new(channel: Channel, outcome: DeliveryOutcome) -> Self {
        Self {
            channel,
            outcome,
            ledger_error: None,
        }
    }
}

pub struct ChannelNotifier {
    clock: Arc<dyn Clock>,
    ledger: Arc<DeliveryLedger>,
    transports: ChannelRegistry,
    renderer: TemplateRenderer,
    send_timeout: Duration,
}

impl ChannelNotifier {
    pub fn new(
        clock: Arc<dyn Clock>,
        ledger: Arc<DeliveryLedger>,
        transports: ChannelRegistry,
        renderer: TemplateRenderer,
        send_timeout: Duration,
    ) -> Self {
        Self {
            clock,
            ledger,
            transports,
            renderer,
            send_timeout,
        }
    }

    /// Attempt every enabled channel of the class for one recipient.
    ///
    /// Channels run one after another; each attempt is recorded before the
    /// next channel starts, and no channel's failure affects another's.
    #[instrument(
        skip(self, recipient, class),
        fields(
            event_id = %recipient.event().event_id,
            recipient = %recipient.identity(),
            role = %recipient.role(),
            reminder_class = %class.name()
        )
    )]
    pub async fn notify(&self, recipient: &Recipient, class: &ReminderClass) -> Vec<ChannelOutcome> {
        self.notify_channels(recipient, class, class.channels()).await
    }

    /// Like `notify`, limited to `channels`, in the given order
    pub async fn notify_channels(
        &self,
        recipient: &Recipient,
        class: &ReminderClass,
        channels: &[Channel],
    ) -> Vec<ChannelOutcome> {
        let Some(template) = class.templates().for_role(recipient.role()) else {
            debug!("No template for role, recipient is not reminded by this class");
            return Vec::new();
        };
        let message = self.renderer.render(recipient, class, template);

        let mut outcomes = Vec::with_capacity(channels.len());
        for channel in channels {
            let outcome = self.notify_channel(recipient, class, *channel, &message).await;
            outcomes.push(outcome);
        }
        outcomes
    }

    #[instrument(skip(self, recipient, class, message), fields(channel = %channel))]
    async fn notify_channel(
        &self,
        recipient: &Recipient,
        class: &ReminderClass,
        channel: Channel,
        message: &TemplateMessage,
    ) -> ChannelOutcome {
        let Some(contact) = recipient.contacts().for_channel(channel) else {
            debug!("Recipient has no contact for channel");
            return ChannelOutcome::new(
                channel,
                DeliveryOutcome::Ineligible {
                    reason: "no contact value".to_string(),
                },
            );
        };
        let Some(transport) = self.transports.get(channel) else {
            debug!("No transport configured for channel");
            return ChannelOutcome::new(
                channel,
                DeliveryOutcome::Ineligible {
                    reason: "transport not configured".to_string(),
                },
            );
        };

        let key = IdempotencyKey::new(recipient, class, channel);

        // Checked as late as possible to keep the race window small
        match self.ledger.already_sent(&key).await {
            Ok(true) => {
                debug!(key = %key, "Already sent, skipping");
                return ChannelOutcome::new(channel, DeliveryOutcome::AlreadySent);
            }
            Ok(false) => {}
            Err(e) => {
                warn!(key = %key, error = %e, "Ledger check failed, not sending");
                return ChannelOutcome::new(
                    channel,
                    DeliveryOutcome::LedgerUnavailable {
                        error: e.to_string(),
                    },
                );
            }
        }

        let result = match tokio::time::timeout(
            self.send_timeout,
            transport.send_template(contact, message),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(self.send_timeout.as_secs())),
        };

        let attempted_at = self.clock.now();
        let (record, outcome) = match result {
            Ok(receipt) => {
                info!(key = %key, provider_status = %receipt.provider_status, "Reminder sent");
                (
                    DeliveryRecord::new(
                        &key,
                        recipient.role(),
                        DeliveryStatus::Sent,
                        contact,
                        &message.template_name,
                        attempted_at,
                        receipt.payload,
                    )
                    .with_country(recipient.contacts().country()),
                    DeliveryOutcome::Sent {
                        provider_status: receipt.provider_status,
                    },
                )
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Reminder send failed");
                (
                    DeliveryRecord::new(
                        &key,
                        recipient.role(),
                        DeliveryStatus::Failed,
                        contact,
                        &message.template_name,
                        attempted_at,
                        e.provider_payload(),
                    )
                    .with_country(recipient.contacts().country()),
                    DeliveryOutcome::Failed {
                        error: e.to_string(),
                    },
                )
            }
        };

        telemetry::record_delivery(class.name(), &channel.to_string(), &record.status.to_string());

        let mut outcome = ChannelOutcome::new(channel, outcome);
        match self.ledger.record(&record).await {
            Ok(()) => {}
            // Logged and counted by the ledger
            Err(e @ LedgerError::DuplicateSent(_)) => outcome.ledger_error = Some(e.to_string()),
            Err(e) => {
                error!(key = %key, status = %record.status, error = %e, "Attempt not recorded");
                outcome.ledger_error = Some(e.to_string());
            }
        }
        outcome
    }
}

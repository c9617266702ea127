// Delivery ledger: idempotency checks and audit records

use crate::errors::{LedgerError, StorageError};
use crate::models::{DeliveryRecord, DeliveryStatus, IdempotencyKey};
use crate::storage::LedgerStore;
use crate::telemetry::{self, Alert, AlertKind, AlertNotifier};
use std::sync::Arc;
use tracing::{error, instrument, warn};

/// Check-before-send and record-after-send over a `LedgerStore`.
///
/// The check and the send are not atomic. Two dispatches of the same key
/// racing between check and record can both send; the store's uniqueness on
/// SENT records turns the second record into `LedgerError::DuplicateSent`.
pub struct DeliveryLedger {
    store: Arc<dyn LedgerStore>,
    alerts: Arc<dyn AlertNotifier>,
}

impl DeliveryLedger {
    pub fn new(store: Arc<dyn LedgerStore>, alerts: Arc<dyn AlertNotifier>) -> Self {
        Self { store, alerts }
    }

    /// True iff a SENT record exists for exactly this key
    #[instrument(skip(self), fields(key = %key))]
    pub async fn already_sent(&self, key: &IdempotencyKey) -> Result<bool, StorageError> {
        Ok(self.store.find_sent(key).await?.is_some())
    }

    /// Append a record. Write failures are logged, counted and alerted before
    /// being returned.
    #[instrument(skip(self, record), fields(key = %record.key(), status = %record.status))]
    pub async fn record(&self, record: &DeliveryRecord) -> Result<(), LedgerError> {
        let key = record.key();
        let channel = record.channel.to_string();

        match self.store.append(record).await {
            Ok(()) => Ok(()),
            Err(StorageError::DuplicateKey(_)) => {
                warn!(
                    key = %key,
                    reminder_class = %record.reminder_class,
                    channel = %channel,
                    "Duplicate send: another dispatch already recorded SENT for this key"
                );
                telemetry::record_duplicate_sent(&record.reminder_class, &channel);
                Err(LedgerError::DuplicateSent(key.to_string()))
            }
            Err(e) => {
                let kind = match record.status {
                    DeliveryStatus::Sent => AlertKind::UnrecordedSent,
                    DeliveryStatus::Failed => AlertKind::UnrecordedFailure,
                };
                error!(
                    key = %key,
                    status = %record.status,
                    provider_response = %record.provider_response,
                    error = %e,
                    "Delivery ledger write failed"
                );
                telemetry::record_ledger_write_failure(
                    &record.reminder_class,
                    &channel,
                    &record.status.to_string(),
                );

                let alert = Alert {
                    kind,
                    reminder_class: record.reminder_class.clone(),
                    subject: key.to_string(),
                    detail: e.to_string(),
                };
                if let Err(alert_err) = self.alerts.send_alert(&alert).await {
                    error!(error = %alert_err, "Failed to send ledger alert");
                }

                Err(LedgerError::WriteFailed(e))
            }
        }
    }

    pub async fn history(&self, key: &IdempotencyKey) -> Result<Vec<DeliveryRecord>, StorageError> {
        self.store.history(key).await
    }

    pub async fn recent(&self, limit: usize) -> Result<Vec<DeliveryRecord>, StorageError> {
        self.store.recent(limit).await
    }
}

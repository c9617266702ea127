// In-memory adapters for the storage seams

use super::{EventStore, IdentityDirectory, LedgerStore};
use crate::errors::StorageError;
use crate::models::{DeliveryRecord, DeliveryStatus, IdempotencyKey, Identity, ScheduledEvent};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Event store held in process memory
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    events: RwLock<HashMap<String, ScheduledEvent>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, event: ScheduledEvent) {
        self.events.write().await.insert(event.id.clone(), event);
    }

    pub async fn remove(&self, event_id: &str) -> Option<ScheduledEvent> {
        self.events.write().await.remove(event_id)
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn query_by_start_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ScheduledEvent>, StorageError> {
        let events = self.events.read().await;
        let mut matched: Vec<ScheduledEvent> = events
            .values()
            .filter(|e| e.starts_at >= start && e.starts_at < end)
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.starts_at.cmp(&b.starts_at).then_with(|| a.id.cmp(&b.id)));
        Ok(matched)
    }

    async fn find_by_id(&self, event_id: &str) -> Result<Option<ScheduledEvent>, StorageError> {
        Ok(self.events.read().await.get(event_id).cloned())
    }

    async fn find_by_owner(
        &self,
        owner_id: &str,
        from: DateTime<Utc>,
    ) -> Result<Vec<ScheduledEvent>, StorageError> {
        let events = self.events.read().await;
        let mut matched: Vec<ScheduledEvent> = events
            .values()
            .filter(|e| e.owner_id.as_deref() == Some(owner_id) && e.starts_at >= from)
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.starts_at.cmp(&b.starts_at));
        Ok(matched)
    }
}

/// Identity directory held in process memory
#[derive(Debug, Default)]
pub struct InMemoryIdentityDirectory {
    identities: RwLock<HashMap<String, Identity>>,
}

impl InMemoryIdentityDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, identity: Identity) {
        self.identities
            .write()
            .await
            .insert(identity.id.clone(), identity);
    }
}

#[async_trait]
impl IdentityDirectory for InMemoryIdentityDirectory {
    async fn resolve_identity(&self, identity_id: &str) -> Result<Option<Identity>, StorageError> {
        Ok(self.identities.read().await.get(identity_id).cloned())
    }
}

/// Ledger store held in process memory. Append order is preserved.
#[derive(Debug, Default)]
pub struct InMemoryLedgerStore {
    records: RwLock<Vec<DeliveryRecord>>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every record in append order
    pub async fn all(&self) -> Vec<DeliveryRecord> {
        self.records.read().await.clone()
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn append(&self, record: &DeliveryRecord) -> Result<(), StorageError> {
        let mut records = self.records.write().await;
        if record.status == DeliveryStatus::Sent {
            let key = record.key();
            let exists = records
                .iter()
                .any(|r| r.status == DeliveryStatus::Sent && r.key() == key);
            if exists {
                return Err(StorageError::DuplicateKey(key.to_string()));
            }
        }
        records.push(record.clone());
        Ok(())
    }

    async fn find_sent(&self, key: &IdempotencyKey) -> Result<Option<DeliveryRecord>, StorageError> {
        Ok(self
            .records
            .read()
            .await
            .iter()
            .find(|r| r.status == DeliveryStatus::Sent && &r.key() == key)
            .cloned())
    }

    async fn history(&self, key: &IdempotencyKey) -> Result<Vec<DeliveryRecord>, StorageError> {
        Ok(self
            .records
            .read()
            .await
            .iter()
            .filter(|r| &r.key() == key)
            .cloned()
            .collect())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<DeliveryRecord>, StorageError> {
        Ok(self
            .records
            .read()
            .await
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect())
    }
}

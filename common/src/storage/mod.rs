// Storage seams consumed by the dispatch engine

pub mod memory;

use crate::errors::StorageError;
use crate::models::{DeliveryRecord, IdempotencyKey, Identity, ScheduledEvent};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use memory::{InMemoryEventStore, InMemoryIdentityDirectory, InMemoryLedgerStore};

/// Read-only view of scheduled class sessions
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Events whose start instant is in `[start, end)`, ordered by start
    async fn query_by_start_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ScheduledEvent>, StorageError>;

    async fn find_by_id(&self, event_id: &str) -> Result<Option<ScheduledEvent>, StorageError>;

    /// Upcoming events owned by an identity, starting at or after `from`
    async fn find_by_owner(
        &self,
        owner_id: &str,
        from: DateTime<Utc>,
    ) -> Result<Vec<ScheduledEvent>, StorageError>;
}

/// Resolves identifiers linked from events to contact records
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IdentityDirectory: Send + Sync {
    /// `Ok(None)` when the identity does not exist
    async fn resolve_identity(&self, identity_id: &str) -> Result<Option<Identity>, StorageError>;
}

/// Durable append-only store behind the delivery ledger.
///
/// `append` must reject a second SENT record for the same key with
/// `StorageError::DuplicateKey`. FAILED records are never rejected.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn append(&self, record: &DeliveryRecord) -> Result<(), StorageError>;

    /// The SENT record for a key, if any
    async fn find_sent(&self, key: &IdempotencyKey) -> Result<Option<DeliveryRecord>, StorageError>;

    /// All attempts for a key, oldest first
    async fn history(&self, key: &IdempotencyKey) -> Result<Vec<DeliveryRecord>, StorageError>;

    /// Most recent attempts across all keys, newest first
    async fn recent(&self, limit: usize) -> Result<Vec<DeliveryRecord>, StorageError>;
}

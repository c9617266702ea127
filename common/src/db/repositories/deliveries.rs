// Append-only delivery ledger table

use crate::db::DbPool;
use crate::errors::StorageError;
use crate::models::{DeliveryRecord, IdempotencyKey};
use crate::storage::LedgerStore;
use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::Row;
use std::str::FromStr;
use tracing::instrument;

const SELECT_RECORDS: &str = r#"
    SELECT id, event_id, recipient_role, recipient_identity, reminder_class,
           channel, status, contact, template_name, attempted_at, provider_response,
           recipient_country
    FROM delivery_records
"#;

const KEY_FILTER: &str =
    "WHERE event_id = $1 AND recipient_identity = $2 AND reminder_class = $3 AND channel = $4";

pub struct PgLedgerStore {
    pool: DbPool,
}

impl PgLedgerStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn map_row(row: &PgRow) -> Result<DeliveryRecord, StorageError> {
        Ok(DeliveryRecord {
            id: row.try_get("id")?,
            event_id: row.try_get("event_id")?,
            recipient_role: parse_column(row, "recipient_role")?,
            recipient_identity: row.try_get("recipient_identity")?,
            reminder_class: row.try_get("reminder_class")?,
            channel: parse_column(row, "channel")?,
            status: parse_column(row, "status")?,
            contact: row.try_get("contact")?,
            template_name: row.try_get("template_name")?,
            attempted_at: row.try_get("attempted_at")?,
            provider_response: row.try_get("provider_response")?,
            recipient_country: row.try_get("recipient_country")?,
        })
    }
}

fn parse_column<T>(row: &PgRow, column: &str) -> Result<T, StorageError>
where
    T: FromStr<Err = String>,
{
    let raw: String = row.try_get(column)?;
    raw.parse::<T>()
        .map_err(|e| StorageError::InvalidData(format!("{}: {}", column, e)))
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    #[instrument(skip(self, record), fields(key = %record.key(), status = %record.status))]
    async fn append(&self, record: &DeliveryRecord) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO delivery_records (
                id, event_id, recipient_role, recipient_identity, reminder_class,
                channel, status, contact, template_name, attempted_at, provider_response,
                recipient_country
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(record.id)
        .bind(&record.event_id)
        .bind(record.recipient_role.to_string())
        .bind(&record.recipient_identity)
        .bind(&record.reminder_class)
        .bind(record.channel.to_string())
        .bind(record.status.to_string())
        .bind(&record.contact)
        .bind(&record.template_name)
        .bind(record.attempted_at)
        .bind(&record.provider_response)
        .bind(&record.recipient_country)
        .execute(self.pool.pool())
        .await?;

        tracing::debug!(record_id = %record.id, "Delivery record appended");
        Ok(())
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn find_sent(&self, key: &IdempotencyKey) -> Result<Option<DeliveryRecord>, StorageError> {
        let sql = format!("{} {} AND status = 'sent' LIMIT 1", SELECT_RECORDS, KEY_FILTER);
        let row = sqlx::query(&sql)
            .bind(&key.event_id)
            .bind(&key.recipient_identity)
            .bind(&key.reminder_class)
            .bind(key.channel.to_string())
            .fetch_optional(self.pool.pool())
            .await?;

        row.as_ref().map(Self::map_row).transpose()
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn history(&self, key: &IdempotencyKey) -> Result<Vec<DeliveryRecord>, StorageError> {
        let sql = format!("{} {} ORDER BY attempted_at, id", SELECT_RECORDS, KEY_FILTER);
        let rows = sqlx::query(&sql)
            .bind(&key.event_id)
            .bind(&key.recipient_identity)
            .bind(&key.reminder_class)
            .bind(key.channel.to_string())
            .fetch_all(self.pool.pool())
            .await?;

        rows.iter().map(Self::map_row).collect()
    }

    #[instrument(skip(self))]
    async fn recent(&self, limit: usize) -> Result<Vec<DeliveryRecord>, StorageError> {
        let sql = format!("{} ORDER BY attempted_at DESC, id LIMIT $1", SELECT_RECORDS);
        let rows = sqlx::query(&sql)
            .bind(limit as i64)
            .fetch_all(self.pool.pool())
            .await?;

        rows.iter().map(Self::map_row).collect()
    }
}

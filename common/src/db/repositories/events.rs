// Scheduled class sessions with their accepted attendees

use crate::db::DbPool;
use crate::errors::StorageError;
use crate::models::ScheduledEvent;
use crate::storage::EventStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::Row;
use tracing::instrument;

const SELECT_EVENTS: &str = r#"
    SELECT e.id, e.starts_at, e.subject, e.owner_id,
           COALESCE(
               array_agg(p.participant_id ORDER BY p.participant_id)
                   FILTER (WHERE p.participant_id IS NOT NULL),
               '{}'
           ) AS participant_ids
    FROM scheduled_events e
    LEFT JOIN event_participants p
           ON p.event_id = e.id AND p.status = 'accepted'
"#;

pub struct PgEventStore {
    pool: DbPool,
}

impl PgEventStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn map_row(row: &PgRow) -> Result<ScheduledEvent, sqlx::Error> {
        Ok(ScheduledEvent {
            id: row.try_get("id")?,
            starts_at: row.try_get("starts_at")?,
            subject: row.try_get("subject")?,
            owner_id: row.try_get("owner_id")?,
            participant_ids: row.try_get("participant_ids")?,
        })
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    #[instrument(skip(self))]
    async fn query_by_start_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ScheduledEvent>, StorageError> {
        let sql = format!(
            "{} WHERE e.starts_at >= $1 AND e.starts_at < $2 GROUP BY e.id ORDER BY e.starts_at, e.id",
            SELECT_EVENTS
        );
        let rows = sqlx::query(&sql)
            .bind(start)
            .bind(end)
            .fetch_all(self.pool.pool())
            .await?;

        let events = rows
            .iter()
            .map(Self::map_row)
            .collect::<Result<Vec<_>, _>>()?;

        tracing::debug!(count = events.len(), "Events matched start range");
        Ok(events)
    }

    #[instrument(skip(self))]
    async fn find_by_id(&self, event_id: &str) -> Result<Option<ScheduledEvent>, StorageError> {
        let sql = format!("{} WHERE e.id = $1 GROUP BY e.id", SELECT_EVENTS);
        let row = sqlx::query(&sql)
            .bind(event_id)
            .fetch_optional(self.pool.pool())
            .await?;

        Ok(row.as_ref().map(Self::map_row).transpose()?)
    }

    #[instrument(skip(self))]
    async fn find_by_owner(
        &self,
        owner_id: &str,
        from: DateTime<Utc>,
    ) -> Result<Vec<ScheduledEvent>, StorageError> {
        let sql = format!(
            "{} WHERE e.owner_id = $1 AND e.starts_at >= $2 GROUP BY e.id ORDER BY e.starts_at, e.id",
            SELECT_EVENTS
        );
        let rows = sqlx::query(&sql)
            .bind(owner_id)
            .bind(from)
            .fetch_all(self.pool.pool())
            .await?;

        Ok(rows
            .iter()
            .map(Self::map_row)
            .collect::<Result<Vec<_>, _>>()?)
    }
}

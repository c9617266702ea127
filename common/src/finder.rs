// Candidate finder: events whose start instant falls in a match window

use crate::errors::StorageError;
use crate::models::ScheduledEvent;
use crate::storage::EventStore;
use crate::window::MatchWindow;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

pub struct CandidateFinder {
    store: Arc<dyn EventStore>,
}

impl CandidateFinder {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store }
    }

    /// Events starting in `[window.start, window.end)`. An empty window never
    /// reaches the store.
    #[instrument(skip(self), fields(window = %window))]
    pub async fn find(&self, window: &MatchWindow) -> Result<Vec<ScheduledEvent>, StorageError> {
        if window.is_empty() {
            debug!("Empty window, nothing to query");
            return Ok(Vec::new());
        }

        let events = self
            .store
            .query_by_start_range(window.start, window.end)
            .await?;

        let total = events.len();
        let matched: Vec<ScheduledEvent> = events
            .into_iter()
            .filter(|e| window.contains(e.starts_at))
            .collect();
        if matched.len() != total {
            warn!(
                returned = total,
                matched = matched.len(),
                "Event store returned events outside the requested window"
            );
        }

        debug!(events = matched.len(), "Candidate events found");
        Ok(matched)
    }

    /// Next `limit` events starting within `horizon` of `from`, optionally for one owner
    #[instrument(skip(self))]
    pub async fn upcoming(
        &self,
        from: DateTime<Utc>,
        horizon: Duration,
        owner_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ScheduledEvent>, StorageError> {
        let mut events = match owner_id {
            Some(owner) => self.store.find_by_owner(owner, from).await?,
            None => self.store.query_by_start_range(from, from + horizon).await?,
        };
        events.retain(|e| e.starts_at < from + horizon);
        events.truncate(limit);
        Ok(events)
    }

    pub async fn find_by_id(&self, event_id: &str) -> Result<Option<ScheduledEvent>, StorageError> {
        self.store.find_by_id(event_id).await
    }
}

// Recipient resolver: expands an event into owner and participant recipients

use crate::errors::ResolutionError;
use crate::models::{EventRef, Identity, Recipient, ScheduledEvent};
use crate::storage::IdentityDirectory;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

pub struct RecipientResolver {
    directory: Arc<dyn IdentityDirectory>,
}

impl RecipientResolver {
    pub fn new(directory: Arc<dyn IdentityDirectory>) -> Self {
        Self { directory }
    }

    /// Owner first, then every participant that resolves.
    ///
    /// Fails when the owner is missing or cannot be resolved, since participant
    /// messages are personalized with the owner's name. Unresolvable
    /// participants are skipped with a warning.
    #[instrument(skip(self, event), fields(event_id = %event.id))]
    pub async fn resolve(&self, event: &ScheduledEvent) -> Result<Vec<Recipient>, ResolutionError> {
        let owner_id = event
            .owner_id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| ResolutionError::OwnerMissing {
                event_id: event.id.clone(),
            })?;

        let unresolved = || ResolutionError::OwnerUnresolved {
            event_id: event.id.clone(),
            owner_id: owner_id.to_string(),
        };
        let owner = self
            .directory
            .resolve_identity(owner_id)
            .await?
            .ok_or_else(unresolved)?;

        let participants = self.resolve_participants(event, owner_id).await;
        let event_ref = EventRef::from(event);
        let participant_names = participants
            .iter()
            .map(|p| p.name.trim().to_string())
            .filter(|name| !name.is_empty())
            .collect();

        let owner = Recipient::owner(event_ref.clone(), &owner, participant_names).map_err(|e| {
            warn!(owner_id = owner_id, error = %e, "Owner record is incomplete");
            unresolved()
        })?;

        let mut recipients = Vec::with_capacity(participants.len() + 1);
        let owner_name = owner.name().to_string();
        recipients.push(owner);

        for identity in &participants {
            match Recipient::participant(event_ref.clone(), identity, &owner_name) {
                Ok(recipient) => recipients.push(recipient),
                Err(e) => warn!(participant_id = %identity.id, error = %e, "Skipping participant"),
            }
        }

        debug!(recipients = recipients.len(), "Recipients resolved");
        Ok(recipients)
    }

    async fn resolve_participants(&self, event: &ScheduledEvent, owner_id: &str) -> Vec<Identity> {
        let mut seen = HashSet::new();
        let mut resolved = Vec::new();

        for participant_id in &event.participant_ids {
            if participant_id == owner_id || !seen.insert(participant_id.as_str()) {
                continue;
            }
            match self.directory.resolve_identity(participant_id).await {
                Ok(Some(identity)) => resolved.push(identity),
                Ok(None) => warn!(
                    participant_id = %participant_id,
                    "Participant not found in identity directory, skipping"
                ),
                Err(e) => warn!(
                    participant_id = %participant_id,
                    error = %e,
                    "Identity directory error for participant, skipping"
                ),
            }
        }

        resolved
    }
}

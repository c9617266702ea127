use crate::errors::ValidationError;
use crate::templates::MessageTemplate;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ============================================================================
// Scheduled events and identities
// ============================================================================

/// A class session as stored in the event store. Read-only to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledEvent {
    pub id: String,
    pub starts_at: DateTime<Utc>,
    pub subject: String,
    /// Instructor who owns the session
    pub owner_id: Option<String>,
    /// Accepted attendees
    pub participant_ids: Vec<String>,
}

/// Contact record returned by the identity directory, before normalization
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
}

// ============================================================================
// Channels, roles, statuses
// ============================================================================

/// Delivery channel kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    WhatsApp,
    Sms,
    Email,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::WhatsApp => write!(f, "whatsapp"),
            Channel::Sms => write!(f, "sms"),
            Channel::Email => write!(f, "email"),
        }
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "whatsapp" => Ok(Channel::WhatsApp),
            "sms" => Ok(Channel::Sms),
            "email" => Ok(Channel::Email),
            _ => Err(format!("Invalid channel: {}", s)),
        }
    }
}

/// Role of a recipient relative to the event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipientRole {
    Owner,
    Participant,
}

impl fmt::Display for RecipientRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecipientRole::Owner => write!(f, "owner"),
            RecipientRole::Participant => write!(f, "participant"),
        }
    }
}

impl FromStr for RecipientRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "owner" => Ok(RecipientRole::Owner),
            "participant" => Ok(RecipientRole::Participant),
            _ => Err(format!("Invalid recipient role: {}", s)),
        }
    }
}

/// Outcome of a single send attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Sent,
    Failed,
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryStatus::Sent => write!(f, "sent"),
            DeliveryStatus::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sent" => Ok(DeliveryStatus::Sent),
            "failed" => Ok(DeliveryStatus::Failed),
            _ => Err(format!("Invalid delivery status: {}", s)),
        }
    }
}

// ============================================================================
// Contacts
// ============================================================================

/// Strip everything but digits. Returns `None` when nothing is left.
pub fn normalize_phone(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        None
    } else {
        Some(digits)
    }
}

/// Trim and lowercase an email address, rejecting values without a local part and domain
pub fn normalize_email(raw: &str) -> Option<String> {
    let email = raw.trim().to_lowercase();
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() && !domain.contains('@') => {
            Some(email)
        }
        _ => None,
    }
}

/// ISO 3166-1 alpha-2 region of a digits-only phone number, read from its
/// country calling code. `None` unless the number is valid for that region.
pub fn country_for_phone(digits: &str) -> Option<String> {
    let number = phonenumber::parse(None, format!("+{}", digits)).ok()?;
    if !phonenumber::is_valid(&number) {
        return None;
    }
    number.country().id().map(|id| id.as_ref().to_string())
}

/// Normalized contact values of a recipient
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactPoints {
    pub phone: Option<String>,
    pub email: Option<String>,
}

impl ContactPoints {
    pub fn from_identity(identity: &Identity) -> Self {
        Self {
            phone: identity.phone.as_deref().and_then(normalize_phone),
            email: identity.email.as_deref().and_then(normalize_email),
        }
    }

    /// Region of the phone number, if it has a recognizable calling code
    pub fn country(&self) -> Option<String> {
        self.phone.as_deref().and_then(country_for_phone)
    }

    /// Contact value used for a channel, if the recipient has one
    pub fn for_channel(&self, channel: Channel) -> Option<&str> {
        match channel {
            Channel::WhatsApp | Channel::Sms => self.phone.as_deref(),
            Channel::Email => self.email.as_deref(),
        }
    }
}

// ============================================================================
// Recipients
// ============================================================================

/// The slice of an event every recipient carries for message rendering
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRef {
    pub event_id: String,
    pub subject: String,
    pub starts_at: DateTime<Utc>,
}

impl From<&ScheduledEvent> for EventRef {
    fn from(event: &ScheduledEvent) -> Self {
        Self {
            event_id: event.id.clone(),
            subject: event.subject.clone(),
            starts_at: event.starts_at,
        }
    }
}

/// A person to remind about one event. Built fresh per dispatch cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Recipient {
    Owner {
        event: EventRef,
        identity: String,
        name: String,
        contacts: ContactPoints,
        participant_names: Vec<String>,
    },
    Participant {
        event: EventRef,
        identity: String,
        name: String,
        contacts: ContactPoints,
        owner_name: String,
    },
}

impl Recipient {
    /// Owner recipient. The owner must have a name since participant messages
    /// are personalized with it.
    pub fn owner(
        event: EventRef,
        identity: &Identity,
        participant_names: Vec<String>,
    ) -> Result<Self, ValidationError> {
        let name = identity.name.trim();
        if identity.id.trim().is_empty() {
            return Err(ValidationError::MissingField("owner.id".to_string()));
        }
        if name.is_empty() {
            return Err(ValidationError::MissingField("owner.name".to_string()));
        }
        Ok(Recipient::Owner {
            event,
            identity: identity.id.clone(),
            name: name.to_string(),
            contacts: ContactPoints::from_identity(identity),
            participant_names,
        })
    }

    pub fn participant(
        event: EventRef,
        identity: &Identity,
        owner_name: &str,
    ) -> Result<Self, ValidationError> {
        if identity.id.trim().is_empty() {
            return Err(ValidationError::MissingField("participant.id".to_string()));
        }
        Ok(Recipient::Participant {
            event,
            identity: identity.id.clone(),
            name: identity.name.trim().to_string(),
            contacts: ContactPoints::from_identity(identity),
            owner_name: owner_name.to_string(),
        })
    }

    pub fn role(&self) -> RecipientRole {
        match self {
            Recipient::Owner { .. } => RecipientRole::Owner,
            Recipient::Participant { .. } => RecipientRole::Participant,
        }
    }

    pub fn event(&self) -> &EventRef {
        match self {
            Recipient::Owner { event, .. } | Recipient::Participant { event, .. } => event,
        }
    }

    pub fn identity(&self) -> &str {
        match self {
            Recipient::Owner { identity, .. } | Recipient::Participant { identity, .. } => identity,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Recipient::Owner { name, .. } | Recipient::Participant { name, .. } => name,
        }
    }

    pub fn contacts(&self) -> &ContactPoints {
        match self {
            Recipient::Owner { contacts, .. } | Recipient::Participant { contacts, .. } => contacts,
        }
    }

    /// Name of the other side of the session, used in message bodies
    pub fn counterpart_name(&self) -> String {
        match self {
            Recipient::Owner {
                participant_names, ..
            } => participant_names.join(", "),
            Recipient::Participant { owner_name, .. } => owner_name.clone(),
        }
    }
}

// ============================================================================
// Reminder classes
// ============================================================================

/// Templates per recipient role. A role without a template is not reminded by the class.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleTemplates {
    #[serde(default)]
    pub owner: Option<MessageTemplate>,
    #[serde(default)]
    pub participant: Option<MessageTemplate>,
}

impl RoleTemplates {
    pub fn for_role(&self, role: RecipientRole) -> Option<&MessageTemplate> {
        match role {
            RecipientRole::Owner => self.owner.as_ref(),
            RecipientRole::Participant => self.participant.as_ref(),
        }
    }
}

/// Immutable description of one reminder lead time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReminderClass {
    name: String,
    lead: Duration,
    poll_cadence: Duration,
    tolerance: Duration,
    channels: Vec<Channel>,
    templates: RoleTemplates,
}

impl ReminderClass {
    pub fn new(
        name: impl Into<String>,
        lead: Duration,
        poll_cadence: Duration,
        tolerance: Duration,
        channels: Vec<Channel>,
        templates: RoleTemplates,
    ) -> Result<Self, ValidationError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(ValidationError::MissingField("reminder.name".to_string()));
        }
        let invalid = |field: &str, reason: &str| ValidationError::InvalidFieldValue {
            field: format!("{}.{}", name, field),
            reason: reason.to_string(),
        };
        if lead <= Duration::zero() {
            return Err(invalid("lead_seconds", "must be greater than 0"));
        }
        if poll_cadence < Duration::seconds(1) {
            return Err(invalid("poll_cadence_seconds", "must be at least 1 second"));
        }
        if tolerance < Duration::zero() {
            return Err(invalid("tolerance_seconds", "must not be negative"));
        }
        if channels.is_empty() {
            return Err(invalid("channels", "at least one channel is required"));
        }
        if templates.owner.is_none() && templates.participant.is_none() {
            return Err(invalid("templates", "at least one role template is required"));
        }

        let mut channels = channels;
        channels.sort();
        channels.dedup();

        Ok(Self {
            name,
            lead,
            poll_cadence,
            tolerance,
            channels,
            templates,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lead(&self) -> Duration {
        self.lead
    }

    pub fn poll_cadence(&self) -> Duration {
        self.poll_cadence
    }

    pub fn tolerance(&self) -> Duration {
        self.tolerance
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    pub fn templates(&self) -> &RoleTemplates {
        &self.templates
    }

    /// Instant at which a reminder for an event starting at `starts_at` is due
    pub fn send_at(&self, starts_at: DateTime<Utc>) -> DateTime<Utc> {
        starts_at - self.lead
    }
}

// ============================================================================
// Delivery ledger
// ============================================================================

/// (event, recipient, reminder class, channel): identifies one deliverable
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey {
    pub event_id: String,
    pub recipient_identity: String,
    pub reminder_class: String,
    pub channel: Channel,
}

impl IdempotencyKey {
    pub fn new(recipient: &Recipient, class: &ReminderClass, channel: Channel) -> Self {
        Self {
            event_id: recipient.event().event_id.clone(),
            recipient_identity: recipient.identity().to_string(),
            reminder_class: class.name().to_string(),
            channel,
        }
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.event_id, self.recipient_identity, self.reminder_class, self.channel
        )
    }
}

/// Append-only audit entry for one send attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub id: Uuid,
    pub event_id: String,
    pub recipient_role: RecipientRole,
    pub recipient_identity: String,
    pub reminder_class: String,
    pub channel: Channel,
    pub status: DeliveryStatus,
    /// Normalized phone number or email the attempt went to
    pub contact: String,
    pub template_name: String,
    pub attempted_at: DateTime<Utc>,
    pub provider_response: String,
    /// Region derived from the recipient's phone number
    pub recipient_country: Option<String>,
}

impl DeliveryRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        key: &IdempotencyKey,
        role: RecipientRole,
        status: DeliveryStatus,
        contact: &str,
        template_name: &str,
        attempted_at: DateTime<Utc>,
        provider_response: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_id: key.event_id.clone(),
            recipient_role: role,
            recipient_identity: key.recipient_identity.clone(),
            reminder_class: key.reminder_class.clone(),
            channel: key.channel,
            status,
            contact: contact.to_string(),
            template_name: template_name.to_string(),
            attempted_at,
            provider_response,
            recipient_country: None,
        }
    }

    pub fn with_country(mut self, country: Option<String>) -> Self {
        self.recipient_country = country;
        self
    }

    pub fn key(&self) -> IdempotencyKey {
        IdempotencyKey {
            event_id: self.event_id.clone(),
            recipient_identity: self.recipient_identity.clone(),
            reminder_class: self.reminder_class.clone(),
            channel: self.channel,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::templates::TemplateField;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn template(name: &str) -> MessageTemplate {
        MessageTemplate {
            name: name.to_string(),
            language_code: "en".to_string(),
            body: vec![TemplateField::RecipientName, TemplateField::Subject],
            campaign_id: None,
            email_subject: None,
        }
    }

    fn event_ref() -> EventRef {
        EventRef {
            event_id: "evt-1".to_string(),
            subject: "Physics".to_string(),
            starts_at: Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_normalize_phone_strips_formatting() {
        assert_eq!(normalize_phone("+91 98765-43210"), Some("919876543210".to_string()));
        assert_eq!(normalize_phone("(555) 010 2000"), Some("5550102000".to_string()));
        assert_eq!(normalize_phone("  "), None);
        assert_eq!(normalize_phone("n/a"), None);
    }

    #[test]
    fn test_country_from_calling_code() {
        assert_eq!(country_for_phone("918123456789"), Some("IN".to_string()));
        assert_eq!(country_for_phone("16502530000"), Some("US".to_string()));
        assert_eq!(country_for_phone("447400123456"), Some("GB".to_string()));
        // No calling code in front of the national number
        assert_eq!(country_for_phone("15550100"), None);

        let contacts = ContactPoints::from_identity(&Identity {
            id: "s-1".to_string(),
            name: "Asha".to_string(),
            phone: Some("+91 81234 56789".to_string()),
            email: None,
        });
        assert_eq!(contacts.country().as_deref(), Some("IN"));
        assert_eq!(ContactPoints::default().country(), None);
    }

    #[test]
    fn test_normalize_email() {
        assert_eq!(
            normalize_email("  Instructor@School.ORG "),
            Some("instructor@school.org".to_string())
        );
        assert_eq!(normalize_email("no-at-sign"), None);
        assert_eq!(normalize_email("@school.org"), None);
        assert_eq!(normalize_email("a@b@c"), None);
    }

    #[test]
    fn test_contact_for_channel() {
        let contacts = ContactPoints {
            phone: Some("15550100".to_string()),
            email: None,
        };
        assert_eq!(contacts.for_channel(Channel::WhatsApp), Some("15550100"));
        assert_eq!(contacts.for_channel(Channel::Sms), Some("15550100"));
        assert_eq!(contacts.for_channel(Channel::Email), None);
    }

    #[test]
    fn test_owner_requires_name() {
        let identity = Identity {
            id: "t-1".to_string(),
            name: "  ".to_string(),
            phone: None,
            email: None,
        };
        assert!(Recipient::owner(event_ref(), &identity, vec![]).is_err());
    }

    #[test]
    fn test_participant_counterpart_is_owner() {
        let identity = Identity {
            id: "s-1".to_string(),
            name: "Asha".to_string(),
            phone: Some("+1 555 0100".to_string()),
            email: None,
        };
        let recipient = Recipient::participant(event_ref(), &identity, "Mr. Rao").unwrap();
        assert_eq!(recipient.role(), RecipientRole::Participant);
        assert_eq!(recipient.counterpart_name(), "Mr. Rao");
        assert_eq!(recipient.contacts().phone.as_deref(), Some("15550100"));
    }

    #[test]
    fn test_owner_counterpart_joins_participants() {
        let identity = Identity {
            id: "t-1".to_string(),
            name: "Mr. Rao".to_string(),
            phone: None,
            email: None,
        };
        let recipient =
            Recipient::owner(event_ref(), &identity, vec!["Asha".into(), "Ben".into()]).unwrap();
        assert_eq!(recipient.counterpart_name(), "Asha, Ben");
    }

    #[test]
    fn test_reminder_class_validation() {
        let templates = RoleTemplates {
            owner: None,
            participant: Some(template("p")),
        };
        assert!(ReminderClass::new(
            "near-term",
            Duration::zero(),
            Duration::minutes(1),
            Duration::minutes(5),
            vec![Channel::WhatsApp],
            templates.clone(),
        )
        .is_err());
        assert!(ReminderClass::new(
            "near-term",
            Duration::minutes(15),
            Duration::minutes(1),
            Duration::minutes(5),
            vec![],
            templates.clone(),
        )
        .is_err());
        assert!(ReminderClass::new(
            "near-term",
            Duration::minutes(15),
            Duration::minutes(1),
            Duration::minutes(5),
            vec![Channel::WhatsApp],
            RoleTemplates::default(),
        )
        .is_err());
    }

    #[test]
    fn test_reminder_class_dedups_channels() {
        let class = ReminderClass::new(
            "near-term",
            Duration::minutes(15),
            Duration::minutes(1),
            Duration::minutes(5),
            vec![Channel::Email, Channel::WhatsApp, Channel::Email],
            RoleTemplates {
                owner: Some(template("o")),
                participant: None,
            },
        )
        .unwrap();
        assert_eq!(class.channels(), &[Channel::WhatsApp, Channel::Email]);
        assert_eq!(
            class.send_at(Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap()),
            Utc.with_ymd_and_hms(2024, 1, 1, 9, 45, 0).unwrap()
        );
    }

    #[test]
    fn test_idempotency_key_display() {
        let key = IdempotencyKey {
            event_id: "evt-1".into(),
            recipient_identity: "s-1".into(),
            reminder_class: "near-term".into(),
            channel: Channel::Email,
        };
        assert_eq!(key.to_string(), "evt-1:s-1:near-term:email");
    }

    #[test]
    fn test_enum_string_round_trip() {
        assert_eq!("whatsapp".parse::<Channel>().unwrap(), Channel::WhatsApp);
        assert_eq!(Channel::Sms.to_string(), "sms");
        assert_eq!("owner".parse::<RecipientRole>().unwrap(), RecipientRole::Owner);
        assert_eq!("failed".parse::<DeliveryStatus>().unwrap(), DeliveryStatus::Failed);
        assert!("pigeon".parse::<Channel>().is_err());
    }

    proptest! {
        #[test]
        fn prop_normalized_phone_is_digits_only_and_stable(raw in "[0-9 +()\\-.]{0,24}") {
            match normalize_phone(&raw) {
                Some(phone) => {
                    prop_assert!(!phone.is_empty());
                    prop_assert!(phone.chars().all(|c| c.is_ascii_digit()));
                    prop_assert_eq!(normalize_phone(&phone), Some(phone.clone()));
                    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
                    prop_assert_eq!(phone, digits);
                }
                None => prop_assert!(!raw.chars().any(|c| c.is_ascii_digit())),
            }
        }
    }
}

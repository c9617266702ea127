// Message template configuration and rendering

use crate::models::{Recipient, RecipientRole, ReminderClass};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Human-readable instant format used in message bodies, e.g. "Jan 01, 2024, 03:30 PM"
pub const READABLE_FORMAT: &str = "%b %d, %Y, %I:%M %p";

/// A value substituted into a positional template body slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateField {
    RecipientName,
    CounterpartName,
    Subject,
    StartsAt,
    SendAt,
}

fn default_language_code() -> String {
    "en".to_string()
}

/// Provider template registered for one role of one reminder class
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageTemplate {
    pub name: String,
    #[serde(default = "default_language_code")]
    pub language_code: String,
    pub body: Vec<TemplateField>,
    #[serde(default)]
    pub campaign_id: Option<String>,
    #[serde(default)]
    pub email_subject: Option<String>,
}

/// A rendered message, ready to hand to any channel transport
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TemplateMessage {
    pub template_name: String,
    pub language_code: String,
    pub body_values: Vec<String>,
    pub campaign_id: Option<String>,
    pub email_subject: String,
    pub role: RecipientRole,
    pub recipient_name: String,
    pub counterpart_name: String,
    pub subject: String,
    pub starts_at: String,
    /// Callback payload echoed back by providers
    pub correlation: serde_json::Value,
}

/// Renders templates for recipients, formatting instants in the display timezone
#[derive(Debug, Clone)]
pub struct TemplateRenderer {
    timezone: Tz,
}

impl TemplateRenderer {
    pub fn new(timezone: Tz) -> Self {
        Self { timezone }
    }

    pub fn readable(&self, instant: DateTime<Utc>) -> String {
        instant
            .with_timezone(&self.timezone)
            .format(READABLE_FORMAT)
            .to_string()
    }

    pub fn render(
        &self,
        recipient: &Recipient,
        class: &ReminderClass,
        template: &MessageTemplate,
    ) -> TemplateMessage {
        let event = recipient.event();
        let counterpart = recipient.counterpart_name();
        let starts_at = self.readable(event.starts_at);

        let body_values = template
            .body
            .iter()
            .map(|field| match field {
                TemplateField::RecipientName => recipient.name().to_string(),
                TemplateField::CounterpartName => counterpart.clone(),
                TemplateField::Subject => event.subject.clone(),
                TemplateField::StartsAt => starts_at.clone(),
                TemplateField::SendAt => self.readable(class.send_at(event.starts_at)),
            })
            .collect();

        let email_subject = template
            .email_subject
            .clone()
            .unwrap_or_else(|| format!("Reminder: {} starts at {}", event.subject, starts_at));

        TemplateMessage {
            template_name: template.name.clone(),
            language_code: template.language_code.clone(),
            body_values,
            campaign_id: template.campaign_id.clone(),
            email_subject,
            role: recipient.role(),
            recipient_name: recipient.name().to_string(),
            counterpart_name: counterpart.clone(),
            subject: event.subject.clone(),
            starts_at: starts_at.clone(),
            correlation: json!({
                "event_id": event.event_id,
                "reminder_class": class.name(),
                "role": recipient.role().to_string(),
                "recipient_name": recipient.name(),
                "counterpart_name": counterpart,
                "subject": event.subject,
                "starts_at": event.starts_at.to_rfc3339(),
            }),
        }
    }
}

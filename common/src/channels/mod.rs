// Channel transports: one fallible remote call per message

pub mod email;
pub mod sms;
pub mod whatsapp;

use crate::config::TransportsConfig;
use crate::errors::TransportError;
use crate::models::Channel;
use crate::templates::TemplateMessage;
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub use email::EmailTransport;
pub use sms::SmsTemplateTransport;
pub use whatsapp::WhatsAppTransport;

/// Provider acknowledgement of an accepted message
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransportReceipt {
    pub provider_status: String,
    pub payload: String,
}

/// Sender for one channel kind
#[async_trait]
pub trait ChannelTransport: Send + Sync {
    fn channel(&self) -> Channel;

    /// Send a rendered template message to a normalized contact value
    async fn send_template(
        &self,
        contact: &str,
        message: &TemplateMessage,
    ) -> Result<TransportReceipt, TransportError>;
}

/// Configured transports by channel
#[derive(Clone, Default)]
pub struct ChannelRegistry {
    transports: HashMap<Channel, Arc<dyn ChannelTransport>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build every transport that has configuration. HTTP transports share one client.
    pub fn from_config(
        config: &TransportsConfig,
        request_timeout_seconds: u64,
    ) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(request_timeout_seconds))
            .build()
            .map_err(|e| TransportError::Request(format!("Failed to create HTTP client: {}", e)))?;

        let mut registry = Self::new();
        if let Some(whatsapp) = &config.whatsapp {
            registry.register(Arc::new(WhatsAppTransport::new(whatsapp, client.clone())));
        }
        if let Some(sms) = &config.sms {
            registry.register(Arc::new(SmsTemplateTransport::new(sms, client.clone())));
        }
        if let Some(email) = &config.email {
            registry.register(Arc::new(EmailTransport::new(email)?));
        }
        Ok(registry)
    }

    pub fn register(&mut self, transport: Arc<dyn ChannelTransport>) {
        self.transports.insert(transport.channel(), transport);
    }

    pub fn get(&self, channel: Channel) -> Option<Arc<dyn ChannelTransport>> {
        self.transports.get(&channel).cloned()
    }

    pub fn channels(&self) -> Vec<Channel> {
        let mut channels: Vec<Channel> = self.transports.keys().copied().collect();
        channels.sort();
        channels
    }
}

/// Turn an HTTP provider response into a receipt, keeping the raw body either way
pub(crate) async fn into_receipt(
    response: reqwest::Response,
) -> Result<TransportReceipt, TransportError> {
    let status = response.status();
    let payload = response
        .text()
        .await
        .map_err(|e| TransportError::Request(format!("Failed to read provider response: {}", e)))?;

    if status.is_success() {
        Ok(TransportReceipt {
            provider_status: status.as_u16().to_string(),
            payload,
        })
    } else {
        Err(TransportError::Rejected {
            status: status.as_u16(),
            payload,
        })
    }
}

pub(crate) fn request_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Request(format!("Provider request timed out: {}", err))
    } else {
        TransportError::Request(err.to_string())
    }
}

#[cfg(test)]
pub(crate) fn sample_message() -> TemplateMessage {
    use crate::models::RecipientRole;

    TemplateMessage {
        template_name: "before_course_class_15min_student_".to_string(),
        language_code: "en".to_string(),
        body_values: vec!["Asha".to_string(), "Physics".to_string()],
        campaign_id: None,
        email_subject: "Reminder: Your class starts in 15 minutes".to_string(),
        role: RecipientRole::Participant,
        recipient_name: "Asha".to_string(),
        counterpart_name: "Mr. Rao".to_string(),
        subject: "Physics".to_string(),
        starts_at: "Jan 01, 2024, 03:30 PM".to_string(),
        correlation: serde_json::json!({ "event_id": "evt-1", "reminder_class": "near-term" }),
    }
}

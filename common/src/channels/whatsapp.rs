// WhatsApp template messages over an Interakt-style public API

use super::{into_receipt, request_error, ChannelTransport, TransportReceipt};
use crate::config::WhatsAppConfig;
use crate::errors::TransportError;
use crate::models::Channel;
use crate::templates::TemplateMessage;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, instrument};

pub struct WhatsAppTransport {
    client: Client,
    endpoint: String,
    auth_header: String,
}

impl WhatsAppTransport {
    pub fn new(config: &WhatsAppConfig, client: Client) -> Self {
        Self {
            client,
            endpoint: format!("{}/message/", config.base_url.trim_end_matches('/')),
            auth_header: config.auth_header.clone(),
        }
    }

    fn payload(contact: &str, message: &TemplateMessage) -> Value {
        let mut payload = json!({
            "fullPhoneNumber": contact,
            "type": "Template",
            "template": {
                "name": message.template_name,
                "languageCode": message.language_code,
                "bodyValues": message.body_values,
            },
            "callbackData": message.correlation.to_string(),
        });
        if let Some(campaign_id) = &message.campaign_id {
            payload["campaignId"] = json!(campaign_id);
        }
        payload
    }
}

#[async_trait]
impl ChannelTransport for WhatsAppTransport {
    fn channel(&self) -> Channel {
        Channel::WhatsApp
    }

    #[instrument(skip(self, message), fields(template = %message.template_name))]
    async fn send_template(
        &self,
        contact: &str,
        message: &TemplateMessage,
    ) -> Result<TransportReceipt, TransportError> {
        if contact.is_empty() {
            return Err(TransportError::InvalidContact("empty phone number".to_string()));
        }

        let response = self
            .client
            .post(&self.endpoint)
            .header("Authorization", &self.auth_header)
            .json(&Self::payload(contact, message))
            .send()
            .await
            .map_err(request_error)?;

        let receipt = into_receipt(response).await?;
        debug!(provider_status = %receipt.provider_status, "WhatsApp template accepted");
        Ok(receipt)
    }
}

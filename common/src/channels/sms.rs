// SMS-style template messages over a SagePilot-style API

use super::{into_receipt, request_error, ChannelTransport, TransportReceipt};
use crate::config::SmsConfig;
use crate::errors::TransportError;
use crate::models::Channel;
use crate::templates::TemplateMessage;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, instrument};

pub struct SmsTemplateTransport {
    client: Client,
    config: SmsConfig,
}

impl SmsTemplateTransport {
    pub fn new(config: &SmsConfig, client: Client) -> Self {
        Self {
            client,
            config: config.clone(),
        }
    }

    fn payload(&self, contact: &str, message: &TemplateMessage) -> Value {
        let customer_name = if message.recipient_name.is_empty() {
            "User"
        } else {
            message.recipient_name.as_str()
        };
        let texts: Vec<Value> = message
            .body_values
            .iter()
            .map(|text| json!({ "type": "text", "text": text }))
            .collect();

        json!({
            "customer_phone": contact,
            "customer_name": customer_name,
            "message_type": "template",
            "channel_id": self.config.channel_id,
            "template_name": message.template_name,
            "parameter_type": "list",
            "parameters": [{ "type": "body", "parameters": texts }],
        })
    }
}

#[async_trait]
impl ChannelTransport for SmsTemplateTransport {
    fn channel(&self) -> Channel {
        Channel::Sms
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
            .post(&self.config.base_url)
            .bearer_auth(&self.config.token)
            .header("X-SP-Workspace-Id", &self.config.workspace_id)
            .json(&self.payload(contact, message))
            .send()
            .await
            .map_err(request_error)?;

        let receipt = into_receipt(response).await?;
        debug!(provider_status = %receipt.provider_status, "SMS template accepted");
        Ok(receipt)
    }
}

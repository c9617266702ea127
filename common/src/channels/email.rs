// HTML email reminders over SMTP

use super::{ChannelTransport, TransportReceipt};
use crate::config::EmailConfig;
use crate::errors::TransportError;
use crate::models::{Channel, RecipientRole};
use crate::templates::TemplateMessage;
use async_trait::async_trait;
use lettre::message::{header::ContentType, Mailbox};
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::response::Response;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tera::{Context, Tera};
use tracing::{debug, instrument};

const OWNER_TEMPLATE: &str = "owner.html";
const PARTICIPANT_TEMPLATE: &str = "participant.html";

const OWNER_HTML: &str = r#"<div style="font-family: Arial, sans-serif; line-height: 1.5;">
  <p>Hi {{ recipient_name }},</p>
  <p>This is a reminder that your <strong>{{ subject }}</strong> session with {{ counterpart_name }} starts at <strong>{{ starts_at }}</strong>.</p>
  <p>Please be ready a few minutes early.</p>
</div>"#;

const PARTICIPANT_HTML: &str = r#"<div style="font-family: Arial, sans-serif; line-height: 1.5;">
  <p>Hi {{ recipient_name }},</p>
  <p>Your <strong>{{ subject }}</strong> class with {{ counterpart_name }} starts at <strong>{{ starts_at }}</strong>.</p>
  <p>See you there!</p>
</div>"#;

pub struct EmailTransport {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    tera: Tera,
}

impl EmailTransport {
    pub fn new(config: &EmailConfig) -> Result<Self, TransportError> {
        let from: Mailbox = format!("{} <{}>", config.from_name, config.from_address)
            .parse()
            .map_err(|e| TransportError::NotConfigured(format!("Invalid from address: {}", e)))?;

        let creds = Credentials::new(config.username.clone(), config.password.clone());
        let mailer = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)
            .map_err(|e| TransportError::NotConfigured(format!("SMTP relay: {}", e)))?
            .port(config.smtp_port)
            .credentials(creds)
            .build();

        Ok(Self {
            mailer,
            from,
            tera: Self::templates()?,
        })
    }

    fn templates() -> Result<Tera, TransportError> {
        let mut tera = Tera::default();
        tera.add_raw_templates(vec![
            (OWNER_TEMPLATE, OWNER_HTML),
            (PARTICIPANT_TEMPLATE, PARTICIPANT_HTML),
        ])
        .map_err(|e| TransportError::NotConfigured(format!("Email templates: {}", e)))?;
        Ok(tera)
    }

    pub fn render_html(&self, message: &TemplateMessage) -> Result<String, TransportError> {
        render_html(&self.tera, message)
    }
}

fn render_html(tera: &Tera, message: &TemplateMessage) -> Result<String, TransportError> {
    let template = match message.role {
        RecipientRole::Owner => OWNER_TEMPLATE,
        RecipientRole::Participant => PARTICIPANT_TEMPLATE,
    };

    let mut context = Context::new();
    context.insert("recipient_name", &message.recipient_name);
    context.insert("counterpart_name", &message.counterpart_name);
    context.insert("subject", &message.subject);
    context.insert("starts_at", &message.starts_at);

    tera.render(template, &context)
        .map_err(|e| TransportError::Request(format!("Failed to render email body: {}", e)))
}

#[async_trait]
impl ChannelTransport for EmailTransport {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    #[instrument(skip(self, message), fields(template = %message.template_name))]
    async fn send_template(
        &self,
        contact: &str,
        message: &TemplateMessage,
    ) -> Result<TransportReceipt, TransportError> {
        let to: Mailbox = contact
            .parse()
            .map_err(|e| TransportError::InvalidContact(format!("{}: {}", contact, e)))?;

        let email = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(message.email_subject.as_str())
            .header(ContentType::TEXT_HTML)
            .body(self.render_html(message)?)
            .map_err(|e| TransportError::Request(format!("Build email: {}", e)))?;

        let response = self
            .mailer
            .send(email)
            .await
            .map_err(|e| TransportError::Request(format!("SMTP send: {}", e)))?;

        let receipt = receipt_from(&response);
        debug!(provider_status = %receipt.provider_status, "Email accepted by SMTP relay");
        Ok(receipt)
    }
}

fn receipt_from(response: &Response) -> TransportReceipt {
    TransportReceipt {
        provider_status: response.code().to_string(),
        payload: response
            .message()
            .map(str::to_string)
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

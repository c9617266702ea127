// Configuration management with layered configuration (file, env)

use crate::errors::ValidationError;
use crate::models::{Channel, ReminderClass, RoleTemplates};
use crate::templates::{MessageTemplate, TemplateField};
use chrono::Duration;
use chrono_tz::Tz;
use config::{Config, ConfigError, Environment, File};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

/// Main settings structure containing all configuration options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub database: DatabaseConfig,
    pub dispatch: DispatchConfig,
    #[serde(default = "default_reminders")]
    pub reminders: Vec<ReminderClassConfig>,
    #[serde(default)]
    pub transports: TransportsConfig,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Recipients dispatched concurrently within one tick
    pub max_concurrency: usize,
    /// Upper bound on a single transport call
    pub send_timeout_seconds: u64,
    /// IANA timezone used for human-readable instants in messages
    pub display_timezone: String,
}

/// One reminder lead time as configured
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReminderClassConfig {
    pub name: String,
    pub lead_seconds: i64,
    pub poll_cadence_seconds: i64,
    pub tolerance_seconds: i64,
    pub channels: Vec<Channel>,
    #[serde(default)]
    pub templates: RoleTemplates,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransportsConfig {
    #[serde(default)]
    pub whatsapp: Option<WhatsAppConfig>,
    #[serde(default)]
    pub sms: Option<SmsConfig>,
    #[serde(default)]
    pub email: Option<EmailConfig>,
}

/// Interakt-style WhatsApp template API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhatsAppConfig {
    pub base_url: String,
    /// Full `Authorization` header value, e.g. `Basic <key>`
    pub auth_header: String,
}

/// SagePilot-style SMS template API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmsConfig {
    pub base_url: String,
    pub token: String,
    pub workspace_id: String,
    pub channel_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    pub smtp_host: String,
    pub smtp_port: u16,
    pub username: String,
    pub password: String,
    pub from_name: String,
    pub from_address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    #[serde(default = "default_json_logs")]
    pub json_logs: bool,
    #[serde(default)]
    pub metrics_port: Option<u16>,
    #[serde(default)]
    pub tracing_endpoint: Option<String>,
}

fn default_json_logs() -> bool {
    true
}

fn default_reminders() -> Vec<ReminderClassConfig> {
    vec![
        ReminderClassConfig {
            name: "near-term".to_string(),
            lead_seconds: 15 * 60,
            poll_cadence_seconds: 60,
            tolerance_seconds: 5 * 60,
            channels: vec![Channel::WhatsApp, Channel::Email],
            templates: RoleTemplates {
                owner: Some(MessageTemplate {
                    name: "before_course_class_15mins_teachers_tv".to_string(),
                    language_code: "en".to_string(),
                    body: vec![
                        TemplateField::RecipientName,
                        TemplateField::CounterpartName,
                        TemplateField::Subject,
                    ],
                    campaign_id: None,
                    email_subject: Some(
                        "Reminder: Your teaching session starts in 15 minutes".to_string(),
                    ),
                }),
                participant: Some(MessageTemplate {
                    name: "before_course_class_15min_student_".to_string(),
                    language_code: "en".to_string(),
                    body: vec![TemplateField::RecipientName, TemplateField::Subject],
                    campaign_id: None,
                    email_subject: Some("Reminder: Your class starts in 15 minutes".to_string()),
                }),
            },
        },
        ReminderClassConfig {
            name: "advance".to_string(),
            lead_seconds: 8 * 60 * 60,
            poll_cadence_seconds: 5 * 60,
            tolerance_seconds: 30 * 60,
            channels: vec![Channel::WhatsApp],
            templates: RoleTemplates {
                owner: None,
                participant: Some(MessageTemplate {
                    name: "before_course_class_to_confirm_joining_8hr_student_8s".to_string(),
                    language_code: "en".to_string(),
                    body: vec![
                        TemplateField::RecipientName,
                        TemplateField::Subject,
                        TemplateField::StartsAt,
                        TemplateField::CounterpartName,
                        TemplateField::SendAt,
                    ],
                    campaign_id: None,
                    email_subject: None,
                }),
            },
        },
    ]
}

impl ReminderClassConfig {
    pub fn build(&self) -> Result<ReminderClass, ValidationError> {
        ReminderClass::new(
            self.name.clone(),
            Duration::seconds(self.lead_seconds),
            Duration::seconds(self.poll_cadence_seconds),
            Duration::seconds(self.tolerance_seconds),
            self.channels.clone(),
            self.templates.clone(),
        )
    }
}

impl Settings {
    /// Load configuration with layered precedence: defaults → file → env
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("config")
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Local overrides, not committed
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            .add_source(
                Environment::with_prefix("REMINDER")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<(), String> {
        if self.database.url.is_empty() {
            return Err("Database URL cannot be empty".to_string());
        }
        if self.database.max_connections == 0 {
            return Err("Database max_connections must be greater than 0".to_string());
        }

        if self.dispatch.max_concurrency == 0 {
            return Err("Dispatch max_concurrency must be greater than 0".to_string());
        }
        if self.dispatch.send_timeout_seconds == 0 {
            return Err("Dispatch send_timeout_seconds must be greater than 0".to_string());
        }
        self.display_timezone()?;

        if self.reminders.is_empty() {
            return Err("At least one reminder class must be configured".to_string());
        }

        let template_name = Regex::new(r"^[A-Za-z0-9_\-]+$").map_err(|e| e.to_string())?;
        let mut names = HashSet::new();
        for reminder in &self.reminders {
            if !names.insert(reminder.name.as_str()) {
                return Err(format!("Duplicate reminder class name: {}", reminder.name));
            }
            reminder.build().map_err(|e| e.to_string())?;

            let templates = [&reminder.templates.owner, &reminder.templates.participant];
            for template in templates.into_iter().flatten() {
                if !template_name.is_match(&template.name) {
                    return Err(format!(
                        "Reminder class {} has invalid template name: {:?}",
                        reminder.name, template.name
                    ));
                }
            }
        }

        if let Some(email) = &self.transports.email {
            if email.smtp_host.is_empty() {
                return Err("Email smtp_host cannot be empty".to_string());
            }
            if email.from_address.is_empty() {
                return Err("Email from_address cannot be empty".to_string());
            }
        }

        Ok(())
    }

    pub fn display_timezone(&self) -> Result<Tz, String> {
        self.dispatch
            .display_timezone
            .parse::<Tz>()
            .map_err(|e| format!("Invalid display_timezone: {}", e))
    }

    /// Immutable reminder classes shared for the process lifetime
    pub fn reminder_classes(&self) -> Result<Vec<Arc<ReminderClass>>, ValidationError> {
        self.reminders
            .iter()
            .map(|r| r.build().map(Arc::new))
            .collect()
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "postgresql://localhost/class_reminders".to_string(),
                max_connections: 10,
                min_connections: 2,
                connect_timeout_seconds: 30,
            },
            dispatch: DispatchConfig {
                max_concurrency: 16,
                send_timeout_seconds: 15,
                display_timezone: "Asia/Kolkata".to_string(),
            },
            reminders: default_reminders(),
            transports: TransportsConfig::default(),
            observability: ObservabilityConfig {
                log_level: "info".to_string(),
                json_logs: true,
                metrics_port: Some(9090),
                tracing_endpoint: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_settings_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());

        let classes = settings.reminder_classes().unwrap();
        assert_eq!(classes.len(), 2);
        assert_eq!(classes[0].name(), "near-term");
        assert_eq!(classes[0].lead(), Duration::minutes(15));
        assert_eq!(classes[1].name(), "advance");
        assert!(classes[1].templates().owner.is_none());
    }

    #[test]
    fn test_validation_catches_empty_database_url() {
        let mut settings = Settings::default();
        settings.database.url = String::new();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validation_catches_zero_concurrency() {
        let mut settings = Settings::default();
        settings.dispatch.max_concurrency = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validation_catches_unknown_timezone() {
        let mut settings = Settings::default();
        settings.dispatch.display_timezone = "Mars/Olympus".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validation_catches_duplicate_class_names() {
        let mut settings = Settings::default();
        let duplicate = settings.reminders[0].clone();
        settings.reminders.push(duplicate);
        let err = settings.validate().unwrap_err();
        assert!(err.contains("Duplicate"));
    }

    #[test]
    fn test_validation_catches_zero_lead() {
        let mut settings = Settings::default();
        settings.reminders[1].lead_seconds = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validation_catches_class_without_channels() {
        let mut settings = Settings::default();
        settings.reminders[0].channels.clear();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validation_catches_bad_template_name() {
        let mut settings = Settings::default();
        if let Some(template) = settings.reminders[0].templates.participant.as_mut() {
            template.name = "has spaces".to_string();
        }
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_load_from_path_reads_toml() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join("default.toml")).unwrap();
        writeln!(
            file,
            r#"
[database]
url = "postgresql://db/reminders"
max_connections = 4
min_connections = 1
connect_timeout_seconds = 5

[dispatch]
max_concurrency = 8
send_timeout_seconds = 10
display_timezone = "UTC"

[observability]
log_level = "debug"

[[reminders]]
name = "near-term"
lead_seconds = 900
poll_cadence_seconds = 60
tolerance_seconds = 300
channels = ["whatsapp", "sms"]

[reminders.templates.participant]
name = "before_course_class_15min_student_"
body = ["recipient_name", "subject"]

[transports.whatsapp]
base_url = "https://api.interakt.ai/v1/public"
auth_header = "Basic abc"
"#
        )
        .unwrap();

        let settings = Settings::load_from_path(dir.path()).unwrap();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.database.max_connections, 4);
        assert_eq!(settings.reminders.len(), 1);
        assert_eq!(
            settings.reminders[0].channels,
            vec![Channel::WhatsApp, Channel::Sms]
        );
        assert!(settings.transports.whatsapp.is_some());
        assert!(settings.transports.email.is_none());
        assert!(settings.observability.json_logs);
        assert_eq!(settings.observability.metrics_port, None);
    }
}

// Telemetry module for structured logging, metrics, tracing and operator alerts

use anyhow::Result;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    trace::{RandomIdGenerator, Sampler, TracerProvider},
    Resource,
};
use std::fmt;
use std::net::SocketAddr;
use tracing_subscriber::{
    fmt as tracing_fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

const SERVICE_NAME: &str = "class-reminder-dispatch";

/// Initialize structured logging
///
/// Sets up the tracing subscriber with:
/// - JSON or human-readable formatting
/// - Log level from configuration, overridden by `RUST_LOG`
/// - Optional OpenTelemetry export
#[tracing::instrument(skip_all)]
pub fn init_logging(log_level: &str, json: bool, tracing_endpoint: Option<&str>) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .map_err(|e| anyhow::anyhow!("Failed to create env filter: {}", e))?;

    let fmt_layer: Box<dyn Layer<Registry> + Send + Sync> = if json {
        tracing_fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .with_filter(env_filter)
            .boxed()
    } else {
        tracing_fmt::layer()
            .with_target(true)
            .with_filter(env_filter)
            .boxed()
    };

    let registry = tracing_subscriber::registry().with(fmt_layer);

    if let Some(endpoint) = tracing_endpoint {
        let tracer = init_tracer(endpoint)?;
        let telemetry_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        registry
            .with(telemetry_layer)
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;
    } else {
        registry
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;
    }

    tracing::info!(
        log_level = log_level,
        json = json,
        tracing_endpoint = tracing_endpoint,
        "Structured logging initialized"
    );

    Ok(())
}

/// Initialize OpenTelemetry tracer with OTLP exporter
#[tracing::instrument(skip_all)]
fn init_tracer(endpoint: &str) -> Result<opentelemetry_sdk::trace::Tracer> {
    use opentelemetry_sdk::runtime::Tokio;

    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(endpoint)
        .build_span_exporter()
        .map_err(|e| anyhow::anyhow!("Failed to build span exporter: {}", e))?;

    let tracer_provider = TracerProvider::builder()
        .with_batch_exporter(exporter, Tokio)
        .with_config(
            opentelemetry_sdk::trace::Config::default()
                .with_sampler(Sampler::AlwaysOn)
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(Resource::new(vec![
                    KeyValue::new("service.name", SERVICE_NAME),
                    KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                ])),
        )
        .build();

    global::set_tracer_provider(tracer_provider.clone());
    let tracer = tracer_provider.tracer(SERVICE_NAME);

    tracing::info!(endpoint = endpoint, "OpenTelemetry tracer initialized");

    Ok(tracer)
}

/// Flush remaining spans on graceful shutdown
pub fn shutdown_tracer() {
    global::shutdown_tracer_provider();
}

/// Initialize the Prometheus metrics exporter and describe reminder metrics
#[tracing::instrument(skip_all)]
pub fn init_metrics(metrics_port: u16) -> Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", metrics_port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid metrics port: {}", e))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    describe_counter!(
        "reminder_delivery_total",
        "Reminder send attempts by class, channel and status"
    );
    describe_counter!(
        "reminder_ledger_write_failed_total",
        "Delivery records that could not be written to the ledger"
    );
    describe_counter!(
        "reminder_duplicate_sent_total",
        "Sends that raced another dispatch of the same key"
    );
    describe_counter!("reminder_tick_failed_total", "Poll ticks that failed");
    describe_counter!(
        "reminder_stale_skipped_total",
        "Reminders discovered after their tolerance window"
    );
    describe_gauge!(
        "reminder_pending_dispatches",
        "Deferred sends currently armed"
    );
    describe_histogram!(
        "reminder_tick_duration_seconds",
        "Duration of poll ticks in seconds"
    );

    tracing::info!(
        metrics_port = metrics_port,
        metrics_endpoint = format!("http://0.0.0.0:{}/metrics", metrics_port),
        "Prometheus metrics exporter initialized"
    );

    Ok(())
}

#[inline]
pub fn record_delivery(class: &str, channel: &str, status: &str) {
    counter!(
        "reminder_delivery_total",
        "class" => class.to_string(),
        "channel" => channel.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

#[inline]
pub fn record_ledger_write_failure(class: &str, channel: &str, status: &str) {
    counter!(
        "reminder_ledger_write_failed_total",
        "class" => class.to_string(),
        "channel" => channel.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

#[inline]
pub fn record_duplicate_sent(class: &str, channel: &str) {
    counter!(
        "reminder_duplicate_sent_total",
        "class" => class.to_string(),
        "channel" => channel.to_string()
    )
    .increment(1);
}

#[inline]
pub fn record_tick_failure(class: &str) {
    counter!("reminder_tick_failed_total", "class" => class.to_string()).increment(1);
}

#[inline]
pub fn record_stale_skip(class: &str) {
    counter!("reminder_stale_skipped_total", "class" => class.to_string()).increment(1);
}

#[inline]
pub fn record_tick_duration(class: &str, duration_seconds: f64) {
    histogram!("reminder_tick_duration_seconds", "class" => class.to_string())
        .record(duration_seconds);
}

#[inline]
pub fn update_pending_dispatches(class: &str, pending: usize) {
    gauge!("reminder_pending_dispatches", "class" => class.to_string()).set(pending as f64);
}

/// Kinds of operator alerts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertKind {
    /// A message went out but its SENT record was not written
    UnrecordedSent,
    /// A FAILED record was not written
    UnrecordedFailure,
    /// A poll tick failed, leaving events undiscovered until a later tick
    CoverageGap,
    /// A due reminder could not be checked against the ledger before its
    /// tolerance ran out, so it was never sent
    UndeliveredReminder,
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertKind::UnrecordedSent => write!(f, "unrecorded_sent"),
            AlertKind::UnrecordedFailure => write!(f, "unrecorded_failure"),
            AlertKind::CoverageGap => write!(f, "coverage_gap"),
            AlertKind::UndeliveredReminder => write!(f, "undelivered_reminder"),
        }
    }
}

/// An operator alert
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    pub kind: AlertKind,
    pub reminder_class: String,
    /// Idempotency key or window the alert is about
    pub subject: String,
    pub detail: String,
}

/// Alert notification interface
#[async_trait::async_trait]
pub trait AlertNotifier: Send + Sync {
    async fn send_alert(&self, alert: &Alert) -> Result<()>;
}

/// Log-based alert notifier (default implementation)
///
/// Logs alerts at ERROR level with an `alert_type` field for log-based alerting rules.
pub struct LogAlertNotifier;

#[async_trait::async_trait]
impl AlertNotifier for LogAlertNotifier {
    #[tracing::instrument(skip(self))]
    async fn send_alert(&self, alert: &Alert) -> Result<()> {
        tracing::error!(
            alert_type = %alert.kind,
            reminder_class = %alert.reminder_class,
            subject = %alert.subject,
            detail = %alert.detail,
            "ALERT: {}",
            alert.kind
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_rejects_bad_filter() {
        std::env::remove_var("RUST_LOG");
        let err = init_logging("reminder=verbose", false, None).unwrap_err();
        assert!(err.to_string().contains("env filter"));
    }

    #[test]
    fn test_metrics_recording() {
        record_delivery("near-term", "whatsapp", "sent");
        record_ledger_write_failure("near-term", "email", "sent");
        record_duplicate_sent("near-term", "email");
        record_tick_failure("advance");
        record_stale_skip("advance");
        record_tick_duration("advance", 0.25);
        update_pending_dispatches("near-term", 3);
    }

    #[test]
    fn test_alert_kind_display() {
        assert_eq!(AlertKind::UnrecordedSent.to_string(), "unrecorded_sent");
        assert_eq!(AlertKind::CoverageGap.to_string(), "coverage_gap");
        assert_eq!(
            AlertKind::UndeliveredReminder.to_string(),
            "undelivered_reminder"
        );
    }

    #[tokio::test]
    async fn test_log_alert_notifier() {
        let alert = Alert {
            kind: AlertKind::CoverageGap,
            reminder_class: "near-term".to_string(),
            subject: "[09:59:30, 10:00:30)".to_string(),
            detail: "store unavailable".to_string(),
        };
        assert!(LogAlertNotifier.send_alert(&alert).await.is_ok());
    }
}

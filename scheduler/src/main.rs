// Reminder scheduler binary entry point

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use common::channels::ChannelRegistry;
use common::clock::{Clock, SystemClock};
use common::config::Settings;
use common::coordinator::{Coordinator, ReminderCoordinator};
use common::db::{DbPool, PgEventStore, PgIdentityDirectory, PgLedgerStore};
use common::dispatch::DispatchScheduler;
use common::finder::CandidateFinder;
use common::ledger::DeliveryLedger;
use common::notifier::ChannelNotifier;
use common::resolver::RecipientResolver;
use common::storage::{EventStore, IdentityDirectory, LedgerStore};
use common::telemetry::{self, AlertNotifier, LogAlertNotifier};
use common::templates::TemplateRenderer;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(
    name = "reminder-scheduler",
    version,
    about = "Sends class session reminders ahead of each session's start"
)]
struct Cli {
    /// Directory holding default.toml and local.toml
    #[arg(long, default_value = "config")]
    config_dir: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run every reminder class until interrupted
    Run,

    /// Execute a single tick for one reminder class and print the report
    RunOnce {
        #[arg(long)]
        class: String,
    },

    /// List upcoming sessions with the recipients that would be reminded
    Preview {
        #[arg(long, default_value = "10")]
        limit: usize,

        /// Only sessions owned by this identity
        #[arg(long)]
        owner: Option<String>,

        #[arg(long, default_value = "24")]
        horizon_hours: i64,
    },

    /// Print the most recent delivery attempts
    History {
        #[arg(long, default_value = "20")]
        limit: usize,
    },
}

/// Everything wired against PostgreSQL and the configured transports
struct Engine {
    pool: DbPool,
    ledger: Arc<DeliveryLedger>,
    coordinators: Vec<Arc<ReminderCoordinator>>,
}

impl Engine {
    async fn build(settings: &Settings) -> Result<Self> {
        let pool = DbPool::new(&settings.database)
            .await
            .context("Failed to initialize database pool")?;
        pool.run_migrations()
            .await
            .context("Failed to apply database migrations")?;

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let events: Arc<dyn EventStore> = Arc::new(PgEventStore::new(pool.clone()));
        let directory: Arc<dyn IdentityDirectory> = Arc::new(PgIdentityDirectory::new(pool.clone()));
        let ledger_store: Arc<dyn LedgerStore> = Arc::new(PgLedgerStore::new(pool.clone()));
        let alerts: Arc<dyn AlertNotifier> = Arc::new(LogAlertNotifier);

        let ledger = Arc::new(DeliveryLedger::new(ledger_store, alerts.clone()));
        let transports = ChannelRegistry::from_config(
            &settings.transports,
            settings.dispatch.send_timeout_seconds,
        )
        .context("Failed to initialize channel transports")?;
        info!(channels = ?transports.channels(), "Channel transports initialized");

        let classes = settings
            .reminder_classes()
            .context("Invalid reminder class configuration")?;
        for class in &classes {
            for channel in class.channels() {
                if transports.get(*channel).is_none() {
                    warn!(
                        reminder_class = %class.name(),
                        channel = %channel,
                        "Channel enabled without a configured transport; deliveries will be ineligible"
                    );
                }
            }
        }

        let timezone = settings.display_timezone().map_err(anyhow::Error::msg)?;
        let notifier = Arc::new(ChannelNotifier::new(
            clock.clone(),
            ledger.clone(),
            transports,
            TemplateRenderer::new(timezone),
            Duration::from_secs(settings.dispatch.send_timeout_seconds),
        ));
        let finder = Arc::new(CandidateFinder::new(events.clone()));
        let resolver = Arc::new(RecipientResolver::new(directory));

        let coordinators = classes
            .into_iter()
            .map(|class| {
                let dispatcher = Arc::new(DispatchScheduler::new(
                    clock.clone(),
                    notifier.clone(),
                    events.clone(),
                    alerts.clone(),
                ));
                Arc::new(ReminderCoordinator::new(
                    class,
                    clock.clone(),
                    finder.clone(),
                    resolver.clone(),
                    dispatcher,
                    alerts.clone(),
                    settings.dispatch.max_concurrency,
                ))
            })
            .collect();

        Ok(Self {
            pool,
            ledger,
            coordinators,
        })
    }

    fn coordinator(&self, class: &str) -> Result<&Arc<ReminderCoordinator>> {
        self.coordinators
            .iter()
            .find(|c| c.class().name() == class)
            .with_context(|| format!("Unknown reminder class: {}", class))
    }

    async fn stop_all(&self) {
        for coordinator in &self.coordinators {
            if let Err(e) = coordinator.stop().await {
                error!(
                    reminder_class = %coordinator.class().name(),
                    error = %e,
                    "Error stopping coordinator"
                );
            }
        }
        for coordinator in &self.coordinators {
            coordinator.dispatcher().wait_idle().await;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = Settings::load_from_path(&cli.config_dir).context("Failed to load configuration")?;
    settings
        .validate()
        .map_err(anyhow::Error::msg)
        .context("Invalid configuration")?;

    telemetry::init_logging(
        &settings.observability.log_level,
        settings.observability.json_logs,
        settings.observability.tracing_endpoint.as_deref(),
    )?;

    let result = match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(&settings).await,
        Command::RunOnce { class } => run_once(&settings, &class).await,
        Command::Preview {
            limit,
            owner,
            horizon_hours,
        } => preview(&settings, limit, owner.as_deref(), horizon_hours).await,
        Command::History { limit } => history(&settings, limit).await,
    };

    if let Err(e) = &result {
        error!(error = %format!("{:#}", e), "Reminder scheduler failed");
    }
    telemetry::shutdown_tracer();
    result
}

async fn run(settings: &Settings) -> Result<()> {
    info!("Starting class reminder scheduler");

    if let Some(port) = settings.observability.metrics_port {
        telemetry::init_metrics(port)?;
    }

    let engine = Engine::build(settings).await?;

    let mut handles = Vec::with_capacity(engine.coordinators.len());
    for coordinator in &engine.coordinators {
        let coordinator = coordinator.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = coordinator.start().await {
                error!(
                    reminder_class = %coordinator.class().name(),
                    error = %e,
                    "Coordinator error"
                );
            }
        }));
    }
    info!(coordinators = handles.len(), "Reminder coordinators started");

    shutdown_signal().await;

    engine.stop_all().await;
    for result in futures::future::join_all(handles).await {
        if let Err(e) = result {
            error!(error = %e, "Coordinator task panicked");
        }
    }
    engine.pool.close().await;

    info!("Class reminder scheduler stopped");
    Ok(())
}

async fn run_once(settings: &Settings, class: &str) -> Result<()> {
    let engine = Engine::build(settings).await?;
    let coordinator = engine.coordinator(class)?;

    let report = coordinator
        .run_tick()
        .await
        .with_context(|| format!("Tick failed for reminder class {}", class))?;

    // Sends due now already ran inline; armed ones belong to the long-running process
    let abandoned = coordinator.dispatcher().shutdown().await;
    if abandoned > 0 {
        info!(abandoned, "Armed sends left to the running scheduler");
    }
    coordinator.dispatcher().wait_idle().await;

    println!("{}", serde_json::to_string_pretty(&report)?);
    engine.pool.close().await;
    Ok(())
}

async fn preview(
    settings: &Settings,
    limit: usize,
    owner: Option<&str>,
    horizon_hours: i64,
) -> Result<()> {
    let engine = Engine::build(settings).await?;
    let coordinator = engine
        .coordinators
        .first()
        .context("No reminder classes configured")?;

    let previews = coordinator
        .preview(chrono::Duration::hours(horizon_hours), owner, limit)
        .await
        .context("Failed to load upcoming sessions")?;

    println!("{}", serde_json::to_string_pretty(&previews)?);
    engine.pool.close().await;
    Ok(())
}

async fn history(settings: &Settings, limit: usize) -> Result<()> {
    let engine = Engine::build(settings).await?;
    let records = engine
        .ledger
        .recent(limit)
        .await
        .context("Failed to load delivery history")?;

    println!("{}", serde_json::to_string_pretty(&records)?);
    engine.pool.close().await;
    Ok(())
}

/// Completes on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }

    info!("Initiating graceful shutdown");
}

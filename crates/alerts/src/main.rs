//! KPI Alerts CLI
//!
//! Runs the alert engine as a daemon or one cycle at a time against a JSON
//! data snapshot, persisting alert state between invocations.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kpi_alerts::{
    AlertEngine, AlertFilter, AlertStore, Cadence, Collaborators, EngineConfig,
    InMemoryAlertStore, Scheduler, SnapshotSource,
};
use notify::Notifier;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// KPI alert engine - evaluates thresholds, tracks alerts, notifies owners
#[derive(Parser)]
#[command(name = "kpi-alerts")]
#[command(about = "KPI alert engine - evaluates thresholds, tracks alerts, notifies owners")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Engine configuration (JSON); defaults when omitted
    #[arg(long, env = "KPI_ALERTS_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Data snapshot with metrics, invoices, conventions and users
    #[arg(long, env = "KPI_ALERTS_DATA", default_value = "data.json", global = true)]
    data: PathBuf,

    /// Alert state file, read at start and written back
    #[arg(long, env = "KPI_ALERTS_STATE", default_value = "alerts-state.json", global = true)]
    state: PathBuf,

    /// Output format for command results
    #[arg(long, default_value = "text", global = true)]
    format: OutputFormat,

    /// Log format
    #[arg(long, default_value = "text", global = true)]
    log_format: OutputFormat,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every cadence on its schedule until interrupted
    Run,
    /// Run one cycle now
    Force {
        /// entity-scan, daily-analysis, severity-sweep or maintenance
        cadence: Cadence,
    },
    /// Show the configured thresholds
    Thresholds,
    /// List stored alerts
    Alerts {
        /// Only NEW and IN_PROGRESS alerts
        #[arg(long)]
        active: bool,
    },
}

fn init_tracing(cli: &Cli) {
    let default = if cli.verbose {
        "kpi_alerts=debug,notify=debug"
    } else {
        "kpi_alerts=info,notify=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match cli.log_format {
        OutputFormat::Json => builder.json().init(),
        OutputFormat::Text => builder.init(),
    }
}

fn load_store(path: &Path) -> Result<Arc<InMemoryAlertStore>> {
    let store = Arc::new(InMemoryAlertStore::new());
    if path.exists() {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read alert state: {}", path.display()))?;
        let count = store
            .import_json(&raw)
            .with_context(|| format!("Failed to import alert state: {}", path.display()))?;
        info!(path = %path.display(), alerts = count, "Restored alert state");
    }
    Ok(store)
}

fn save_store(store: &InMemoryAlertStore, path: &Path) -> Result<()> {
    let json = store.export_json().context("Failed to export alert state")?;
    std::fs::write(path, json)
        .with_context(|| format!("Failed to write alert state: {}", path.display()))?;
    info!(path = %path.display(), alerts = store.len(), "Saved alert state");
    Ok(())
}

fn build_engine(cli: &Cli, store: Arc<InMemoryAlertStore>) -> Result<AlertEngine> {
    let config = EngineConfig::load(cli.config.as_deref())?;
    let data = Arc::new(SnapshotSource::load(&cli.data)?);
    let collaborators = Collaborators::new(
        data.clone(),
        data.clone(),
        data,
        Arc::new(Notifier::from_env()),
    )
    .with_store(store);
    AlertEngine::new(config, collaborators).context("Failed to build alert engine")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    match &cli.command {
        Commands::Thresholds => {
            let config = EngineConfig::load(cli.config.as_deref())?;
            if cli.format == OutputFormat::Json {
                println!("{}", serde_json::to_string_pretty(&config.thresholds)?);
            } else {
                println!(
                    "{:<26} {:<8} {:<10} {:>8} {:>8} {:>8}  {}",
                    "KPI", "DIM", "VALUE", "LOW", "HIGH", "NORMAL", "PRIORITY"
                );
                for t in &config.thresholds {
                    println!(
                        "{:<26} {:<8} {:<10} {:>8.2} {:>8.2} {:>8}  {:?}{}",
                        t.kpi_name,
                        t.dimension.to_string(),
                        t.dimension_value.as_deref().unwrap_or("-"),
                        t.low_bound,
                        t.high_bound,
                        t.normal_value.map_or_else(|| "-".to_string(), |v| format!("{v:.2}")),
                        t.priority,
                        if t.enabled { "" } else { " (disabled)" }
                    );
                }
            }
        }
        Commands::Alerts { active } => {
            let store = load_store(&cli.state)?;
            let filter = if *active {
                AlertFilter::active()
            } else {
                AlertFilter::new()
            };
            let alerts = store.list(&filter).await?;
            if cli.format == OutputFormat::Json {
                println!("{}", serde_json::to_string_pretty(&alerts)?);
            } else {
                for a in &alerts {
                    println!(
                        "{}  {:<11} {:<8} {:<30} {}",
                        a.id,
                        a.lifecycle_state.as_str(),
                        a.severity.as_str(),
                        a.identity_key().to_string(),
                        a.title
                    );
                }
                let active_count = alerts.iter().filter(|a| a.is_active()).count();
                println!("{} alerts ({active_count} active)", alerts.len());
            }
        }
        Commands::Force { cadence } => {
            let store = load_store(&cli.state)?;
            let engine = Arc::new(build_engine(&cli, store.clone())?);
            let scheduler = Scheduler::new(engine.clone(), engine.config().schedule.clone());
            let result = scheduler.force_run(*cadence).await;
            save_store(&store, &cli.state)?;
            let report = result?;
            if cli.format == OutputFormat::Json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!(
                    "{}: {} created, {} refreshed, {} escalated, {} auto-resolved, {} notifications sent ({} failed)",
                    report.cadence,
                    report.created,
                    report.refreshed,
                    report.escalated,
                    report.auto_resolved,
                    report.notifications_sent,
                    report.notifications_failed
                );
                for e in &report.errors {
                    println!("  error: {e}");
                }
            }
        }
        Commands::Run => {
            let store = load_store(&cli.state)?;
            let engine = Arc::new(build_engine(&cli, store.clone())?);
            let scheduler = Arc::new(Scheduler::new(
                engine.clone(),
                engine.config().schedule.clone(),
            ));
            let cancel = scheduler.cancellation_token();
            let mut handle = tokio::spawn(scheduler.clone().run());

            tokio::select! {
                () = async { tokio::signal::ctrl_c().await.ok(); } => {
                    info!("Received SIGINT, waiting for running cycles");
                    cancel.cancel();
                    if let Err(e) = (&mut handle).await {
                        warn!(error = %e, "Scheduler task panicked");
                    }
                }
                result = &mut handle => {
                    if let Err(e) = result {
                        warn!(error = %e, "Scheduler task panicked");
                    }
                }
            }
            for (cadence, status) in scheduler.status() {
                info!(
                    cadence = %cadence,
                    runs = status.runs,
                    failures = status.failures,
                    last_error = status.last_error.as_deref().unwrap_or("-"),
                    "Cadence status at shutdown"
                );
            }
            save_store(&store, &cli.state)?;
        }
    }

    Ok(())
}

//! Healer CLI
//!
//! Runs the self-healing engine against AWS or an in-process simulated
//! cloud: one-shot invocations from an event payload, plan previews,
//! record inspection and reset, and a scheduled drift-check loop.

use std::collections::BTreeMap;
use std::io::Read as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use healer::{
    Engine, FileStore, HealerConfig, InvocationReport, InvocationStatus, MetadataStore,
    ResourceTagStore, TriggerEvent,
};
use healer_cloud::aws::Aws;
use healer_cloud::memory::SimulatedCloud;
use healer_cloud::{AttributeValue, CloudProvider, ResourceDescription, ResourceKind};
use healer_notify::Notifier;
use serde::Serialize;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Self-healing engine for compute and database instances
#[derive(Parser)]
#[command(name = "healer")]
#[command(about = "Self-healing engine for compute and database instances")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the JSON configuration file
    #[arg(long, env = "HEALER_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Cloud backend
    #[arg(long, value_enum, default_value = "aws", global = true)]
    provider: ProviderKind,

    /// Keep healing metadata in this JSON file instead of resource tags
    #[arg(long, env = "HEALER_STATE_FILE", global = true)]
    state_file: Option<PathBuf>,

    /// Output format (json or text)
    #[arg(long, value_enum, default_value = "json", global = true)]
    format: OutputFormat,

    /// Log format (text or json)
    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum ProviderKind {
    Aws,
    Simulated,
}

#[derive(Clone, Copy, Default, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Json,
    Text,
}

#[derive(Clone, Copy, Default, clap::ValueEnum)]
enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Handle one event payload (file, or stdin when omitted)
    Invoke {
        /// Path to the event JSON
        #[arg(long)]
        event: Option<PathBuf>,
    },
    /// Show what the engine would do, without acting
    Plan {
        /// Path to the event JSON
        #[arg(long, conflicts_with = "resource_id")]
        event: Option<PathBuf>,

        /// Preview a scheduled drift check for this resource
        #[arg(long)]
        resource_id: Option<String>,
    },
    /// Print the healing record of a resource
    Status {
        #[arg(long)]
        resource_id: String,
    },
    /// Clear the healing record so healing can resume
    Reset {
        #[arg(long)]
        resource_id: String,
    },
    /// Run scheduled drift checks for every configured resource until interrupted
    Watch {
        /// Seconds between checks (defaults to the configured drift interval)
        #[arg(long)]
        interval: Option<u64>,
    },
}

fn init_tracing(verbose: bool, format: LogFormat) {
    let default = if verbose { "healer=debug" } else { "healer=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_format);

    let config = HealerConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    let engine = build_engine(&cli, config)?;

    match cli.command {
        Commands::Invoke { ref event } => {
            let payload = read_payload(event.as_deref())?;
            let report = engine.handle_payload(&payload).await?;
            print_report(cli.format, &report)?;
        }
        Commands::Plan {
            ref event,
            ref resource_id,
        } => {
            let event = match resource_id {
                Some(id) => TriggerEvent::ScheduledDriftCheck {
                    resource_id: id.clone(),
                },
                None => {
                    let payload = read_payload(event.as_deref())?;
                    let default_id = engine.config().default_resource_id.as_deref();
                    match healer::parse_event(&payload, default_id)? {
                        Some(event) => event,
                        None => {
                            println!("event requires no handling");
                            return Ok(());
                        }
                    }
                }
            };
            let preview = engine.preview(&event).await?;
            print_json(&preview)?;
        }
        Commands::Status { ref resource_id } => {
            let record = engine.status(resource_id).await?;
            print_json(&record)?;
        }
        Commands::Reset { ref resource_id } => {
            engine.reset(resource_id).await?;
            info!(resource_id, "Healing record cleared");
        }
        Commands::Watch { interval } => {
            let period = interval.map_or_else(|| engine.config().drift_check_interval(), Duration::from_secs);
            run_watch(&engine, cli.format, period).await?;
        }
    }

    Ok(())
}

fn build_engine(cli: &Cli, config: HealerConfig) -> Result<Engine> {
    let provider: Arc<dyn CloudProvider> = match cli.provider {
        ProviderKind::Aws => {
            let mut aws = Aws::new(config.aws.region.clone())?;
            if let Some(endpoint) = &config.aws.endpoint {
                aws = aws.with_endpoint(endpoint.clone());
            }
            Arc::new(aws)
        }
        ProviderKind::Simulated => Arc::new(seed_simulated(&config)),
    };

    let store: Arc<dyn MetadataStore> = match &cli.state_file {
        Some(path) => Arc::new(FileStore::new(path.clone())),
        None => Arc::new(ResourceTagStore::new(provider.clone()).with_retry(config.retry.clone())),
    };

    let notifier = Notifier::from_env();
    if !notifier.has_channels() {
        warn!("No notification channels configured; outcomes are only logged");
    }

    Ok(Engine::new(config, provider, store, notifier))
}

/// Simulated cloud holding every configured resource in its baseline state.
fn seed_simulated(config: &HealerConfig) -> SimulatedCloud {
    SimulatedCloud::from_descriptions(config.resources.iter().map(|baseline| {
        let (status, arn) = match baseline.resource_kind {
            ResourceKind::Compute => ("running", None),
            ResourceKind::Database => (
                "available",
                Some(format!("arn:sim:rds:local:000000000000:db:{}", baseline.resource_id)),
            ),
        };
        ResourceDescription {
            id: baseline.resource_id.clone(),
            kind: baseline.resource_kind,
            status: status.to_string(),
            attributes: baseline.desired_state.clone(),
            tags: BTreeMap::new(),
            arn,
        }
    }))
}

fn read_payload(path: Option<&Path>) -> Result<serde_json::Value> {
    let content = match path {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read event file {}", path.display()))?,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("failed to read event from stdin")?;
            buf
        }
    };
    serde_json::from_str(&content).context("event is not valid JSON")
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_report(format: OutputFormat, report: &InvocationReport) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string(report)?),
        OutputFormat::Text => {
            let status = match report.status {
                InvocationStatus::Healed => "healed".green(),
                InvocationStatus::NoAction => "no_action".normal(),
                InvocationStatus::Skipped => "skipped".yellow(),
                InvocationStatus::Failed => "failed".red(),
                InvocationStatus::GivenUp => "given_up".red().bold(),
                InvocationStatus::NotFound => "not_found".magenta(),
            };
            let action = report.action.map_or("-", |a| a.as_str());
            println!(
                "{} {} action={} attempts={} {}",
                report.resource_id.bold(),
                status,
                action,
                report.attempt_count,
                report.detail.dimmed()
            );
        }
    }
    Ok(())
}

/// Drift-check every configured resource on a fixed period until Ctrl-C.
async fn run_watch(engine: &Engine, format: OutputFormat, period: Duration) -> Result<()> {
    let mut targets: Vec<String> = engine
        .config()
        .resources
        .iter()
        .map(|r| r.resource_id.clone())
        .collect();
    if targets.is_empty() {
        targets.extend(engine.config().default_resource_id.clone());
    }
    anyhow::ensure!(!targets.is_empty(), "no resources configured to watch");

    info!(resources = targets.len(), period_secs = period.as_secs(), "Starting drift watch");
    let mut ticker = tokio::time::interval(period.max(Duration::from_secs(1)));

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for resource_id in &targets {
                    let event = TriggerEvent::ScheduledDriftCheck { resource_id: resource_id.clone() };
                    match engine.handle(&event).await {
                        Ok(report) => print_report(format, &report)?,
                        Err(e) => error!(resource_id, error = %e, "Drift check failed"),
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, stopping watch");
                return Ok(());
            }
        }
    }
}

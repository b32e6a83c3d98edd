//! devpulse: health checks for the services of a local dev project.
//!
//! Assembles the registry (redb), the manifest, and the health engine:
//! - `check` runs one cycle and prints the report
//! - `watch` re-checks on an interval until Ctrl-C
//!
//! # Usage
//!
//! ```text
//! devpulse check --service api,web --output json
//! devpulse watch --interval 10s
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use devpulse_core::parse_duration;
use devpulse_health::{
    BreakerSettings, CheckerConfig, HealthChecker, HealthMonitor, HealthStatus, LogDirectory, MonitorConfig,
};
use devpulse_state::StateStore;

mod output;

use output::OutputFormat;

/// Registry location, relative to the project directory.
const REGISTRY_PATH: &str = ".devpulse/registry.redb";

#[derive(Parser)]
#[command(
    name = "devpulse",
    about = "Health checks for local development services",
    version,
    propagate_version = true
)]
struct Cli {
    /// Log output format (logs go to stderr).
    #[arg(long, global = true, value_enum, default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run one health check cycle and print the report.
    ///
    /// Exits with status 1 when the project is unhealthy.
    Check {
        #[command(flatten)]
        opts: CheckOpts,
    },
    /// Check repeatedly until interrupted.
    Watch {
        /// Time between cycles.
        #[arg(long, default_value = "5s", value_parser = parse_duration)]
        interval: Duration,

        #[command(flatten)]
        opts: CheckOpts,
    },
}

#[derive(Args)]
struct CheckOpts {
    /// Only check these services (comma separated).
    #[arg(long, value_delimiter = ',')]
    service: Vec<String>,

    /// Report format.
    #[arg(long, value_enum, default_value = "text")]
    output: OutputFormat,

    /// Project directory holding devpulse.yaml and .devpulse/.
    #[arg(long, default_value = ".")]
    project_dir: PathBuf,

    /// Path probed first during HTTP discovery.
    #[arg(long, default_value = "/health")]
    endpoint: String,

    /// Per-check HTTP timeout.
    #[arg(long, default_value = "5s", value_parser = parse_duration)]
    timeout: Duration,

    /// Reuse reports for this long (0s disables).
    #[arg(long, default_value = "0s", value_parser = parse_duration)]
    cache_ttl: Duration,

    /// Startup grace period for services without a start_period.
    #[arg(long, default_value = "30s", value_parser = parse_duration)]
    grace_period: Duration,

    /// Disable per-service circuit breakers.
    #[arg(long)]
    no_circuit_breaker: bool,

    /// Checks per second per service (0 disables limiting).
    #[arg(long, default_value = "10")]
    rate_limit: u32,

    /// Maximum checks in flight.
    #[arg(long, default_value = "10")]
    concurrency: usize,
}

impl CheckOpts {
    fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            project_dir: self.project_dir.clone(),
            max_concurrent_checks: self.concurrency,
            cache_ttl: self.cache_ttl,
            checker: CheckerConfig {
                default_endpoint: self.endpoint.clone(),
                timeout: self.timeout,
                startup_grace_period: self.grace_period,
                circuit_breaker: (!self.no_circuit_breaker).then(BreakerSettings::default),
                rate_limit: self.rate_limit,
                ..CheckerConfig::default()
            },
            ..MonitorConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format)?;

    match cli.command {
        Command::Check { opts } => {
            let healthy = run_check(&opts).await?;
            if !healthy {
                std::process::exit(1);
            }
            Ok(())
        }
        Command::Watch { interval, opts } => run_watch(interval, &opts).await,
    }
}

fn init_tracing(format: LogFormat) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new("info,devpulse=debug"))?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
    Ok(())
}

fn open_registry(project_dir: &std::path::Path) -> anyhow::Result<StateStore> {
    let path = project_dir.join(REGISTRY_PATH);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let store = StateStore::open(&path)?;
    info!(path = ?path, "registry opened");
    Ok(store)
}

fn build_monitor(opts: &CheckOpts, store: &StateStore) -> anyhow::Result<HealthMonitor> {
    let config = opts.monitor_config();
    let checker = HealthChecker::new(config.checker.clone())?
        .with_log_source(Arc::new(LogDirectory::for_project(&opts.project_dir)));
    Ok(HealthMonitor::with_checker(config, Arc::new(store.clone()), checker))
}

/// One cycle. Returns false when the project is unhealthy.
async fn run_check(opts: &CheckOpts) -> anyhow::Result<bool> {
    let store = open_registry(&opts.project_dir)?;
    let monitor = build_monitor(opts, &store)?;

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let report = monitor.check(&cancel, &opts.service).await;
    println!("{}", output::render(&report, opts.output)?);
    Ok(report.summary.overall != HealthStatus::Unhealthy)
}

async fn run_watch(interval: Duration, opts: &CheckOpts) -> anyhow::Result<()> {
    let store = open_registry(&opts.project_dir)?;
    let monitor = Arc::new(build_monitor(opts, &store)?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (report_tx, mut report_rx) = mpsc::channel(4);

    // Registry transitions, including the ones reconciliation writes.
    let mut changes = store.subscribe();
    let mut change_shutdown = shutdown_rx.clone();
    let changes_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                change = changes.recv() => match change {
                    Ok(change) => info!(service = %change.name, from = %change.from, to = %change.to, "status changed"),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => warn!(skipped = n, "status subscriber lagged"),
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
                _ = change_shutdown.changed() => break,
            }
        }
    });

    let filter = opts.service.clone();
    let monitor_handle = {
        let monitor = monitor.clone();
        tokio::spawn(async move {
            monitor.run(interval, filter, shutdown_rx, report_tx).await;
        })
    };

    loop {
        tokio::select! {
            report = report_rx.recv() => {
                let Some(report) = report else { break };
                println!("{}", output::render(&report, opts.output)?);
            }
            signal = tokio::signal::ctrl_c() => {
                signal?;
                info!("shutdown signal received");
                break;
            }
        }
    }

    let _ = shutdown_tx.send(true);
    let _ = monitor_handle.await;
    let _ = changes_handle.await;
    info!("devpulse watch stopped");
    Ok(())
}

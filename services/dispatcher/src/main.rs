//! devicepool dispatcher
//!
//! Watches the Taskcluster queue and the LambdaTest private cloud and starts
//! HyperExecute jobs on idle devices when work is waiting.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use devicepool_dispatcher::client::{LambdaTestClient, TaskclusterClient};
use devicepool_dispatcher::config::{process_env, Config, PoolConfig};
use devicepool_dispatcher::launcher::{DryRunLauncher, HyperexecuteLauncher, JobLauncher};
use devicepool_dispatcher::orchestrator::Orchestrator;
use devicepool_dispatcher::shutdown;

/// Launch device farm jobs to match CI queue demand.
#[derive(Debug, Parser)]
#[command(name = "devicepool")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// What to do.
    #[arg(value_enum)]
    action: Action,

    /// Render manifests and log launches without starting any process.
    #[arg(long)]
    debug: bool,

    /// Use placeholder secrets so the configuration loads without them.
    #[arg(long)]
    ci_mode: bool,

    /// Log level used when RUST_LOG is not set.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Json)]
    log_format: LogFormat,

    /// Omit timestamps from log lines.
    #[arg(long)]
    disable_logging_timestamps: bool,

    /// Project and device-group configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Action {
    /// Run the dispatcher until terminated.
    StartTestRunManager,
    /// Load and validate the configuration, then exit.
    ValidateConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

fn init_tracing(cli: &Cli) {
    let fmt_layer = match (cli.log_format, cli.disable_logging_timestamps) {
        (LogFormat::Json, false) => tracing_subscriber::fmt::layer().json().boxed(),
        (LogFormat::Json, true) => tracing_subscriber::fmt::layer().json().without_time().boxed(),
        (LogFormat::Text, false) => tracing_subscriber::fmt::layer().boxed(),
        (LogFormat::Text, true) => tracing_subscriber::fmt::layer().without_time().boxed(),
    };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    if let Err(e) = run(cli).await {
        error!(error = %format!("{e:#}"), "Dispatcher failed");
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }

    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = Config::from_env().context("invalid runtime configuration")?;
    if let Some(path) = cli.config.clone() {
        config.config_path = path;
    }

    let pool = PoolConfig::load(&config.config_path, &process_env, cli.ci_mode)
        .with_context(|| format!("failed to load {}", config.config_path.display()))?;

    info!(
        config_path = %config.config_path.display(),
        projects = ?pool.projects().iter().map(|p| p.name.as_str()).collect::<Vec<_>>(),
        unconfigured = ?pool.unconfigured_projects(),
        devices = pool.total_device_count(),
        contract_device_count = ?pool.contract_device_count(),
        "Configuration loaded"
    );

    if cli.action == Action::ValidateConfig {
        info!("Configuration is valid");
        return Ok(());
    }

    if pool.projects().is_empty() {
        warn!("No fully configured projects, nothing will be dispatched");
    }

    info!(
        queue_monitor_interval_secs = config.queue_monitor_interval.as_secs(),
        device_monitor_interval_secs = config.device_monitor_interval.as_secs(),
        job_starter_interval_secs = config.job_starter_interval.as_secs(),
        max_jobs_per_cycle = config.limits.max_per_cycle,
        global_max_initiated_jobs = config.limits.global_max_initiated,
        job_expiry_secs = config.job_expiry.as_secs(),
        job_dir_max_age_secs = config.job_dir_max_age.as_secs(),
        dry_run = cli.debug,
        "Starting devicepool dispatcher"
    );

    let queue = Arc::new(TaskclusterClient::new(
        config.tc_root_url.clone(),
        config.tc_provisioner.clone(),
    )?);
    let farm = Arc::new(LambdaTestClient::new(
        config.lt_api_url.clone(),
        config.he_api_url.clone(),
        pool.farm_credentials(),
    )?);
    let launcher: Arc<dyn JobLauncher> = if cli.debug {
        Arc::new(DryRunLauncher::new())
    } else {
        Arc::new(HyperexecuteLauncher::new(
            config.hyperexecute_bin.clone(),
            pool.farm_credentials().clone(),
        ))
    };

    let orchestrator = Orchestrator::new(config, pool, queue, farm, launcher);

    let signals = tokio::spawn({
        let handle = orchestrator.shutdown_handle();
        async move {
            if let Err(e) = shutdown::listen_for_signals(handle).await {
                error!(error = %e, "Failed to install signal handlers");
            }
        }
    });
    let summary = orchestrator.run().await;
    signals.abort();

    if !summary.stragglers.is_empty() {
        warn!(stragglers = ?summary.stragglers, "Some workers did not stop in time");
    }
    if !summary.exited_early.is_empty() {
        anyhow::bail!(
            "workers stopped before shutdown: {}",
            summary.exited_early.join(", ")
        );
    }
    info!("devicepool dispatcher shutdown complete");
    Ok(())
}

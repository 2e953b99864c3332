//! Disaster recovery - command line entry point
//!
//! Restores every data service from its artifact in one confirmed run, with
//! workload shutdown and health verification around the restores.

use backup_core::drivers::Toolbox;
use backup_core::notify::Notifier;
use backup_core::restore::confirm::StdinConfirmer;
use backup_core::{utils, Config, ServiceKind};
use clap::Parser;
use dr_orchestrator::models::run::DrOptions;
use dr_orchestrator::services::orchestrator::DisasterRecovery;
use dr_orchestrator::services::probe::TcpProbe;
use dr_orchestrator::services::restorer::DriverRestorer;
use dr_orchestrator::services::workloads::KubectlController;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about = "Restore every platform data service in sequence", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// PostgreSQL artifact (newest when omitted)
    #[arg(long, value_name = "FILE")]
    postgres_backup: Option<PathBuf>,

    /// InfluxDB artifact (newest when omitted)
    #[arg(long, value_name = "FILE")]
    influxdb_backup: Option<PathBuf>,

    /// Redis artifact (newest when omitted)
    #[arg(long, value_name = "FILE")]
    redis_backup: Option<PathBuf>,

    /// Skip the confirmation prompt
    #[arg(long)]
    force: bool,

    /// Validate and report without mutating anything
    #[arg(long)]
    dry_run: bool,

    /// Restore into isolated test targets
    #[arg(long)]
    test: bool,

    /// Leave workloads running
    #[arg(long)]
    skip_services: bool,

    /// Skip artifact integrity checks
    #[arg(long)]
    skip_verify: bool,

    /// Per-restore timeout in seconds (defaults to the configured phase timeout)
    #[arg(long)]
    timeout: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let _ = dotenvy::dotenv();
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    config.apply_env_overrides(|key| std::env::var(key).ok());
    config.validate()?;

    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level, &config.log.format)?;
    tracing::info!("disaster-recovery v{}", env!("CARGO_PKG_VERSION"));

    let artifacts: HashMap<ServiceKind, PathBuf> = [
        (ServiceKind::Postgres, args.postgres_backup),
        (ServiceKind::TimeSeries, args.influxdb_backup),
        (ServiceKind::KeyValue, args.redis_backup),
    ]
    .into_iter()
    .filter_map(|(kind, path)| path.map(|p| (kind, p)))
    .collect();

    let options = DrOptions {
        force: args.force,
        dry_run: args.dry_run,
        test: args.test,
        skip_services: args.skip_services,
        skip_verify: args.skip_verify,
        timeout_secs: args.timeout.unwrap_or(config.disaster_recovery.phase_timeout_secs),
        artifacts,
    };

    let notifier = Notifier::new(&config.notification, &config.storage);
    let tools = Toolbox::system(&config);
    let restorer = DriverRestorer::new(config.clone(), notifier.clone(), tools.clone());
    let workloads = KubectlController::new(tools.runner.clone(), Duration::from_secs(60));
    let probe = TcpProbe::from_config(&config);
    let confirmer = StdinConfirmer;

    let run = DisasterRecovery::new(&config, &notifier, &confirmer, &restorer, &workloads, &probe)
        .run(options)
        .await?;

    println!("{}", dr_orchestrator::services::orchestrator::summary(&run));
    for phase in &run.phases {
        println!(
            "  {:<16} {:?}{}",
            phase.phase.name(),
            phase.status,
            phase
                .detail
                .as_deref()
                .map(|d| format!("  {}", d))
                .unwrap_or_default()
        );
    }
    println!("Status: {}", run.status_path().display());
    std::process::exit(run.status.exit_code());
}

//! Platform backup - command line entry point
//!
//! One invocation runs one backup, restore, verification, rotation or audit
//! and exits; scheduling is external.

use anyhow::{Context, Result};
use backup_core::drivers::{driver_for, Toolbox};
use backup_core::executor::BackupExecutor;
use backup_core::notify::Notifier;
use backup_core::remote::RemoteSync;
use backup_core::restore::confirm::StdinConfirmer;
use backup_core::restore::session::RestoreMode;
use backup_core::restore::{RestoreRequest, RestoreRunner};
use backup_core::retention::{self, RetentionPolicy};
use backup_core::utils::format::format_bytes;
use backup_core::{audit, layout, utils, verify, Config, ServiceKind};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Back up one service
    Backup { service: ServiceKind },

    /// Restore one service from an artifact (newest when omitted)
    Restore {
        service: ServiceKind,
        #[arg(value_name = "BACKUP_FILE")]
        backup_file: Option<PathBuf>,
        /// Skip the confirmation prompt
        #[arg(long)]
        force: bool,
        /// Restore into the isolated test target
        #[arg(long)]
        test: bool,
        /// Validate and report without mutating the target
        #[arg(long)]
        dry_run: bool,
        /// Skip integrity and structure checks
        #[arg(long)]
        skip_verify: bool,
        /// Import timeout in seconds
        #[arg(long, default_value_t = 3600)]
        timeout: u64,
    },

    /// Check an artifact end to end without restoring it
    Verify {
        service: ServiceKind,
        #[arg(value_name = "BACKUP_FILE")]
        backup_file: Option<PathBuf>,
    },

    /// Apply the retention policy to one service
    Rotate { service: ServiceKind },

    /// Audit freshness, size and storage capacity of all backups
    Audit,

    /// List stored artifacts of one service
    List { service: ServiceKind },
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    let _ = dotenvy::dotenv();
    let mut config = match path {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => Config::default(),
    };
    config.apply_env_overrides(|key| std::env::var(key).ok());
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(args.config.as_ref())?;

    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level, &config.log.format)?;

    tracing::debug!("platform-backup v{}", env!("CARGO_PKG_VERSION"));

    let code = run(args.command, &config).await?;
    std::process::exit(code);
}

async fn run(command: Command, config: &Config) -> Result<i32> {
    let notifier = Notifier::new(&config.notification, &config.storage);
    let tools = Toolbox::system(config);

    match command {
        Command::Backup { service } => {
            let driver = driver_for(service, config, &tools);
            let remote = RemoteSync::new(config.remote.clone(), tools.runner.clone());
            let result = BackupExecutor::new(config, &notifier, remote)
                .run(driver.as_ref())
                .await;
            println!("{}", result.summary());
            Ok(if result.succeeded() { 0 } else { 1 })
        }
        Command::Restore {
            service,
            backup_file,
            force,
            test,
            dry_run,
            skip_verify,
            timeout,
        } => {
            let driver = driver_for(service, config, &tools);
            let request = RestoreRequest {
                artifact: backup_file,
                mode: RestoreMode {
                    force,
                    test,
                    dry_run,
                    skip_verify,
                },
                timeout: Duration::from_secs(timeout),
            };
            let confirmer = StdinConfirmer;
            let session = RestoreRunner::new(config, &notifier, &confirmer)
                .run(driver.as_ref(), &request)
                .await?;
            println!("{}", backup_core::restore::summary(&session));
            for action in &session.planned_actions {
                println!("  {}", action);
            }
            println!("Status: {}", session.status_path().display());
            Ok(session.status.exit_code())
        }
        Command::Verify {
            service,
            backup_file,
        } => {
            let driver = driver_for(service, config, &tools);
            let report = verify::verify_backup(config, driver.as_ref(), backup_file.as_deref()).await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(report.exit_code())
        }
        Command::Rotate { service } => {
            let policy = RetentionPolicy::from(&config.retention);
            let report = retention::rotate(
                &config.service_dir(service),
                service,
                &policy,
                chrono::Local::now(),
            )?;
            println!(
                "{}: deleted {}, kept {}, freed {}",
                service,
                report.deleted.len(),
                report.kept,
                format_bytes(report.freed_bytes)
            );
            Ok(0)
        }
        Command::Audit => {
            let report = audit::run_audit(config, &notifier).await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(report.exit_code())
        }
        Command::List { service } => {
            let artifacts = layout::list_artifacts(&config.service_dir(service), service)?;
            if artifacts.is_empty() {
                println!("No {} backups in {}", service, config.service_dir(service).display());
            }
            for artifact in artifacts {
                println!(
                    "{:<8} {}  {:>10}  {}{}",
                    artifact.class.name(),
                    artifact.modified.format("%Y-%m-%d %H:%M:%S"),
                    format_bytes(artifact.size),
                    artifact.path.display(),
                    if artifact.has_sidecar { "" } else { "  (no manifest)" }
                );
            }
            Ok(0)
        }
    }
}

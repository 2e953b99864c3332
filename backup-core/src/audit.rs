//! Backup-health audit: freshness, size and storage capacity of what is
//! already on disk, independent of any backup run.

use crate::config::Config;
use crate::executor::manifest::SidecarManifest;
use crate::layout;
use crate::notify::{Notifier, NotifyStatus};
use crate::service::ServiceKind;
use crate::utils::format::format_bytes;
use crate::utils::Result;
use chrono::{DateTime, Local};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const REPORT_FILE: &str = "health_report.json";

#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealth {
    pub service: ServiceKind,
    pub latest: Option<PathBuf>,
    pub age_hours: Option<f64>,
    pub size: Option<u64>,
    pub sidecar_valid: bool,
    pub alerts: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StorageUsage {
    pub path: PathBuf,
    pub total_bytes: u64,
    pub available_bytes: u64,
    pub used_percent: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub checked_at: DateTime<Local>,
    pub healthy: bool,
    pub services: Vec<ServiceHealth>,
    pub storage: Option<StorageUsage>,
    pub alerts: Vec<String>,
}

impl HealthReport {
    pub fn exit_code(&self) -> i32 {
        if self.healthy {
            0
        } else {
            1
        }
    }
}

/// Filesystem usage of the volume holding `path`, computed like `df`.
pub fn storage_usage(path: &Path) -> Result<StorageUsage> {
    let stat = nix::sys::statvfs::statvfs(path).map_err(std::io::Error::from)?;
    let fragment = stat.fragment_size() as u64;
    let blocks = stat.blocks() as u64;
    let free = stat.blocks_free() as u64;
    let available = stat.blocks_available() as u64;

    let used = blocks.saturating_sub(free);
    let usable = used + available;
    let used_percent = if usable == 0 {
        0.0
    } else {
        used as f64 * 100.0 / usable as f64
    };
    Ok(StorageUsage {
        path: path.to_path_buf(),
        total_bytes: blocks * fragment,
        available_bytes: available * fragment,
        used_percent,
    })
}

fn check_service(config: &Config, kind: ServiceKind, now: DateTime<Local>) -> ServiceHealth {
    let mut health = ServiceHealth {
        service: kind,
        latest: None,
        age_hours: None,
        size: None,
        sidecar_valid: false,
        alerts: Vec::new(),
    };

    let latest = match layout::find_latest(&config.service_dir(kind), kind) {
        Ok(latest) => latest,
        Err(_) => {
            health.alerts.push(format!("{}: no backup found", kind));
            return health;
        }
    };

    let age_hours = latest.age(now).num_seconds() as f64 / 3600.0;
    if age_hours > config.audit.max_age_hours as f64 {
        health.alerts.push(format!(
            "{}: latest backup is {:.1}h old (limit {}h)",
            kind, age_hours, config.audit.max_age_hours
        ));
    }

    let min_size = config.min_size_bytes(kind);
    if latest.size < min_size {
        health.alerts.push(format!(
            "{}: latest backup is {} (minimum {})",
            kind,
            format_bytes(latest.size),
            format_bytes(min_size)
        ));
    }

    let sidecar = layout::sidecar_path(&latest.path);
    match SidecarManifest::read(&sidecar) {
        Ok(_) => health.sidecar_valid = true,
        Err(e) => health.alerts.push(format!("{}: manifest unreadable: {}", kind, e)),
    }

    health.latest = Some(latest.path);
    health.age_hours = Some(age_hours);
    health.size = Some(latest.size);
    health
}

/// Inspect every service, write the report next to the artifacts and notify
/// once.
pub async fn run_audit(config: &Config, notifier: &Notifier) -> HealthReport {
    let now = Local::now();
    let services: Vec<ServiceHealth> = ServiceKind::ALL
        .iter()
        .map(|&kind| check_service(config, kind, now))
        .collect();
    let mut alerts: Vec<String> = services.iter().flat_map(|s| s.alerts.clone()).collect();

    let storage = match storage_usage(&config.storage.base_dir) {
        Ok(usage) => {
            if usage.used_percent > config.audit.storage_alert_percent as f64 {
                alerts.push(format!(
                    "storage {:.1}% used on {} (limit {}%), {} available",
                    usage.used_percent,
                    usage.path.display(),
                    config.audit.storage_alert_percent,
                    format_bytes(usage.available_bytes)
                ));
            }
            Some(usage)
        }
        Err(e) => {
            alerts.push(format!(
                "storage usage of {} unavailable: {}",
                config.storage.base_dir.display(),
                e
            ));
            None
        }
    };

    let report = HealthReport {
        checked_at: now,
        healthy: alerts.is_empty(),
        services,
        storage,
        alerts,
    };

    for alert in &report.alerts {
        warn!("Backup health alert: {}", alert);
    }
    if let Err(e) = write_report(&config.storage.base_dir, &report) {
        warn!("Failed to write health report: {}", e);
    }

    if report.healthy {
        info!("All backups healthy");
        notifier
            .notify(NotifyStatus::Success, "backup-health", "All backups healthy")
            .await;
    } else {
        let message = report.alerts.join("; ");
        notifier
            .notify(NotifyStatus::Warning, "backup-health", &message)
            .await;
    }
    report
}

fn write_report(base_dir: &Path, report: &HealthReport) -> Result<()> {
    std::fs::create_dir_all(base_dir)?;
    std::fs::write(base_dir.join(REPORT_FILE), serde_json::to_vec_pretty(report)?)?;
    Ok(())
}

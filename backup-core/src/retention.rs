//! Retention classes, promotion and rotation.
//!
//! Promotion is decided from the wall-clock date of the backup run only. A run
//! missed on a Sunday or on the 1st is never promoted retroactively.

use crate::config::RetentionConfig;
use crate::layout::{self, ArtifactInfo};
use crate::service::ServiceKind;
use crate::utils::Result;
use chrono::{DateTime, Datelike, Local, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetentionClass {
    Daily,
    Weekly,
    Monthly,
}

impl RetentionClass {
    pub const ALL: [RetentionClass; 3] = [
        RetentionClass::Daily,
        RetentionClass::Weekly,
        RetentionClass::Monthly,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            RetentionClass::Daily => "daily",
            RetentionClass::Weekly => "weekly",
            RetentionClass::Monthly => "monthly",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub keep_daily: u32,
    pub keep_weekly: u32,
    pub keep_monthly: u32,
}

impl From<&RetentionConfig> for RetentionPolicy {
    fn from(config: &RetentionConfig) -> Self {
        Self {
            keep_daily: config.keep_daily,
            keep_weekly: config.keep_weekly,
            keep_monthly: config.keep_monthly,
        }
    }
}

impl RetentionPolicy {
    /// Maximum age in days: daily as configured, weeks x 7, months x 30.
    pub fn max_age_days(&self, class: RetentionClass) -> i64 {
        match class {
            RetentionClass::Daily => i64::from(self.keep_daily),
            RetentionClass::Weekly => i64::from(self.keep_weekly) * 7,
            RetentionClass::Monthly => i64::from(self.keep_monthly) * 30,
        }
    }

    fn is_expired(&self, artifact: &ArtifactInfo, now: DateTime<Local>) -> bool {
        artifact.age(now) > chrono::Duration::days(self.max_age_days(artifact.class))
    }
}

/// Classes an artifact created on `date` is promoted into.
pub fn promotion_classes(date: NaiveDate) -> Vec<RetentionClass> {
    let mut classes = Vec::new();
    if date.weekday() == Weekday::Sun {
        classes.push(RetentionClass::Weekly);
    }
    if date.day() == 1 {
        classes.push(RetentionClass::Monthly);
    }
    classes
}

/// Copy a daily artifact (and its sidecar manifest) into the weekly/monthly
/// directories when `date` matches their policy. Returns the created copies.
pub fn promote(service_dir: &Path, artifact: &Path, date: NaiveDate) -> Result<Vec<PathBuf>> {
    let mut created = Vec::new();
    let Some(file_name) = artifact.file_name() else {
        return Ok(created);
    };

    for class in promotion_classes(date) {
        let dir = layout::class_dir(service_dir, class);
        std::fs::create_dir_all(&dir)?;

        let dest = dir.join(file_name);
        copy_atomic(artifact, &dest)?;

        let sidecar = layout::sidecar_path(artifact);
        if sidecar.is_file() {
            copy_atomic(&sidecar, &layout::sidecar_path(&dest))?;
        }
        tracing::info!(class = class.name(), artifact = %dest.display(), "Promoted backup");
        created.push(dest);
    }
    Ok(created)
}

fn copy_atomic(src: &Path, dest: &Path) -> Result<()> {
    let tmp = dest.with_extension("partial");
    std::fs::copy(src, &tmp)?;
    std::fs::rename(&tmp, dest)?;
    Ok(())
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct RotationReport {
    pub deleted: Vec<PathBuf>,
    pub kept: usize,
    pub freed_bytes: u64,
}

/// Delete artifacts older than their class's maximum age, together with their
/// sidecars. A `latest` pointer left dangling is removed. Running twice with
/// the same inputs deletes nothing the second time.
pub fn rotate(
    service_dir: &Path,
    kind: ServiceKind,
    policy: &RetentionPolicy,
    now: DateTime<Local>,
) -> Result<RotationReport> {
    let mut report = RotationReport::default();

    for class in RetentionClass::ALL {
        let artifacts = layout::list_class(service_dir, kind, class)?;
        for artifact in &artifacts {
            if !policy.is_expired(artifact, now) {
                report.kept += 1;
                continue;
            }

            std::fs::remove_file(&artifact.path)?;
            let sidecar = layout::sidecar_path(&artifact.path);
            if sidecar.is_file() {
                std::fs::remove_file(&sidecar)?;
            }
            tracing::info!(
                service = %kind,
                class = class.name(),
                artifact = %artifact.path.display(),
                "Deleted expired backup"
            );
            report.freed_bytes += artifact.size;
            report.deleted.push(artifact.path.clone());
        }
    }

    let latest = service_dir.join(layout::latest_name());
    if latest.symlink_metadata().is_ok() && !latest.exists() {
        std::fs::remove_file(&latest)?;
        tracing::warn!(service = %kind, "Removed latest pointer to an expired backup");
    }

    tracing::info!(
        service = %kind,
        deleted = report.deleted.len(),
        kept = report.kept,
        "Retention rotation finished"
    );
    Ok(report)
}

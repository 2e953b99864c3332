//! Read-only verification of a stored artifact.

use crate::config::Config;
use crate::crypto::ArtifactCipher;
use crate::drivers::BackupDriver;
use crate::executor::blocking;
use crate::executor::manifest::Manifest;
use crate::fs::archive;
use crate::layout;
use crate::restore::verify_artifact;
use crate::service::ServiceKind;
use crate::utils::Result;
use chrono::{DateTime, Local};
use serde::Serialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub check: String,
    pub passed: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerificationReport {
    pub service: ServiceKind,
    pub artifact: Option<PathBuf>,
    pub verified_at: DateTime<Local>,
    pub passed: bool,
    pub checks: Vec<CheckResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest: Option<Manifest>,
}

impl VerificationReport {
    fn new(service: ServiceKind) -> Self {
        Self {
            service,
            artifact: None,
            verified_at: Local::now(),
            passed: false,
            checks: Vec::new(),
            manifest: None,
        }
    }

    /// Record a check outcome; returns whether it passed.
    fn record<T>(&mut self, check: &str, outcome: &Result<T>, detail: impl FnOnce(&T) -> String) -> bool {
        let (passed, detail) = match outcome {
            Ok(value) => (true, detail(value)),
            Err(e) => (false, e.to_string()),
        };
        if !passed {
            tracing::warn!(service = %self.service, check, "Verification check failed: {}", detail);
        }
        self.checks.push(CheckResult {
            check: check.to_string(),
            passed,
            detail,
        });
        passed
    }

    pub fn exit_code(&self) -> i32 {
        if self.passed {
            0
        } else {
            1
        }
    }
}

/// Run every check against `artifact` (or the latest one) without touching
/// the artifact directory. Scratch data lives in a temporary directory.
pub async fn verify_backup<D: BackupDriver + ?Sized>(
    config: &Config,
    driver: &D,
    artifact: Option<&Path>,
) -> VerificationReport {
    let kind = driver.kind();
    let mut report = VerificationReport::new(kind);

    let located = layout::resolve_artifact(&config.service_dir(kind), kind, artifact);
    if !report.record("locate", &located, |p| p.display().to_string()) {
        return report;
    }
    let Ok(artifact) = located else {
        return report;
    };
    report.artifact = Some(artifact.clone());

    let integrity = verify_artifact(&artifact, config.min_size_bytes(kind));
    if !report.record("integrity", &integrity, String::clone) {
        return report;
    }

    let scratch = match tempfile::Builder::new()
        .prefix(&format!("verify_{}_", kind.name()))
        .tempdir_in(&config.storage.work_dir)
        .or_else(|_| tempfile::tempdir())
    {
        Ok(dir) => dir,
        Err(e) => {
            report.record::<()>("scratch", &Err(e.into()), |_| String::new());
            return report;
        }
    };

    let decrypted = scratch.path().join(format!("backup.{}", archive::ARCHIVE_EXTENSION));
    let decrypt = {
        let (src, dst) = (artifact.clone(), decrypted.clone());
        let key_file = config.encryption.key_file.clone();
        blocking(move || ArtifactCipher::from_key_file(&key_file)?.decrypt_file(&src, &dst)).await
    };
    if !report.record("decrypt", &decrypt, |n| format!("{} bytes", n)) {
        return report;
    }

    let staging = scratch.path().join("data");
    let unpacked = {
        let (src, dst) = (decrypted, staging.clone());
        blocking(move || archive::decompress(&src, &dst)).await
    };
    if !report.record("decompress", &unpacked, |_| "archive unpacked".to_string()) {
        return report;
    }

    let manifest = Manifest::read_from_dir(&staging).and_then(|m| {
        m.validate_for(kind)?;
        Ok(m)
    });
    if !report.record("manifest", &manifest, |m| {
        format!("{} {:?} backup, version {}", m.timestamp, m.backup_type, m.version)
    }) {
        return report;
    }
    let Ok(manifest) = manifest else {
        return report;
    };

    let structure = driver.check_structure(&staging, &manifest);
    let passed = report.record("structure", &structure, |_| "consistent".to_string());
    report.manifest = Some(manifest);
    report.passed = passed;
    report
}

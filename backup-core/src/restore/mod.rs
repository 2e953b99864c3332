//! Restore runner: locate, verify, unpack and import one service artifact.
//!
//! Destructive imports into production need either the typed confirmation
//! phrase or `force`. Dry runs execute every validation phase and record the
//! planned actions without touching the target. Test mode imports into the
//! driver's isolated target and never asks for confirmation.

pub mod confirm;
pub mod session;

use crate::config::Config;
use crate::crypto::ArtifactCipher;
use crate::drivers::{BackupDriver, RestoreDriver};
use crate::executor::blocking;
use crate::executor::manifest::{Manifest, SidecarManifest};
use crate::fs::{archive, integrity};
use crate::layout;
use crate::notify::{Notifier, NotifyStatus};
use crate::utils::format::format_bytes;
use crate::utils::{BackupError, Result};
use confirm::{restore_phrase, Confirmer};
use session::{RestoreMode, RestorePhase, RestoreSession, SessionStatus};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info, warn};

/// Default bound on the import phase
pub const DEFAULT_RESTORE_TIMEOUT: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone)]
pub struct RestoreRequest {
    /// Explicit artifact; the newest one is used when absent
    pub artifact: Option<PathBuf>,
    pub mode: RestoreMode,
    pub timeout: Duration,
}

impl RestoreRequest {
    pub fn latest(mode: RestoreMode) -> Self {
        Self {
            artifact: None,
            mode,
            timeout: DEFAULT_RESTORE_TIMEOUT,
        }
    }
}

/// Where a phase sequence stopped early.
struct Stop {
    status: SessionStatus,
    error: String,
}

impl Stop {
    fn failed(error: impl ToString) -> Self {
        Self {
            status: SessionStatus::Failed,
            error: error.to_string(),
        }
    }
}

pub struct RestoreRunner<'a> {
    config: &'a Config,
    notifier: &'a Notifier,
    confirmer: &'a dyn Confirmer,
}

impl<'a> RestoreRunner<'a> {
    pub fn new(config: &'a Config, notifier: &'a Notifier, confirmer: &'a dyn Confirmer) -> Self {
        Self {
            config,
            notifier,
            confirmer,
        }
    }

    /// Run a restore session to a terminal status. Only failing to create the
    /// session directory is returned as an error.
    pub async fn run<D>(&self, driver: &D, request: &RestoreRequest) -> Result<RestoreSession>
    where
        D: BackupDriver + RestoreDriver + ?Sized,
    {
        let kind = driver.kind();
        let mut session = RestoreSession::create(&self.config.storage.work_dir, kind, request.mode)?;
        info!(
            service = %kind,
            session = %session.dir().display(),
            test = request.mode.test,
            dry_run = request.mode.dry_run,
            "Starting restore"
        );

        match self.phases(driver, request, &mut session).await {
            Ok(status) => session.finish(status, None),
            Err(stop) => {
                error!(service = %kind, "Restore ended with {:?}: {}", stop.status, stop.error);
                session.finish(stop.status, Some(stop.error));
            }
        }

        // Decrypted data never outlives the session; status.json stays.
        let _ = std::fs::remove_dir_all(session.dir().join("data"));
        let _ = std::fs::remove_file(session.dir().join(decrypted_name()));

        let notify_status = match session.status {
            SessionStatus::Completed | SessionStatus::DryRunCompleted => NotifyStatus::Success,
            SessionStatus::Partial | SessionStatus::Cancelled => NotifyStatus::Warning,
            _ => NotifyStatus::Failure,
        };
        self.notifier
            .notify(notify_status, kind.name(), &summary(&session))
            .await;
        info!("{}", summary(&session));
        Ok(session)
    }

    async fn phases<D>(
        &self,
        driver: &D,
        request: &RestoreRequest,
        session: &mut RestoreSession,
    ) -> std::result::Result<SessionStatus, Stop>
    where
        D: BackupDriver + RestoreDriver + ?Sized,
    {
        let kind = driver.kind();
        let mode = request.mode;

        // locate
        session.begin(RestorePhase::Locate);
        let located = layout::resolve_artifact(
            &self.config.service_dir(kind),
            kind,
            request.artifact.as_deref(),
        )
        .and_then(|artifact| Ok((artifact, driver.load_credentials()?)));
        let (artifact, credentials) = match located {
            Ok(found) => found,
            Err(e) => return Err(fail(session, RestorePhase::Locate, e)),
        };
        session.artifact = Some(artifact.clone());
        session.complete(RestorePhase::Locate, Some(artifact.display().to_string()));

        // verify
        session.begin(RestorePhase::Verify);
        if mode.skip_verify {
            warn!(service = %kind, artifact = %artifact.display(), "Integrity verification skipped on request");
            session.skip(RestorePhase::Verify, "--skip-verify");
        } else {
            match verify_artifact(&artifact, self.config.min_size_bytes(kind)) {
                Ok(detail) => session.complete(RestorePhase::Verify, Some(detail)),
                Err(e) => return Err(fail(session, RestorePhase::Verify, e)),
            }
        }

        // decrypt
        session.begin(RestorePhase::Decrypt);
        let decrypted = session.dir().join(decrypted_name());
        let decrypt = {
            let (src, dst) = (artifact.clone(), decrypted.clone());
            let key_file = self.config.encryption.key_file.clone();
            blocking(move || ArtifactCipher::from_key_file(&key_file)?.decrypt_file(&src, &dst)).await
        };
        match decrypt {
            Ok(size) => session.complete(RestorePhase::Decrypt, Some(format_bytes(size))),
            Err(e) => return Err(fail(session, RestorePhase::Decrypt, e)),
        }

        // decompress
        session.begin(RestorePhase::Decompress);
        let staging = session.dir().join("data");
        let unpacked = {
            let (src, dst) = (decrypted.clone(), staging.clone());
            blocking(move || archive::decompress(&src, &dst)).await
        };
        if let Err(e) = unpacked {
            return Err(fail(session, RestorePhase::Decompress, e));
        }
        let _ = std::fs::remove_file(&decrypted);
        session.complete(RestorePhase::Decompress, None);

        // validate_manifest
        session.begin(RestorePhase::ValidateManifest);
        let manifest = match load_manifest(driver, &staging, mode.skip_verify) {
            Ok(manifest) => manifest,
            Err(e) => return Err(fail(session, RestorePhase::ValidateManifest, e)),
        };
        session.manifest_timestamp = Some(manifest.timestamp.clone());
        session.complete(
            RestorePhase::ValidateManifest,
            Some(format!("{:?} backup from {}", manifest.backup_type, manifest.timestamp)),
        );

        let target = driver.target(mode.test);
        session.planned_actions = driver.planned_actions(&manifest, &target);
        session.target = Some(target.clone());

        // confirm
        session.begin(RestorePhase::Confirm);
        if mode.dry_run {
            session.skip(RestorePhase::Confirm, "dry run");
        } else if mode.test {
            session.skip(RestorePhase::Confirm, "isolated test target");
        } else if mode.force {
            warn!(service = %kind, target = %target, "Destructive restore forced without confirmation");
            session.skip(RestorePhase::Confirm, "--force");
        } else {
            let details = vec![
                format!("Service:  {}", kind),
                format!("Artifact: {}", artifact.display()),
                format!("Backup:   {}", manifest.timestamp),
                format!("Target:   {}", target),
                "This will overwrite existing data in the target.".to_string(),
            ];
            if !self.confirmer.confirm(&details, &restore_phrase(kind.name())) {
                let e = BackupError::DestructiveActionNotConfirmed(format!("restore of {}", kind));
                session.fail(RestorePhase::Confirm, &e.to_string());
                return Err(Stop {
                    status: SessionStatus::Cancelled,
                    error: e.to_string(),
                });
            }
            session.complete(RestorePhase::Confirm, Some("confirmed".to_string()));
        }

        // import
        session.begin(RestorePhase::Import);
        if mode.dry_run {
            for action in &session.planned_actions {
                info!(service = %kind, "[dry-run] would run: {}", action);
            }
            session.skip(RestorePhase::Import, "dry run");
            return Ok(SessionStatus::DryRunCompleted);
        }

        let import = driver.import(&credentials, &staging, &manifest, &target);
        let report = match tokio::time::timeout(request.timeout, import).await {
            Ok(Ok(report)) => report,
            Ok(Err(e)) => return Err(fail(session, RestorePhase::Import, e)),
            Err(_) => {
                session.time_out(RestorePhase::Import, request.timeout.as_secs());
                let e = BackupError::PhaseTimeout {
                    phase: "import".into(),
                    seconds: request.timeout.as_secs(),
                };
                return Err(Stop {
                    status: SessionStatus::Timeout,
                    error: e.to_string(),
                });
            }
        };

        session.record_units(&report);
        let detail = Some(format!("{} restored, {} failed", report.succeeded, report.failed));
        if report.is_clean() {
            session.complete(RestorePhase::Import, detail);
            Ok(SessionStatus::Completed)
        } else if report.succeeded > 0 {
            session.complete(RestorePhase::Import, detail);
            let e = BackupError::PartialUnitFailure {
                failed: report.failed,
                total: report.total(),
            };
            Err(Stop {
                status: SessionStatus::Partial,
                error: e.to_string(),
            })
        } else {
            session.fail(RestorePhase::Import, detail.as_deref().unwrap_or_default());
            Err(Stop::failed(format!("every unit failed to restore ({})", report.failed)))
        }
    }
}

fn decrypted_name() -> String {
    format!("backup.{}", archive::ARCHIVE_EXTENSION)
}

fn fail(session: &mut RestoreSession, phase: RestorePhase, error: BackupError) -> Stop {
    session.fail(phase, &error.to_string());
    Stop::failed(error)
}

/// Integrity check plus checksum comparison against the sidecar manifest.
pub fn verify_artifact(artifact: &Path, min_size: u64) -> Result<String> {
    integrity::verify_integrity(artifact, min_size)?;
    let sidecar = layout::sidecar_path(artifact);
    if !sidecar.is_file() {
        return Ok("integrity ok (no sidecar manifest)".to_string());
    }
    let expected = SidecarManifest::read(&sidecar)?.artifact_sha256;
    let actual = integrity::sha256_file(artifact)?;
    if expected != actual {
        return Err(BackupError::IntegrityCheckFailed(format!(
            "checksum mismatch for {}: expected {}, found {}",
            artifact.display(),
            expected,
            actual
        )));
    }
    Ok(format!("integrity ok, sha256 {}", actual))
}

fn load_manifest<D: BackupDriver + ?Sized>(driver: &D, staging: &Path, skip_structure: bool) -> Result<Manifest> {
    let manifest = Manifest::read_from_dir(staging)?;
    manifest.validate_for(driver.kind())?;
    if !skip_structure {
        driver.check_structure(staging, &manifest)?;
    }
    Ok(manifest)
}

/// Operator summary of a finished session.
pub fn summary(session: &RestoreSession) -> String {
    let artifact = session
        .artifact
        .as_ref()
        .map(|a| a.display().to_string())
        .unwrap_or_else(|| "-".to_string());
    let target = session
        .target
        .as_ref()
        .map(|t| t.to_string())
        .unwrap_or_else(|| "-".to_string());
    format!(
        "{} restore {:?}: {} restored, {} failed, artifact {}, target {}, {:.1}s",
        session.service,
        session.status,
        session.restored_count,
        session.failed_count,
        artifact,
        target,
        session.duration_secs
    )
}

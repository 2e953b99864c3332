//! Restore session record, persisted as `status.json` after every transition.

use crate::drivers::{RestoreTarget, UnitReport, UnitResult};
use crate::service::ServiceKind;
use crate::utils::format::run_timestamp;
use crate::utils::Result;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const STATUS_FILE: &str = "status.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestorePhase {
    Locate,
    Verify,
    Decrypt,
    Decompress,
    ValidateManifest,
    Confirm,
    Import,
}

impl RestorePhase {
    pub const ALL: [RestorePhase; 7] = [
        RestorePhase::Locate,
        RestorePhase::Verify,
        RestorePhase::Decrypt,
        RestorePhase::Decompress,
        RestorePhase::ValidateManifest,
        RestorePhase::Confirm,
        RestorePhase::Import,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Timeout,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Completed,
    Partial,
    Failed,
    Cancelled,
    DryRunCompleted,
    Timeout,
}

impl SessionStatus {
    /// Process exit code for a terminal status.
    pub fn exit_code(&self) -> i32 {
        match self {
            SessionStatus::Completed | SessionStatus::DryRunCompleted => 0,
            SessionStatus::Cancelled => 2,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreMode {
    pub force: bool,
    pub test: bool,
    pub dry_run: bool,
    pub skip_verify: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub phase: RestorePhase,
    pub status: PhaseStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Local>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreSession {
    pub id: String,
    pub service: ServiceKind,
    pub mode: RestoreMode,
    pub status: SessionStatus,
    pub artifact: Option<PathBuf>,
    pub manifest_timestamp: Option<String>,
    pub target: Option<RestoreTarget>,
    pub phases: Vec<PhaseRecord>,
    pub planned_actions: Vec<String>,
    pub restored_count: usize,
    pub failed_count: usize,
    pub units: Vec<UnitResult>,
    pub started_at: DateTime<Local>,
    pub finished_at: Option<DateTime<Local>>,
    pub duration_secs: f64,
    pub error: Option<String>,
    #[serde(skip)]
    dir: PathBuf,
}

impl RestoreSession {
    /// Create a fresh session directory under `work_dir`.
    pub fn create(work_dir: &Path, service: ServiceKind, mode: RestoreMode) -> Result<Self> {
        let started_at = Local::now();
        let id = uuid::Uuid::new_v4().simple().to_string();
        let dir = work_dir.join(format!(
            "restore_{}_{}_{}",
            service.name(),
            run_timestamp(started_at),
            &id[..8]
        ));
        std::fs::create_dir_all(&dir)?;

        let session = Self {
            id,
            service,
            mode,
            status: SessionStatus::Running,
            artifact: None,
            manifest_timestamp: None,
            target: None,
            phases: RestorePhase::ALL
                .iter()
                .map(|&phase| PhaseRecord {
                    phase,
                    status: PhaseStatus::Pending,
                    started_at: None,
                    duration_secs: None,
                    detail: None,
                })
                .collect(),
            planned_actions: Vec::new(),
            restored_count: 0,
            failed_count: 0,
            units: Vec::new(),
            started_at,
            finished_at: None,
            duration_secs: 0.0,
            error: None,
            dir,
        };
        session.persist();
        Ok(session)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn status_path(&self) -> PathBuf {
        self.dir.join(STATUS_FILE)
    }

    pub fn phase(&self, phase: RestorePhase) -> PhaseStatus {
        self.phases
            .iter()
            .find(|p| p.phase == phase)
            .map(|p| p.status)
            .unwrap_or(PhaseStatus::Pending)
    }

    fn record(&mut self, phase: RestorePhase) -> &mut PhaseRecord {
        let index = RestorePhase::ALL
            .iter()
            .position(|p| *p == phase)
            .unwrap_or_default();
        &mut self.phases[index]
    }

    pub fn begin(&mut self, phase: RestorePhase) {
        tracing::debug!(service = %self.service, ?phase, "Restore phase started");
        let record = self.record(phase);
        record.status = PhaseStatus::InProgress;
        record.started_at = Some(Local::now());
        self.persist();
    }

    fn end(&mut self, phase: RestorePhase, status: PhaseStatus, detail: Option<String>) {
        let record = self.record(phase);
        record.status = status;
        record.duration_secs = record
            .started_at
            .map(|s| (Local::now() - s).num_milliseconds() as f64 / 1000.0);
        record.detail = detail;
        self.persist();
    }

    pub fn complete(&mut self, phase: RestorePhase, detail: Option<String>) {
        self.end(phase, PhaseStatus::Completed, detail);
    }

    pub fn skip(&mut self, phase: RestorePhase, reason: &str) {
        self.end(phase, PhaseStatus::Skipped, Some(reason.to_string()));
    }

    pub fn fail(&mut self, phase: RestorePhase, error: &str) {
        self.end(phase, PhaseStatus::Failed, Some(error.to_string()));
    }

    pub fn time_out(&mut self, phase: RestorePhase, seconds: u64) {
        self.end(
            phase,
            PhaseStatus::Timeout,
            Some(format!("exceeded {}s", seconds)),
        );
    }

    pub fn record_units(&mut self, report: &UnitReport) {
        self.restored_count = report.succeeded;
        self.failed_count = report.failed;
        self.units = report.units.clone();
    }

    /// Set the terminal status. Written once per session.
    pub fn finish(&mut self, status: SessionStatus, error: Option<String>) {
        let now = Local::now();
        self.status = status;
        self.error = error;
        self.finished_at = Some(now);
        self.duration_secs = (now - self.started_at).num_milliseconds() as f64 / 1000.0;
        self.persist();
    }

    /// Write `status.json`. Failures are logged; the session continues.
    fn persist(&self) {
        let write = || -> Result<()> {
            let tmp = self.dir.join(format!("{}.tmp", STATUS_FILE));
            std::fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
            std::fs::rename(&tmp, self.status_path())?;
            Ok(())
        };
        if let Err(e) = write() {
            tracing::warn!(session = %self.dir.display(), "Failed to persist restore status: {}", e);
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let mut session: Self = serde_json::from_slice(&std::fs::read(path)?)?;
        session.dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Ok(session)
    }
}

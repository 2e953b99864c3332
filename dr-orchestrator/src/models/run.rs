//! Disaster-recovery run record, persisted as `dr_status.json`.

use backup_core::restore::session::{PhaseStatus, SessionStatus};
use backup_core::utils::format::run_timestamp;
use backup_core::ServiceKind;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub const STATUS_FILE: &str = "dr_status.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrPhase {
    Validate,
    Confirm,
    StopWorkloads,
    RestorePostgres,
    RestoreInfluxdb,
    RestoreRedis,
    StartWorkloads,
    VerifyHealth,
    Report,
}

impl DrPhase {
    pub const ALL: [DrPhase; 9] = [
        DrPhase::Validate,
        DrPhase::Confirm,
        DrPhase::StopWorkloads,
        DrPhase::RestorePostgres,
        DrPhase::RestoreInfluxdb,
        DrPhase::RestoreRedis,
        DrPhase::StartWorkloads,
        DrPhase::VerifyHealth,
        DrPhase::Report,
    ];

    pub fn restore_of(kind: ServiceKind) -> Self {
        match kind {
            ServiceKind::Postgres => DrPhase::RestorePostgres,
            ServiceKind::TimeSeries => DrPhase::RestoreInfluxdb,
            ServiceKind::KeyValue => DrPhase::RestoreRedis,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DrPhase::Validate => "validate",
            DrPhase::Confirm => "confirm",
            DrPhase::StopWorkloads => "stop_workloads",
            DrPhase::RestorePostgres => "restore_postgres",
            DrPhase::RestoreInfluxdb => "restore_influxdb",
            DrPhase::RestoreRedis => "restore_redis",
            DrPhase::StartWorkloads => "start_workloads",
            DrPhase::VerifyHealth => "verify_health",
            DrPhase::Report => "report",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    DryRunCompleted,
    Cancelled,
}

impl RunStatus {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunStatus::Completed | RunStatus::DryRunCompleted => 0,
            RunStatus::Cancelled => 2,
            _ => 1,
        }
    }

    pub fn is_terminal(&self) -> bool {
        *self != RunStatus::Running
    }
}

/// Flags of one run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DrOptions {
    pub force: bool,
    pub dry_run: bool,
    pub test: bool,
    pub skip_services: bool,
    pub skip_verify: bool,
    /// Bound on each restore phase
    pub timeout_secs: u64,
    /// Explicit artifacts; services without one use their newest
    #[serde(skip)]
    pub artifacts: HashMap<ServiceKind, PathBuf>,
}

impl DrOptions {
    /// Workload phases only run against a live production recovery.
    pub fn controls_workloads(&self) -> bool {
        !(self.skip_services || self.dry_run || self.test)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub phase: DrPhase,
    pub status: PhaseStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Local>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Per-service restore outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceRestore {
    pub service: ServiceKind,
    pub artifact: PathBuf,
    pub session_status: Option<SessionStatus>,
    pub session_dir: Option<PathBuf>,
    pub restored_count: usize,
    pub failed_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisasterRecoveryRun {
    pub id: String,
    pub status: RunStatus,
    pub options: DrOptions,
    pub phases: Vec<PhaseRecord>,
    pub restores: Vec<ServiceRestore>,
    pub started_at: DateTime<Local>,
    pub finished_at: Option<DateTime<Local>>,
    pub duration_secs: f64,
    pub error: Option<String>,
    #[serde(skip)]
    dir: PathBuf,
}

impl DisasterRecoveryRun {
    pub fn create(work_dir: &Path, options: DrOptions) -> std::io::Result<Self> {
        let started_at = Local::now();
        let id = uuid::Uuid::new_v4().simple().to_string();
        let dir = work_dir.join(format!(
            "disaster_recovery_{}_{}",
            run_timestamp(started_at),
            &id[..8]
        ));
        std::fs::create_dir_all(&dir)?;

        let run = Self {
            id,
            status: RunStatus::Running,
            options,
            phases: DrPhase::ALL
                .iter()
                .map(|&phase| PhaseRecord {
                    phase,
                    status: PhaseStatus::Pending,
                    started_at: None,
                    duration_secs: None,
                    detail: None,
                })
                .collect(),
            restores: Vec::new(),
            started_at,
            finished_at: None,
            duration_secs: 0.0,
            error: None,
            dir,
        };
        run.persist();
        Ok(run)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn status_path(&self) -> PathBuf {
        self.dir.join(STATUS_FILE)
    }

    pub fn phase(&self, phase: DrPhase) -> PhaseStatus {
        self.phases
            .iter()
            .find(|p| p.phase == phase)
            .map(|p| p.status)
            .unwrap_or(PhaseStatus::Pending)
    }

    fn record(&mut self, phase: DrPhase) -> &mut PhaseRecord {
        let index = DrPhase::ALL
            .iter()
            .position(|p| *p == phase)
            .unwrap_or_default();
        &mut self.phases[index]
    }

    pub fn begin(&mut self, phase: DrPhase) {
        tracing::info!(phase = phase.name(), "Disaster recovery phase started");
        let record = self.record(phase);
        record.status = PhaseStatus::InProgress;
        record.started_at = Some(Local::now());
        self.persist();
    }

    pub fn end(&mut self, phase: DrPhase, status: PhaseStatus, detail: Option<String>) {
        let record = self.record(phase);
        record.status = status;
        record.duration_secs = record
            .started_at
            .map(|s| (Local::now() - s).num_milliseconds() as f64 / 1000.0);
        record.detail = detail;
        self.persist();
    }

    /// Any phase failed or timed out.
    pub fn has_failures(&self) -> bool {
        self.phases
            .iter()
            .any(|p| matches!(p.status, PhaseStatus::Failed | PhaseStatus::Timeout))
    }

    /// Set the terminal status. Later calls are ignored.
    pub fn finish(&mut self, status: RunStatus, error: Option<String>) {
        if self.status.is_terminal() {
            tracing::warn!(run = %self.id, "Terminal status already written");
            return;
        }
        let now = Local::now();
        self.status = status;
        self.error = error;
        self.finished_at = Some(now);
        self.duration_secs = (now - self.started_at).num_milliseconds() as f64 / 1000.0;
        self.persist();
    }

    fn persist(&self) {
        let write = || -> std::io::Result<()> {
            let tmp = self.dir.join(format!("{}.tmp", STATUS_FILE));
            std::fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
            std::fs::rename(&tmp, self.status_path())
        };
        if let Err(e) = write() {
            tracing::warn!(run = %self.dir.display(), "Failed to persist disaster recovery status: {}", e);
        }
    }

    pub fn load(path: &Path) -> std::io::Result<Self> {
        let mut run: Self = serde_json::from_slice(&std::fs::read(path)?)?;
        run.dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        Ok(run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_terminal_status_written_once() {
        let work = TempDir::new().unwrap();
        let mut run = DisasterRecoveryRun::create(work.path(), DrOptions::default()).unwrap();
        run.begin(DrPhase::Validate);
        run.end(DrPhase::Validate, PhaseStatus::Completed, None);
        run.finish(RunStatus::Completed, None);
        run.finish(RunStatus::Failed, Some("late".into()));

        let on_disk = DisasterRecoveryRun::load(&run.status_path()).unwrap();
        assert_eq!(on_disk.status, RunStatus::Completed);
        assert!(on_disk.error.is_none());
        assert_eq!(on_disk.phase(DrPhase::Validate), PhaseStatus::Completed);
        assert_eq!(on_disk.phase(DrPhase::Report), PhaseStatus::Pending);
    }

    #[test]
    fn test_timeout_counts_as_failure() {
        let work = TempDir::new().unwrap();
        let mut run = DisasterRecoveryRun::create(work.path(), DrOptions::default()).unwrap();
        assert!(!run.has_failures());
        run.end(DrPhase::RestorePostgres, PhaseStatus::Timeout, None);
        assert!(run.has_failures());
    }

    #[test]
    fn test_phase_names_match_serde() {
        for phase in DrPhase::ALL {
            assert_eq!(serde_json::to_value(phase).unwrap(), phase.name());
        }
        assert_eq!(DrPhase::restore_of(ServiceKind::TimeSeries), DrPhase::RestoreInfluxdb);
    }

    #[test]
    fn test_workload_control_modes() {
        let live = DrOptions::default();
        assert!(live.controls_workloads());
        let dry = DrOptions {
            dry_run: true,
            ..DrOptions::default()
        };
        assert!(!dry.controls_workloads());
        let test = DrOptions {
            test: true,
            ..DrOptions::default()
        };
        assert!(!test.controls_workloads());
    }
}

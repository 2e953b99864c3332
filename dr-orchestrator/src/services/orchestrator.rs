//! Disaster-recovery sequencing.
//!
//! `validate → confirm → stop_workloads → restore(postgres) →
//! restore(influxdb) → restore(redis) → start_workloads → verify_health →
//! report`. A restore phase that fails or times out is recorded and the next
//! phase still runs; only validation, confirmation and a failed workload stop
//! end the run early, all before any restore has touched a database.

use crate::models::run::{DisasterRecoveryRun, DrOptions, DrPhase, RunStatus, ServiceRestore};
use crate::services::probe::ServiceProbe;
use crate::services::restorer::ServiceRestorer;
use crate::services::workloads::{wait_for, WorkloadController};
use backup_core::config::WorkloadConfig;
use backup_core::notify::{Notifier, NotifyStatus};
use backup_core::restore::confirm::Confirmer;
use backup_core::restore::session::{PhaseStatus, RestoreMode, SessionStatus};
use backup_core::{Config, ServiceKind};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};

/// Phrase the operator types to approve a recovery.
pub const RECOVER_PHRASE: &str = "RECOVER ALL";

const NOTIFY_SERVICE: &str = "disaster-recovery";

pub struct DisasterRecovery<'a> {
    config: &'a Config,
    notifier: &'a Notifier,
    confirmer: &'a dyn Confirmer,
    restorer: &'a dyn ServiceRestorer,
    workloads: &'a dyn WorkloadController,
    probe: &'a dyn ServiceProbe,
}

impl<'a> DisasterRecovery<'a> {
    pub fn new(
        config: &'a Config,
        notifier: &'a Notifier,
        confirmer: &'a dyn Confirmer,
        restorer: &'a dyn ServiceRestorer,
        workloads: &'a dyn WorkloadController,
        probe: &'a dyn ServiceProbe,
    ) -> Self {
        Self {
            config,
            notifier,
            confirmer,
            restorer,
            workloads,
            probe,
        }
    }

    fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.config.disaster_recovery.drain_timeout_secs)
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.config.disaster_recovery.poll_interval_secs.max(1))
    }

    /// Record a phase outcome and notify it.
    async fn end(&self, run: &mut DisasterRecoveryRun, phase: DrPhase, status: PhaseStatus, detail: String) {
        let notify_status = match status {
            PhaseStatus::Completed | PhaseStatus::Skipped => NotifyStatus::Success,
            PhaseStatus::Failed | PhaseStatus::Timeout => NotifyStatus::Failure,
            _ => NotifyStatus::Warning,
        };
        match status {
            PhaseStatus::Failed | PhaseStatus::Timeout => {
                error!(phase = phase.name(), ?status, "{}", detail)
            }
            _ => info!(phase = phase.name(), ?status, "{}", detail),
        }
        self.notifier
            .notify(
                notify_status,
                NOTIFY_SERVICE,
                &format!("{}: {:?}: {}", phase.name(), status, detail),
            )
            .await;
        run.end(phase, status, Some(detail));
    }

    /// Run the recovery to a terminal status. Only failing to create the run
    /// directory is an error.
    pub async fn run(&self, options: DrOptions) -> std::io::Result<DisasterRecoveryRun> {
        let mut run = DisasterRecoveryRun::create(&self.config.storage.work_dir, options.clone())?;
        info!(
            run = %run.dir().display(),
            dry_run = options.dry_run,
            test = options.test,
            "Starting disaster recovery"
        );
        self.notifier
            .notify(NotifyStatus::Started, NOTIFY_SERVICE, "Disaster recovery started")
            .await;

        // validate
        run.begin(DrPhase::Validate);
        let mut artifacts: Vec<(ServiceKind, PathBuf)> = Vec::new();
        let mut problems = Vec::new();
        for kind in ServiceKind::ALL {
            let explicit = options.artifacts.get(&kind).map(PathBuf::as_path);
            match self.restorer.locate(kind, explicit, options.skip_verify) {
                Ok(artifact) => artifacts.push((kind, artifact)),
                Err(e) => problems.push(format!("{}: {}", kind, e)),
            }
        }
        if !problems.is_empty() {
            let detail = problems.join("; ");
            self.end(&mut run, DrPhase::Validate, PhaseStatus::Failed, detail.clone()).await;
            return Ok(self.conclude(run, RunStatus::Failed, Some(detail)).await);
        }
        if options.skip_verify {
            warn!("Artifact integrity checks skipped on request");
        }
        self.end(
            &mut run,
            DrPhase::Validate,
            PhaseStatus::Completed,
            format!("{} artifacts located", artifacts.len()),
        )
        .await;
        run.restores = artifacts
            .iter()
            .map(|(kind, artifact)| ServiceRestore {
                service: *kind,
                artifact: artifact.clone(),
                session_status: None,
                session_dir: None,
                restored_count: 0,
                failed_count: 0,
            })
            .collect();

        // confirm
        run.begin(DrPhase::Confirm);
        if options.dry_run || options.force {
            let reason = if options.dry_run { "dry run" } else { "--force" };
            if options.force && !options.dry_run {
                warn!("Disaster recovery forced without confirmation");
            }
            self.end(&mut run, DrPhase::Confirm, PhaseStatus::Skipped, reason.to_string()).await;
        } else {
            let mut details = vec!["Disaster recovery will overwrite every service from:".to_string()];
            details.extend(
                artifacts
                    .iter()
                    .map(|(kind, artifact)| format!("  {:<9} {}", kind.name(), artifact.display())),
            );
            if options.test {
                details.push("Targets: isolated test targets".to_string());
            }
            if !self.confirmer.confirm(&details, RECOVER_PHRASE) {
                let detail = "confirmation phrase did not match".to_string();
                self.end(&mut run, DrPhase::Confirm, PhaseStatus::Failed, detail.clone()).await;
                return Ok(self.conclude(run, RunStatus::Cancelled, Some(detail)).await);
            }
            self.end(&mut run, DrPhase::Confirm, PhaseStatus::Completed, "confirmed".to_string())
                .await;
        }

        // stop_workloads
        run.begin(DrPhase::StopWorkloads);
        if !options.controls_workloads() {
            self.end(&mut run, DrPhase::StopWorkloads, PhaseStatus::Skipped, skip_reason(&options))
                .await;
        } else if let Err(detail) = self.stop_workloads().await {
            self.end(&mut run, DrPhase::StopWorkloads, PhaseStatus::Failed, detail.clone())
                .await;
            return Ok(self.conclude(run, RunStatus::Failed, Some(detail)).await);
        } else {
            let count = self.config.disaster_recovery.workloads.len();
            self.end(
                &mut run,
                DrPhase::StopWorkloads,
                PhaseStatus::Completed,
                format!("{} workloads stopped", count),
            )
            .await;
        }

        // restore phases, in service order
        let mode = RestoreMode {
            force: true,
            test: options.test,
            dry_run: options.dry_run,
            skip_verify: options.skip_verify,
        };
        let timeout = Duration::from_secs(options.timeout_secs);
        for (index, (kind, artifact)) in artifacts.iter().enumerate() {
            let phase = DrPhase::restore_of(*kind);
            run.begin(phase);
            let outcome =
                tokio::time::timeout(timeout, self.restorer.restore(*kind, artifact, mode, timeout)).await;
            let (status, detail) = match outcome {
                Err(_) => (
                    PhaseStatus::Timeout,
                    format!("exceeded {}s", timeout.as_secs()),
                ),
                Ok(Err(e)) => (PhaseStatus::Failed, e.to_string()),
                Ok(Ok(session)) => {
                    let restore = &mut run.restores[index];
                    restore.session_status = Some(session.status);
                    restore.session_dir = Some(session.dir().to_path_buf());
                    restore.restored_count = session.restored_count;
                    restore.failed_count = session.failed_count;
                    let detail = format!(
                        "{:?}: {} restored, {} failed",
                        session.status, session.restored_count, session.failed_count
                    );
                    match session.status {
                        SessionStatus::Completed | SessionStatus::DryRunCompleted => {
                            (PhaseStatus::Completed, detail)
                        }
                        SessionStatus::Timeout => (PhaseStatus::Timeout, detail),
                        _ => (
                            PhaseStatus::Failed,
                            session.error.map(|e| format!("{} ({})", detail, e)).unwrap_or(detail),
                        ),
                    }
                }
            };
            self.end(&mut run, phase, status, detail).await;
        }

        // start_workloads
        run.begin(DrPhase::StartWorkloads);
        if !options.controls_workloads() {
            self.end(&mut run, DrPhase::StartWorkloads, PhaseStatus::Skipped, skip_reason(&options))
                .await;
        } else {
            match self.start_workloads(&self.config.disaster_recovery.workloads).await {
                Ok(()) => {
                    self.end(
                        &mut run,
                        DrPhase::StartWorkloads,
                        PhaseStatus::Completed,
                        "workloads started".to_string(),
                    )
                    .await
                }
                Err(detail) => {
                    self.end(&mut run, DrPhase::StartWorkloads, PhaseStatus::Failed, detail)
                        .await
                }
            }
        }

        // verify_health
        run.begin(DrPhase::VerifyHealth);
        if options.dry_run {
            self.end(&mut run, DrPhase::VerifyHealth, PhaseStatus::Skipped, "dry run".to_string())
                .await;
        } else {
            let unhealthy = self.verify_health(options.controls_workloads()).await;
            if unhealthy.is_empty() {
                self.end(
                    &mut run,
                    DrPhase::VerifyHealth,
                    PhaseStatus::Completed,
                    "all services reachable".to_string(),
                )
                .await;
            } else {
                self.end(&mut run, DrPhase::VerifyHealth, PhaseStatus::Failed, unhealthy.join("; "))
                    .await;
            }
        }

        let status = if run.has_failures() {
            RunStatus::Failed
        } else if options.dry_run {
            RunStatus::DryRunCompleted
        } else {
            RunStatus::Completed
        };
        let error = run.has_failures().then(|| {
            run.phases
                .iter()
                .filter(|p| matches!(p.status, PhaseStatus::Failed | PhaseStatus::Timeout))
                .map(|p| format!("{} {:?}", p.phase.name(), p.status))
                .collect::<Vec<_>>()
                .join(", ")
        });
        Ok(self.conclude(run, status, error).await)
    }

    /// Scale every workload down, rolling back the ones already stopped if
    /// one cannot be stopped.
    async fn stop_workloads(&self) -> Result<(), String> {
        let workloads = &self.config.disaster_recovery.workloads;
        for (index, workload) in workloads.iter().enumerate() {
            if let Err(e) = self.workloads.stop(workload).await {
                let stopped = &workloads[..index];
                warn!("Restarting {} stopped workloads after failed stop", stopped.len());
                if let Err(rollback) = self.start_workloads(stopped).await {
                    error!("Rollback incomplete: {}", rollback);
                }
                return Err(format!("{}/{}: {}", workload.namespace, workload.deployment, e));
            }
        }
        for workload in workloads {
            let drained = wait_for(
                self.workloads,
                workload,
                0,
                self.drain_timeout(),
                self.poll_interval(),
            )
            .await;
            if !drained {
                warn!(
                    deployment = %workload.deployment,
                    "Workload still running after {}s, proceeding",
                    self.drain_timeout().as_secs()
                );
            }
        }
        Ok(())
    }

    async fn start_workloads(&self, workloads: &[WorkloadConfig]) -> Result<(), String> {
        let mut failures = Vec::new();
        for workload in workloads {
            if let Err(e) = self.workloads.start(workload).await {
                failures.push(format!("{}/{}: {}", workload.namespace, workload.deployment, e));
            }
        }
        for workload in workloads {
            let ready = wait_for(
                self.workloads,
                workload,
                workload.replicas,
                self.drain_timeout(),
                self.poll_interval(),
            )
            .await;
            if !ready {
                warn!(
                    deployment = %workload.deployment,
                    "Workload not ready after {}s",
                    self.drain_timeout().as_secs()
                );
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(failures.join("; "))
        }
    }

    async fn verify_health(&self, check_workloads: bool) -> Vec<String> {
        let mut unhealthy = Vec::new();
        for kind in ServiceKind::ALL {
            if !self.probe.reachable(kind).await {
                unhealthy.push(format!("{} unreachable", kind));
            }
        }
        if check_workloads {
            for workload in &self.config.disaster_recovery.workloads {
                match self.workloads.count_running(workload).await {
                    Ok(n) if n >= workload.replicas => {}
                    Ok(n) => unhealthy.push(format!(
                        "{}: {}/{} replicas ready",
                        workload.deployment, n, workload.replicas
                    )),
                    Err(e) => unhealthy.push(format!("{}: {}", workload.deployment, e)),
                }
            }
        }
        unhealthy
    }

    /// `report` phase: write the terminal status once and notify.
    async fn conclude(
        &self,
        mut run: DisasterRecoveryRun,
        status: RunStatus,
        error: Option<String>,
    ) -> DisasterRecoveryRun {
        run.begin(DrPhase::Report);
        run.end(DrPhase::Report, PhaseStatus::Completed, None);
        run.finish(status, error);

        let message = summary(&run);
        let notify_status = match status {
            RunStatus::Completed | RunStatus::DryRunCompleted => NotifyStatus::Success,
            RunStatus::Cancelled => NotifyStatus::Warning,
            _ => NotifyStatus::Failure,
        };
        self.notifier.notify(notify_status, NOTIFY_SERVICE, &message).await;
        info!("{}", message);
        run
    }
}

fn skip_reason(options: &DrOptions) -> String {
    if options.dry_run {
        "dry run"
    } else if options.test {
        "test mode"
    } else {
        "--skip-services"
    }
    .to_string()
}

pub fn summary(run: &DisasterRecoveryRun) -> String {
    let restores = run
        .restores
        .iter()
        .map(|r| match r.session_status {
            Some(status) => format!(
                "{} {:?} ({} restored, {} failed)",
                r.service, status, r.restored_count, r.failed_count
            ),
            None => format!("{} not restored", r.service),
        })
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "Disaster recovery {:?} in {:.1}s: {}",
        run.status,
        run.duration_secs,
        if restores.is_empty() { "no restores" } else { &restores }
    )
}

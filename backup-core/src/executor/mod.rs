//! Backup executor - runs one service backup from health check to `latest`.
//!
//! Pipeline:
//! 1. Probe the service endpoint
//! 2. Load credentials and the encryption key
//! 3. Export into a per-run working directory
//! 4. Write the manifest
//! 5. Compress, then encrypt into the service directory
//! 6. Verify the encrypted artifact
//! 7. Sync to remote storage (best effort)
//! 8. Promote and rotate
//! 9. Repoint `latest`
//!
//! A failure before step 6 completes removes every partial output. The status
//! document is written whatever the outcome.

pub mod manifest;

use crate::config::Config;
use crate::crypto::ArtifactCipher;
use crate::drivers::{BackupDriver, UnitReport};
use crate::fs::{archive, integrity, walker};
use crate::health::{health_check, DEFAULT_PROBE_TIMEOUT};
use crate::layout;
use crate::notify::{Notifier, NotifyStatus};
use crate::remote::RemoteSync;
use crate::retention::{self, RetentionPolicy, RotationReport};
use crate::service::ServiceKind;
use crate::utils::format::{format_bytes, format_duration, run_timestamp};
use crate::utils::{BackupError, Result};
use chrono::{DateTime, Local};
use manifest::{BackupType, Manifest, SidecarManifest};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{error, info, warn};

/// Name of the status document kept in each service directory.
pub const STATUS_FILE: &str = "last_backup_status.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupStatus {
    Completed,
    Partial,
    Failed,
}

/// Backup execution result, persisted as the status document.
#[derive(Debug, Clone, Serialize)]
pub struct BackupResult {
    pub service: ServiceKind,
    pub status: BackupStatus,
    pub started_at: DateTime<Local>,
    pub finished_at: DateTime<Local>,
    pub duration_secs: f64,
    pub artifact: Option<PathBuf>,
    pub size: u64,
    pub sha256: Option<String>,
    pub units: UnitReport,
    pub promoted: Vec<PathBuf>,
    pub rotation: Option<RotationReport>,
    pub remote_uri: Option<String>,
    pub error: Option<String>,
}

impl BackupResult {
    fn new(service: ServiceKind, started_at: DateTime<Local>) -> Self {
        Self {
            service,
            status: BackupStatus::Failed,
            started_at,
            finished_at: started_at,
            duration_secs: 0.0,
            artifact: None,
            size: 0,
            sha256: None,
            units: UnitReport::default(),
            promoted: Vec::new(),
            rotation: None,
            remote_uri: None,
            error: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status != BackupStatus::Failed
    }

    /// One-line summary for the operator.
    pub fn summary(&self) -> String {
        let duration = format_duration(std::time::Duration::from_secs_f64(self.duration_secs));
        match (&self.artifact, &self.error) {
            (Some(artifact), _) => format!(
                "{} backup {:?}: {} units ok, {} failed, {} ({}) in {}",
                self.service,
                self.status,
                self.units.succeeded,
                self.units.failed,
                artifact.display(),
                format_bytes(self.size),
                duration
            ),
            (None, Some(err)) => format!("{} backup failed after {}: {}", self.service, duration, err),
            (None, None) => format!("{} backup failed after {}", self.service, duration),
        }
    }
}

/// What steps 1-6 produced.
struct Produced {
    artifact: PathBuf,
    size: u64,
    sha256: String,
    units: UnitReport,
}

/// Removes the working directory and any unpublished artifact on drop.
struct RunGuard {
    work_dir: PathBuf,
    pending: Vec<PathBuf>,
}

impl RunGuard {
    fn publish(&mut self, path: &Path) {
        self.pending.retain(|p| p != path);
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        for path in &self.pending {
            if path.exists() {
                warn!(path = %path.display(), "Removing partial backup output");
                let _ = std::fs::remove_file(path);
            }
        }
        let _ = std::fs::remove_dir_all(&self.work_dir);
    }
}

/// Run blocking filesystem work off the async runtime.
pub(crate) async fn blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| BackupError::Io(std::io::Error::other(e)))?
}

pub struct BackupExecutor<'a> {
    config: &'a Config,
    notifier: &'a Notifier,
    remote: RemoteSync,
}

impl<'a> BackupExecutor<'a> {
    pub fn new(config: &'a Config, notifier: &'a Notifier, remote: RemoteSync) -> Self {
        Self {
            config,
            notifier,
            remote,
        }
    }

    /// Execute a backup and persist its status document. Never returns an
    /// error: failures are reported in the result.
    pub async fn run<D: BackupDriver + ?Sized>(&self, driver: &D) -> BackupResult {
        let kind = driver.kind();
        let started_at = Local::now();
        let start = Instant::now();
        let mut result = BackupResult::new(kind, started_at);

        info!(service = %kind, "Starting backup");
        self.notifier
            .notify(NotifyStatus::Started, kind.name(), "Backup started")
            .await;

        match self.produce(driver, started_at).await {
            Ok(produced) => {
                result.status = if produced.units.is_clean() {
                    BackupStatus::Completed
                } else {
                    BackupStatus::Partial
                };
                result.size = produced.size;
                result.sha256 = Some(produced.sha256);
                result.units = produced.units;
                self.finish(kind, &produced.artifact, started_at, &mut result)
                    .await;
                result.artifact = Some(produced.artifact);
            }
            Err(e) => {
                error!(service = %kind, "Backup failed: {}", e);
                result.error = Some(e.to_string());
            }
        }

        result.finished_at = Local::now();
        result.duration_secs = start.elapsed().as_secs_f64();

        let (status, message) = match result.status {
            BackupStatus::Completed => (NotifyStatus::Success, result.summary()),
            BackupStatus::Partial => (
                NotifyStatus::Warning,
                format!(
                    "{} (failed units: {})",
                    result.summary(),
                    result.units.failed_names().join(", ")
                ),
            ),
            BackupStatus::Failed => (NotifyStatus::Failure, result.summary()),
        };
        self.notifier.notify(status, kind.name(), &message).await;

        if let Err(e) = self.write_status(kind, &result) {
            warn!(service = %kind, "Failed to write status document: {}", e);
        }
        info!("{}", result.summary());
        result
    }

    /// Steps 1-6. Anything returned as `Err` has left no artifact behind.
    async fn produce<D: BackupDriver + ?Sized>(
        &self,
        driver: &D,
        started_at: DateTime<Local>,
    ) -> Result<Produced> {
        let kind = driver.kind();

        let (host, port) = self.config.endpoint(kind);
        if !health_check(&host, port, DEFAULT_PROBE_TIMEOUT).await {
            return Err(BackupError::ServiceUnhealthy {
                service: kind.to_string(),
                endpoint: format!("{}:{}", host, port),
            });
        }

        let credentials = driver.load_credentials()?;
        let cipher = ArtifactCipher::from_key_file(&self.config.encryption.key_file)?;

        let timestamp = run_timestamp(started_at);
        let service_dir = self.config.service_dir(kind);
        std::fs::create_dir_all(&service_dir)?;

        let run_id = uuid::Uuid::new_v4().simple().to_string();
        let work_dir = self
            .config
            .storage
            .work_dir
            .join(format!("{}_{}_{}", kind.name(), timestamp, &run_id[..8]));
        let staging = work_dir.join("data");
        std::fs::create_dir_all(&staging)?;

        let artifact = service_dir.join(layout::artifact_name(kind, &timestamp));
        let partial = service_dir.join(format!(".{}", layout::artifact_name(kind, &timestamp)));
        if artifact.exists() {
            return Err(BackupError::Config(format!(
                "{} already exists; refusing to overwrite",
                artifact.display()
            )));
        }
        let mut guard = RunGuard {
            work_dir: work_dir.clone(),
            pending: vec![partial.clone()],
        };

        let outcome = driver.export(&credentials, &staging).await?;
        let payload_size = walker::calculate_total_size(&staging)?;

        let mut additional_info = outcome.additional_info.clone();
        if let Ok(host) = hostname::get() {
            additional_info.insert(
                "created_on".to_string(),
                serde_json::Value::from(host.to_string_lossy().to_string()),
            );
        }

        let manifest = Manifest {
            timestamp: started_at.to_rfc3339(),
            service: kind,
            backup_type: if outcome.units.is_clean() {
                BackupType::Full
            } else {
                BackupType::Partial
            },
            version: outcome.version.clone(),
            size: payload_size,
            retention_days: self.config.retention.keep_daily,
            additional_info,
        };
        manifest.write_to_dir(&staging)?;

        let compressed = work_dir.join(format!("{}.{}", kind.name(), archive::ARCHIVE_EXTENSION));
        let compressed_size = {
            let (src, dst) = (staging.clone(), compressed.clone());
            blocking(move || archive::compress(&src, &dst)).await?
        };
        info!(service = %kind, size = %format_bytes(compressed_size), "Compressed backup");

        let size = {
            let (src, dst) = (compressed.clone(), partial.clone());
            blocking(move || cipher.encrypt_file(&src, &dst)).await?
        };

        integrity::verify_integrity(&partial, self.config.min_size_bytes(kind))?;
        std::fs::rename(&partial, &artifact)?;
        guard.pending = vec![artifact.clone()];

        let sha256 = integrity::sha256_file(&artifact)?;
        let sidecar = SidecarManifest {
            manifest,
            artifact: layout::artifact_name(kind, &timestamp),
            artifact_size: size,
            artifact_sha256: sha256.clone(),
        };
        sidecar.write(&layout::sidecar_path(&artifact))?;

        guard.publish(&artifact);
        info!(service = %kind, artifact = %artifact.display(), size = %format_bytes(size), "Artifact verified");

        Ok(Produced {
            artifact,
            size,
            sha256,
            units: outcome.units,
        })
    }

    /// Steps 7-9. Failures here are warnings; the artifact already stands.
    async fn finish(
        &self,
        kind: ServiceKind,
        artifact: &Path,
        started_at: DateTime<Local>,
        result: &mut BackupResult,
    ) {
        let service_dir = self.config.service_dir(kind);

        let sidecar = layout::sidecar_path(artifact);
        result.remote_uri = self.remote.sync(kind, &[artifact, &sidecar]).await;

        match retention::promote(&service_dir, artifact, started_at.date_naive()) {
            Ok(promoted) => result.promoted = promoted,
            Err(e) => warn!(service = %kind, "Promotion failed: {}", e),
        }
        let policy = RetentionPolicy::from(&self.config.retention);
        match retention::rotate(&service_dir, kind, &policy, Local::now()) {
            Ok(report) => result.rotation = Some(report),
            Err(e) => warn!(service = %kind, "Rotation failed: {}", e),
        }

        if let Err(e) = layout::update_latest(&service_dir, artifact) {
            warn!(service = %kind, "Failed to update latest pointer: {}", e);
        }
    }

    fn write_status(&self, kind: ServiceKind, result: &BackupResult) -> Result<()> {
        let dir = self.config.service_dir(kind);
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join(STATUS_FILE), serde_json::to_vec_pretty(result)?)?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::drivers::keyvalue::KeyValueDriver;
    use crate::drivers::kv_store::testing::MemoryConnector;
    use crate::process::testing::ScriptedRunner;
    use crate::process::testing::ok;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio::net::TcpListener;

    /// Config rooted in `root`, probing a live local listener for redis.
    pub(crate) async fn test_config(root: &Path) -> (Config, TcpListener) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = Config::default();
        config.storage.base_dir = root.join("backups");
        config.storage.work_dir = root.join("work");
        config.encryption.key_file = root.join("backup.key");
        std::fs::write(&config.encryption.key_file, "correct horse battery staple\n").unwrap();
        config.redis.host = "127.0.0.1".into();
        config.redis.port = listener.local_addr().unwrap().port();
        config.redis.snapshot_timeout_secs = 2;
        config.redis.poll_interval_secs = 1;
        (config, listener)
    }

    fn executor<'a>(config: &'a Config, notifier: &'a Notifier) -> BackupExecutor<'a> {
        let runner = Arc::new(ScriptedRunner::new(|_| ok("")));
        BackupExecutor::new(config, notifier, RemoteSync::new(config.remote.clone(), runner))
    }

    #[tokio::test]
    async fn test_backup_produces_verified_artifact() {
        let root = TempDir::new().unwrap();
        let (config, _listener) = test_config(root.path()).await;
        let notifier = Notifier::disabled();
        let memory = MemoryConnector::new();
        for (k, v) in [("a", "1"), ("b", "2"), ("c", "3")] {
            memory.insert(0, k, v);
        }
        let driver = KeyValueDriver::new(config.redis.clone(), Arc::new(memory));

        let result = executor(&config, &notifier).run(&driver).await;
        assert_eq!(result.status, BackupStatus::Completed, "{:?}", result.error);

        let artifact = result.artifact.clone().unwrap();
        assert!(integrity::is_intact(&artifact, config.redis.min_size_bytes));
        assert!(layout::sidecar_path(&artifact).exists());

        let service_dir = config.service_dir(ServiceKind::KeyValue);
        let latest = service_dir.join(layout::latest_name());
        assert_eq!(std::fs::read_link(latest).unwrap(), PathBuf::from(artifact.file_name().unwrap()));
        assert!(service_dir.join(STATUS_FILE).exists());

        // Working directory is gone
        let leftovers = std::fs::read_dir(&config.storage.work_dir).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_small_key_space_clears_default_size_threshold() {
        let root = TempDir::new().unwrap();
        let (config, _listener) = test_config(root.path()).await;
        assert_eq!(config.redis.min_size_bytes, Config::default().redis.min_size_bytes);
        let notifier = Notifier::disabled();
        let memory = MemoryConnector::new();
        for (k, v) in [("a", "1"), ("b", "2"), ("c", "3")] {
            memory.insert(0, k, v);
        }
        let driver = KeyValueDriver::new(config.redis.clone(), Arc::new(memory));

        let result = executor(&config, &notifier).run(&driver).await;
        assert_eq!(result.status, BackupStatus::Completed, "{:?}", result.error);
        let artifact = result.artifact.unwrap();
        let size = std::fs::metadata(&artifact).unwrap().len();
        assert!(size >= config.redis.min_size_bytes, "{} bytes", size);
    }

    #[tokio::test]
    async fn test_unhealthy_service_fails_without_output() {
        let root = TempDir::new().unwrap();
        let (config, listener) = test_config(root.path()).await;
        drop(listener);
        let notifier = Notifier::disabled();
        let driver = KeyValueDriver::new(config.redis.clone(), Arc::new(MemoryConnector::new()));

        let result = executor(&config, &notifier).run(&driver).await;
        assert_eq!(result.status, BackupStatus::Failed);
        assert!(result.error.unwrap().contains("unreachable"));
        assert!(layout::find_latest(&config.service_dir(ServiceKind::KeyValue), ServiceKind::KeyValue).is_err());

        let status: serde_json::Value = serde_json::from_slice(
            &std::fs::read(config.service_dir(ServiceKind::KeyValue).join(STATUS_FILE)).unwrap(),
        )
        .unwrap();
        assert_eq!(status["status"], "failed");
    }

    #[tokio::test]
    async fn test_missing_key_fails_before_export() {
        let root = TempDir::new().unwrap();
        let (mut config, _listener) = test_config(root.path()).await;
        config.encryption.key_file = root.path().join("absent.key");
        let notifier = Notifier::disabled();
        let memory = MemoryConnector::new();
        memory.insert(0, "a", "1");
        let driver = KeyValueDriver::new(config.redis.clone(), Arc::new(memory.clone()));

        let result = executor(&config, &notifier).run(&driver).await;
        assert_eq!(result.status, BackupStatus::Failed);
        assert!(result.error.unwrap().contains("Encryption key missing"));
        assert_eq!(memory.state.last_save.load(std::sync::atomic::Ordering::SeqCst), 1_700_000_000);
    }

    #[tokio::test]
    async fn test_undersized_artifact_is_removed() {
        let root = TempDir::new().unwrap();
        let (mut config, _listener) = test_config(root.path()).await;
        config.redis.min_size_bytes = 10 * 1024 * 1024;
        let notifier = Notifier::disabled();
        let driver = KeyValueDriver::new(config.redis.clone(), Arc::new(MemoryConnector::new()));

        let result = executor(&config, &notifier).run(&driver).await;
        assert_eq!(result.status, BackupStatus::Failed);
        let service_dir = config.service_dir(ServiceKind::KeyValue);
        let names: Vec<String> = std::fs::read_dir(&service_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec![STATUS_FILE.to_string()]);
    }
}

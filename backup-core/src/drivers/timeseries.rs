//! InfluxDB driver: per-bucket backup and restore through the `influx` CLI.
//!
//! Buckets are independent units. A bucket that fails to export or import is
//! recorded and skipped; the remaining buckets still produce an artifact or a
//! restore.
//!
//! Production imports land in a staging bucket first. The live bucket is only
//! replaced once its staged copy restored cleanly.

use super::{BackupDriver, Driver, ExportOutcome, RestoreDriver, RestoreTarget, UnitReport};
use crate::config::InfluxConfig;
use crate::executor::manifest::Manifest;
use crate::process::{CommandRunner, CommandSpec};
use crate::secrets::Credentials;
use crate::service::ServiceKind;
use crate::utils::{BackupError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub const BUCKETS_DIR: &str = "buckets";
const STAGING_SUFFIX: &str = "_restore_staging";
const QUERY_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct BucketEntry {
    #[serde(default)]
    id: String,
    name: String,
}

pub struct TimeSeriesDriver {
    config: InfluxConfig,
    runner: Arc<dyn CommandRunner>,
}

impl TimeSeriesDriver {
    pub fn new(config: InfluxConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self { config, runner }
    }

    fn host_url(&self) -> String {
        format!("http://{}:{}", self.config.host, self.config.port)
    }

    fn command(&self, credentials: &Credentials, timeout: Duration) -> CommandSpec {
        let cmd = CommandSpec::new("influx", timeout);
        match credentials.secret() {
            Some(token) => cmd.env("INFLUX_TOKEN", token),
            None => cmd,
        }
    }

    /// `influx <sub> --host .. --org ..`
    fn scoped(&self, credentials: &Credentials, timeout: Duration, sub: &[&str]) -> CommandSpec {
        self.command(credentials, timeout)
            .args(sub.iter().copied())
            .args(["--host".to_string(), self.host_url()])
            .args(["--org".to_string(), self.config.org.clone()])
    }

    fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.config.command_timeout_secs)
    }

    fn bucket_dir(staging: &Path, bucket: &str) -> PathBuf {
        staging.join(BUCKETS_DIR).join(bucket)
    }

    async fn discover_buckets(&self, credentials: &Credentials) -> Result<Vec<String>> {
        if !self.config.buckets.is_empty() {
            return Ok(self.config.buckets.clone());
        }
        let cmd = self
            .scoped(credentials, QUERY_TIMEOUT, &["bucket", "list"])
            .arg("--json");
        let output = self.runner.run(&cmd).await?.check("influx")?;
        let entries: Vec<BucketEntry> = serde_json::from_slice(&output.stdout)?;
        let mut buckets: Vec<String> = entries
            .into_iter()
            .map(|b| b.name)
            .filter(|n| !n.starts_with('_'))
            .collect();
        buckets.sort();
        Ok(buckets)
    }

    async fn delete_bucket(&self, credentials: &Credentials, bucket: &str) {
        let cmd = self
            .scoped(credentials, QUERY_TIMEOUT, &["bucket", "delete"])
            .args(["--name", bucket]);
        match self.runner.run(&cmd).await {
            Ok(output) if output.success() => info!(bucket, "Deleted bucket before restore"),
            Ok(output) => {
                tracing::debug!(bucket, "Bucket delete skipped: {}", output.stderr_string())
            }
            Err(e) => tracing::debug!(bucket, "Bucket delete skipped: {}", e),
        }
    }

    async fn bucket_id(&self, credentials: &Credentials, bucket: &str) -> Result<String> {
        let cmd = self
            .scoped(credentials, QUERY_TIMEOUT, &["bucket", "list"])
            .args(["--name", bucket, "--json"]);
        let output = self.runner.run(&cmd).await?.check("influx")?;
        let entries: Vec<BucketEntry> = serde_json::from_slice(&output.stdout)?;
        entries
            .into_iter()
            .find(|b| b.name == bucket && !b.id.is_empty())
            .map(|b| b.id)
            .ok_or_else(|| BackupError::NotFound(format!("bucket {}", bucket)))
    }

    /// Replace `bucket` with the restored `staged` copy.
    async fn swap_in(&self, credentials: &Credentials, staged: &str, bucket: &str) -> Result<()> {
        let id = self.bucket_id(credentials, staged).await?;
        tracing::warn!(bucket, staged, "Replacing production bucket with restored copy");
        self.delete_bucket(credentials, bucket).await;
        let cmd = self
            .scoped(credentials, QUERY_TIMEOUT, &["bucket", "update"])
            .args(["--id", id.as_str(), "--name", bucket]);
        self.runner.run(&cmd).await?.check("influx bucket update")?;
        Ok(())
    }

    fn staging_name(bucket: &str) -> String {
        format!("{}{}", bucket, STAGING_SUFFIX)
    }

    fn restored_name(&self, bucket: &str, target: &RestoreTarget) -> String {
        if target.test {
            format!("{}{}", bucket, self.config.test_bucket_suffix)
        } else {
            bucket.to_string()
        }
    }
}

impl Driver for TimeSeriesDriver {
    fn kind(&self) -> ServiceKind {
        ServiceKind::TimeSeries
    }

    fn credential_ref(&self) -> Option<&Path> {
        Some(&self.config.token_file)
    }
}

#[async_trait]
impl BackupDriver for TimeSeriesDriver {
    async fn export(&self, credentials: &Credentials, staging: &Path) -> Result<ExportOutcome> {
        let version = self
            .runner
            .run(&self.command(credentials, QUERY_TIMEOUT).arg("version"))
            .await?
            .check("influx")?
            .stdout_string();

        let buckets = self.discover_buckets(credentials).await?;
        if buckets.is_empty() {
            return Err(BackupError::NotFound(format!(
                "no buckets in org {}",
                self.config.org
            )));
        }
        info!(buckets = buckets.len(), "Backing up buckets");

        let mut units = UnitReport::default();
        let mut exported = Vec::new();
        for bucket in &buckets {
            let dir = Self::bucket_dir(staging, bucket);
            let cmd = self
                .scoped(credentials, self.command_timeout(), &["backup"])
                .args(["--bucket", bucket.as_str()])
                .arg(dir.to_string_lossy());
            match self.runner.run(&cmd).await.and_then(|o| o.check("influx")) {
                Ok(_) => {
                    info!(bucket = %bucket, "Bucket exported");
                    units.succeed(bucket.clone());
                    exported.push(bucket.clone());
                }
                Err(e) => {
                    let _ = std::fs::remove_dir_all(&dir);
                    units.fail(bucket.clone(), e);
                }
            }
        }

        if exported.is_empty() {
            return Err(BackupError::PartialUnitFailure {
                failed: units.failed,
                total: units.total(),
            });
        }

        let mut additional_info = serde_json::Map::new();
        additional_info.insert("org".into(), Value::from(self.config.org.clone()));
        additional_info.insert("bucket_count".into(), Value::from(exported.len()));
        additional_info.insert("buckets".into(), Value::from(exported));
        additional_info.insert("failed_buckets".into(), Value::from(units.failed_names()));
        additional_info.insert("host".into(), Value::from(self.host_url()));

        Ok(ExportOutcome {
            version,
            units,
            additional_info,
        })
    }

    fn check_structure(&self, staging: &Path, manifest: &Manifest) -> Result<()> {
        let buckets = manifest.info_strings("buckets");
        if buckets.is_empty() {
            return Err(BackupError::IntegrityCheckFailed(
                "manifest lists no buckets".into(),
            ));
        }
        for bucket in &buckets {
            let dir = Self::bucket_dir(staging, bucket);
            let non_empty = std::fs::read_dir(&dir)
                .map(|mut entries| entries.next().is_some())
                .unwrap_or(false);
            if !non_empty {
                return Err(BackupError::IntegrityCheckFailed(format!(
                    "bucket {} has no backup data",
                    bucket
                )));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RestoreDriver for TimeSeriesDriver {
    fn target(&self, test: bool) -> RestoreTarget {
        RestoreTarget {
            name: if test {
                format!("<bucket>{}", self.config.test_bucket_suffix)
            } else {
                "<bucket>".to_string()
            },
            test,
        }
    }

    fn planned_actions(&self, manifest: &Manifest, target: &RestoreTarget) -> Vec<String> {
        manifest
            .info_strings("buckets")
            .iter()
            .flat_map(|bucket| {
                if target.test {
                    let name = self.restored_name(bucket, target);
                    vec![
                        format!("influx bucket delete --name {}", name),
                        format!("influx restore --bucket {} into {}", bucket, name),
                    ]
                } else {
                    let staged = Self::staging_name(bucket);
                    vec![
                        format!("influx restore --bucket {} into {}", bucket, staged),
                        format!("influx bucket delete --name {} (production)", bucket),
                        format!("influx bucket update: rename {} to {}", staged, bucket),
                    ]
                }
            })
            .collect()
    }

    async fn import(
        &self,
        credentials: &Credentials,
        staging: &Path,
        manifest: &Manifest,
        target: &RestoreTarget,
    ) -> Result<UnitReport> {
        let mut units = UnitReport::default();
        for bucket in manifest.info_strings("buckets") {
            let dir = Self::bucket_dir(staging, &bucket);
            if !dir.is_dir() {
                units.fail(bucket, "bucket directory missing from backup");
                continue;
            }

            let name = self.restored_name(&bucket, target);
            let restore_into = if target.test {
                name.clone()
            } else {
                Self::staging_name(&bucket)
            };
            self.delete_bucket(credentials, &restore_into).await;

            let cmd = self
                .scoped(credentials, self.command_timeout(), &["restore"])
                .args(["--bucket", bucket.as_str()])
                .args(["--new-bucket", restore_into.as_str()])
                .arg(dir.to_string_lossy());

            if let Err(e) = self.runner.run(&cmd).await.and_then(|o| o.check("influx")) {
                if !target.test {
                    self.delete_bucket(credentials, &restore_into).await;
                }
                units.fail(bucket, e);
                continue;
            }
            if !target.test {
                if let Err(e) = self.swap_in(credentials, &restore_into, &bucket).await {
                    tracing::error!(bucket = %bucket, staged = %restore_into, "Restored copy kept under staging name");
                    units.fail(bucket, e);
                    continue;
                }
            }
            info!(bucket = %bucket, restored_as = %name, "Bucket restored");
            units.succeed(bucket);
        }
        Ok(units)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::manifest::BackupType;
    use crate::process::testing::{fail, ok, ScriptedRunner};
    use tempfile::TempDir;

    const BUCKET_LIST: &str = r#"[
        {"id": "1", "name": "_monitoring"},
        {"id": "2", "name": "metrics"},
        {"id": "3", "name": "events"},
        {"id": "4", "name": "_tasks"}
    ]"#;

    fn runner_failing(bucket: &'static str) -> Arc<ScriptedRunner> {
        Arc::new(ScriptedRunner::new(move |cmd| {
            let sub = cmd.args.first().map(String::as_str);
            match sub {
                Some("version") => ok("Influx CLI 2.7.3"),
                Some("bucket") if cmd.args.get(1).map(String::as_str) == Some("list") => {
                    match cmd.flag_value("--name") {
                        Some(name) => ok(&format!(r#"[{{"id": "99", "name": "{}"}}]"#, name)),
                        None => ok(BUCKET_LIST),
                    }
                }
                Some("bucket") if cmd.args.get(1).map(String::as_str) == Some("update") => ok(""),
                Some("bucket") => fail("bucket not found"),
                Some("backup") | Some("restore") if cmd.flag_value("--bucket") == Some(bucket) => {
                    fail("failed to backup bucket")
                }
                Some("backup") => {
                    let dir = cmd.args.last().unwrap();
                    std::fs::create_dir_all(dir).unwrap();
                    std::fs::write(Path::new(dir).join("shard.tar.gz"), b"data").unwrap();
                    ok("")
                }
                Some("restore") => ok(""),
                _ => fail("unexpected"),
            }
        }))
    }

    fn manifest(outcome: &ExportOutcome) -> Manifest {
        Manifest {
            timestamp: chrono::Utc::now().to_rfc3339(),
            service: ServiceKind::TimeSeries,
            backup_type: BackupType::Partial,
            version: outcome.version.clone(),
            size: 0,
            retention_days: 7,
            additional_info: outcome.additional_info.clone(),
        }
    }

    #[tokio::test]
    async fn test_failed_bucket_is_skipped() {
        let driver = TimeSeriesDriver::new(InfluxConfig::default(), runner_failing("events"));
        let staging = TempDir::new().unwrap();

        let outcome = driver.export(&Credentials::none(), staging.path()).await.unwrap();
        assert_eq!(outcome.units.succeeded, 1);
        assert_eq!(outcome.units.failed, 1);
        assert_eq!(outcome.additional_info["buckets"], serde_json::json!(["metrics"]));
        assert_eq!(outcome.additional_info["failed_buckets"], serde_json::json!(["events"]));
        assert!(!staging.path().join(BUCKETS_DIR).join("events").exists());
        driver
            .check_structure(staging.path(), &manifest(&outcome))
            .unwrap();
    }

    #[tokio::test]
    async fn test_every_bucket_failing_is_fatal() {
        let runner = Arc::new(ScriptedRunner::new(|cmd| match cmd.args[0].as_str() {
            "version" => ok("Influx CLI 2.7.3"),
            "bucket" => ok(r#"[{"name": "metrics"}]"#),
            _ => fail("unauthorized"),
        }));
        let driver = TimeSeriesDriver::new(InfluxConfig::default(), runner);
        let staging = TempDir::new().unwrap();
        let result = driver.export(&Credentials::none(), staging.path()).await;
        assert!(matches!(
            result,
            Err(BackupError::PartialUnitFailure { failed: 1, total: 1 })
        ));
    }

    #[tokio::test]
    async fn test_test_restore_uses_suffixed_buckets() {
        let runner = runner_failing("none");
        let driver = TimeSeriesDriver::new(InfluxConfig::default(), runner.clone());
        let staging = TempDir::new().unwrap();
        let outcome = driver.export(&Credentials::none(), staging.path()).await.unwrap();

        let report = driver
            .import(&Credentials::none(), staging.path(), &manifest(&outcome), &driver.target(true))
            .await
            .unwrap();
        assert_eq!(report.succeeded, 2);

        let calls = runner.calls.lock().unwrap();
        for call in calls.iter().filter(|c| c.args[0] == "restore") {
            let new_bucket = call.flag_value("--new-bucket").unwrap();
            assert!(new_bucket.ends_with("_restore_test"));
        }
        for call in calls.iter().filter(|c| c.args.get(1).map(String::as_str) == Some("delete")) {
            assert!(call.flag_value("--name").unwrap().ends_with("_restore_test"));
        }
    }

    #[tokio::test]
    async fn test_partial_restore_records_failed_bucket() {
        let staging = TempDir::new().unwrap();
        let exporter = TimeSeriesDriver::new(InfluxConfig::default(), runner_failing("none"));
        let outcome = exporter.export(&Credentials::none(), staging.path()).await.unwrap();

        let driver = TimeSeriesDriver::new(InfluxConfig::default(), runner_failing("metrics"));
        let report = driver
            .import(&Credentials::none(), staging.path(), &manifest(&outcome), &driver.target(false))
            .await
            .unwrap();
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed_names(), vec!["metrics"]);
    }

    fn bucket_calls(runner: &ScriptedRunner, action: &str) -> Vec<CommandSpec> {
        runner
            .calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.args.first().map(String::as_str) == Some("bucket"))
            .filter(|c| c.args.get(1).map(String::as_str) == Some(action))
            .cloned()
            .collect()
    }

    #[tokio::test]
    async fn test_production_restore_swaps_in_staged_bucket() {
        let runner = runner_failing("none");
        let driver = TimeSeriesDriver::new(InfluxConfig::default(), runner.clone());
        let staging = TempDir::new().unwrap();
        let outcome = driver.export(&Credentials::none(), staging.path()).await.unwrap();

        let report = driver
            .import(&Credentials::none(), staging.path(), &manifest(&outcome), &driver.target(false))
            .await
            .unwrap();
        assert_eq!(report.succeeded, 2);

        for call in runner.calls.lock().unwrap().iter().filter(|c| c.args[0] == "restore") {
            assert!(call.flag_value("--new-bucket").unwrap().ends_with(STAGING_SUFFIX));
        }
        let renames: Vec<_> = bucket_calls(&runner, "update")
            .iter()
            .map(|c| c.flag_value("--name").unwrap().to_string())
            .collect();
        assert_eq!(renames, vec!["events", "metrics"]);
    }

    #[tokio::test]
    async fn test_failed_production_restore_leaves_live_bucket() {
        let staging = TempDir::new().unwrap();
        let exporter = TimeSeriesDriver::new(InfluxConfig::default(), runner_failing("none"));
        let outcome = exporter.export(&Credentials::none(), staging.path()).await.unwrap();

        let runner = runner_failing("metrics");
        let driver = TimeSeriesDriver::new(InfluxConfig::default(), runner.clone());
        let report = driver
            .import(&Credentials::none(), staging.path(), &manifest(&outcome), &driver.target(false))
            .await
            .unwrap();
        assert_eq!(report.failed_names(), vec!["metrics"]);

        let deleted: Vec<_> = bucket_calls(&runner, "delete")
            .iter()
            .map(|c| c.flag_value("--name").unwrap().to_string())
            .collect();
        assert!(!deleted.contains(&"metrics".to_string()), "{:?}", deleted);
        assert!(deleted.contains(&"metrics_restore_staging".to_string()));
        assert!(bucket_calls(&runner, "update")
            .iter()
            .all(|c| c.flag_value("--name") != Some("metrics")));
    }
}

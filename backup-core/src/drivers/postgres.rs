//! PostgreSQL driver built on `psql`, `pg_dump`, `pg_restore` and `createdb`.

use super::{BackupDriver, Driver, ExportOutcome, RestoreDriver, RestoreTarget, UnitReport};
use crate::config::PostgresConfig;
use crate::executor::manifest::Manifest;
use crate::process::{CommandRunner, CommandSpec};
use crate::secrets::Credentials;
use crate::service::ServiceKind;
use crate::utils::{BackupError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const DUMP_MAGIC: &[u8] = b"PGDMP";
const QUERY_TIMEOUT: Duration = Duration::from_secs(60);

const TABLES_QUERY: &str = "SELECT schemaname || '.' || tablename FROM pg_tables \
     WHERE schemaname NOT IN ('pg_catalog', 'information_schema') ORDER BY 1";

pub struct PostgresDriver {
    config: PostgresConfig,
    runner: Arc<dyn CommandRunner>,
}

impl PostgresDriver {
    pub fn new(config: PostgresConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self { config, runner }
    }

    fn dump_file(&self, staging: &Path) -> PathBuf {
        staging.join(format!("{}.dump", self.config.database))
    }

    fn command(&self, program: &str, credentials: &Credentials, timeout: Duration) -> CommandSpec {
        let cmd = CommandSpec::new(program, timeout).args([
            "-h".to_string(),
            self.config.host.clone(),
            "-p".to_string(),
            self.config.port.to_string(),
            "-U".to_string(),
            self.config.user.clone(),
        ]);
        match credentials.secret() {
            Some(password) => cmd.env("PGPASSWORD", password),
            None => cmd,
        }
    }

    async fn query(&self, credentials: &Credentials, database: &str, sql: &str) -> Result<String> {
        let cmd = self
            .command("psql", credentials, QUERY_TIMEOUT)
            .args(["-d", database, "-Atc", sql]);
        Ok(self.runner.run(&cmd).await?.check("psql")?.stdout_string())
    }

    fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.config.command_timeout_secs)
    }

    async fn ensure_database(&self, credentials: &Credentials, database: &str) -> Result<()> {
        let cmd = self
            .command("createdb", credentials, QUERY_TIMEOUT)
            .arg(database);
        let output = self.runner.run(&cmd).await?;
        if output.success() || output.stderr_string().contains("already exists") {
            Ok(())
        } else {
            output.check("createdb").map(|_| ())
        }
    }
}

impl Driver for PostgresDriver {
    fn kind(&self) -> ServiceKind {
        ServiceKind::Postgres
    }

    fn credential_ref(&self) -> Option<&Path> {
        Some(&self.config.password_file)
    }
}

#[async_trait]
impl BackupDriver for PostgresDriver {
    async fn export(&self, credentials: &Credentials, staging: &Path) -> Result<ExportOutcome> {
        let database = &self.config.database;
        let version = self
            .query(credentials, database, "SHOW server_version")
            .await?;
        let tables: Vec<String> = self
            .query(credentials, database, TABLES_QUERY)
            .await?
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();

        let dump_file = self.dump_file(staging);
        let cmd = self
            .command("pg_dump", credentials, self.command_timeout())
            .args(["-d", database.as_str(), "-Fc", "--no-owner", "--no-acl", "-f"])
            .arg(dump_file.to_string_lossy());
        self.runner.run(&cmd).await?.check("pg_dump")?;
        info!(database = %database, tables = tables.len(), "Dumped database");

        let mut units = UnitReport::default();
        units.succeed(database.clone());

        let mut additional_info = serde_json::Map::new();
        additional_info.insert("database".into(), Value::from(database.clone()));
        additional_info.insert("table_count".into(), Value::from(tables.len()));
        additional_info.insert("tables".into(), Value::from(tables));
        additional_info.insert(
            "dump_file".into(),
            Value::from(format!("{}.dump", database)),
        );
        additional_info.insert(
            "host".into(),
            Value::from(format!("{}:{}", self.config.host, self.config.port)),
        );

        Ok(ExportOutcome {
            version,
            units,
            additional_info,
        })
    }

    fn check_structure(&self, staging: &Path, manifest: &Manifest) -> Result<()> {
        let name = manifest
            .info_str("dump_file")
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}.dump", self.config.database));
        let path = staging.join(&name);

        let mut magic = [0u8; 5];
        std::fs::File::open(&path)
            .and_then(|mut f| f.read_exact(&mut magic))
            .map_err(|_| {
                BackupError::IntegrityCheckFailed(format!("{} missing or truncated", name))
            })?;
        if magic != DUMP_MAGIC {
            return Err(BackupError::IntegrityCheckFailed(format!(
                "{} is not a custom-format dump",
                name
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl RestoreDriver for PostgresDriver {
    fn target(&self, test: bool) -> RestoreTarget {
        RestoreTarget {
            name: if test {
                self.config.test_database.clone()
            } else {
                self.config.database.clone()
            },
            test,
        }
    }

    fn planned_actions(&self, manifest: &Manifest, target: &RestoreTarget) -> Vec<String> {
        let mut actions = Vec::new();
        if target.test {
            actions.push(format!("createdb {} (if missing)", target.name));
        }
        actions.push(format!(
            "pg_restore --clean --if-exists into {} on {}:{} ({} tables)",
            target.name,
            self.config.host,
            self.config.port,
            manifest.info_u64("table_count").unwrap_or(0)
        ));
        actions
    }

    async fn import(
        &self,
        credentials: &Credentials,
        staging: &Path,
        manifest: &Manifest,
        target: &RestoreTarget,
    ) -> Result<UnitReport> {
        let dump_file = manifest
            .info_str("dump_file")
            .map(|n| staging.join(n))
            .unwrap_or_else(|| self.dump_file(staging));

        if target.test {
            self.ensure_database(credentials, &target.name).await?;
        }

        let cmd = self
            .command("pg_restore", credentials, self.command_timeout())
            .args([
                "-d",
                target.name.as_str(),
                "--clean",
                "--if-exists",
                "--no-owner",
                "--no-acl",
            ])
            .arg(dump_file.to_string_lossy());
        let output = self.runner.run(&cmd).await?;

        let mut units = UnitReport::default();
        if output.success() {
            info!(database = %target.name, "Restored database");
            units.succeed(target.name.clone());
        } else {
            warn!(database = %target.name, "pg_restore reported errors");
            units.fail(target.name.clone(), output.stderr_string());
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

    fn scripted() -> Arc<ScriptedRunner> {
        Arc::new(ScriptedRunner::new(|cmd| match cmd.program.as_str() {
            "psql" if cmd.args.iter().any(|a| a == "SHOW server_version") => ok("16.2"),
            "psql" => ok("public.users\npublic.orders\npublic.events\n"),
            "pg_dump" => {
                let out = cmd.flag_value("-f").unwrap();
                std::fs::write(out, b"PGDMP\x01\x0e\x00 custom dump body").unwrap();
                ok("")
            }
            "createdb" => fail("createdb: error: database \"platform_restore_test\" already exists"),
            "pg_restore" => ok(""),
            other => fail(&format!("unexpected {}", other)),
        }))
    }

    fn manifest(outcome: &ExportOutcome) -> Manifest {
        Manifest {
            timestamp: chrono::Utc::now().to_rfc3339(),
            service: ServiceKind::Postgres,
            backup_type: BackupType::Full,
            version: outcome.version.clone(),
            size: 0,
            retention_days: 7,
            additional_info: outcome.additional_info.clone(),
        }
    }

    #[tokio::test]
    async fn test_export_records_tables() {
        let runner = scripted();
        let driver = PostgresDriver::new(PostgresConfig::default(), runner.clone());
        let staging = TempDir::new().unwrap();
        let creds = Credentials::none();

        let outcome = driver.export(&creds, staging.path()).await.unwrap();
        assert_eq!(outcome.version, "16.2");
        assert_eq!(outcome.additional_info["table_count"], 3);
        driver
            .check_structure(staging.path(), &manifest(&outcome))
            .unwrap();

        let calls = runner.calls.lock().unwrap();
        let dump = calls.iter().find(|c| c.program == "pg_dump").unwrap();
        assert!(dump.args.contains(&"--no-owner".to_string()));
        assert!(dump.args.contains(&"-Fc".to_string()));
    }

    #[tokio::test]
    async fn test_test_restore_targets_test_database() {
        let runner = scripted();
        let driver = PostgresDriver::new(PostgresConfig::default(), runner.clone());
        let staging = TempDir::new().unwrap();
        let creds = Credentials::none();
        let outcome = driver.export(&creds, staging.path()).await.unwrap();

        let target = driver.target(true);
        let report = driver
            .import(&creds, staging.path(), &manifest(&outcome), &target)
            .await
            .unwrap();
        assert!(report.is_clean());

        let calls = runner.calls.lock().unwrap();
        let restore = calls.iter().find(|c| c.program == "pg_restore").unwrap();
        assert_eq!(restore.flag_value("-d"), Some("platform_restore_test"));
        assert!(calls.iter().any(|c| c.program == "createdb"));
    }

    #[tokio::test]
    async fn test_failed_restore_is_recorded() {
        let runner = Arc::new(ScriptedRunner::new(|cmd| match cmd.program.as_str() {
            "pg_restore" => fail("pg_restore: error: could not execute query"),
            _ => ok(""),
        }));
        let driver = PostgresDriver::new(PostgresConfig::default(), runner);
        let staging = TempDir::new().unwrap();
        let mut outcome = ExportOutcome::default();
        outcome.additional_info.insert("dump_file".into(), Value::from("platform.dump"));

        let report = driver
            .import(&Credentials::none(), staging.path(), &manifest(&outcome), &driver.target(false))
            .await
            .unwrap();
        assert_eq!(report.failed, 1);
    }

    #[test]
    fn test_structure_rejects_plain_sql() {
        let driver = PostgresDriver::new(
            PostgresConfig::default(),
            Arc::new(ScriptedRunner::new(|_| ok(""))),
        );
        let staging = TempDir::new().unwrap();
        std::fs::write(staging.path().join("platform.dump"), b"-- SQL dump").unwrap();
        let outcome = ExportOutcome::default();
        assert!(driver
            .check_structure(staging.path(), &manifest(&outcome))
            .is_err());
    }
}

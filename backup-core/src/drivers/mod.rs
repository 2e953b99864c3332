//! Service drivers: export and import through each database's native tooling.
//!
//! Every service implements [`BackupDriver`] and [`RestoreDriver`]; the
//! pipelines in [`crate::executor`], [`crate::restore`] and [`crate::verify`]
//! only see these traits.

pub mod keyvalue;
pub mod kv_store;
pub mod postgres;
pub mod timeseries;

use crate::config::Config;
use crate::executor::manifest::Manifest;
use crate::process::{CommandRunner, SystemRunner};
use crate::secrets::Credentials;
use crate::service::ServiceKind;
use crate::utils::Result;
use async_trait::async_trait;
use kv_store::{KeyValueConnector, RedisConnector};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitStatus {
    Completed,
    Failed,
}

/// Outcome of one independent unit (a database, a bucket, a key).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitResult {
    pub name: String,
    pub status: UnitStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Per-unit accounting shared by exports and imports.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnitReport {
    pub succeeded: usize,
    pub failed: usize,
    pub units: Vec<UnitResult>,
}

impl UnitReport {
    pub fn succeed(&mut self, name: impl Into<String>) {
        self.succeeded += 1;
        self.units.push(UnitResult {
            name: name.into(),
            status: UnitStatus::Completed,
            error: None,
        });
    }

    /// Count a success without recording it; used where units are numerous.
    pub fn count_success(&mut self) {
        self.succeeded += 1;
    }

    pub fn fail(&mut self, name: impl Into<String>, error: impl ToString) {
        let name = name.into();
        let error = error.to_string();
        tracing::warn!(unit = %name, "Unit failed: {}", error);
        self.failed += 1;
        self.units.push(UnitResult {
            name,
            status: UnitStatus::Failed,
            error: Some(error),
        });
    }

    pub fn total(&self) -> usize {
        self.succeeded + self.failed
    }

    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }

    pub fn failed_names(&self) -> Vec<String> {
        self.units
            .iter()
            .filter(|u| u.status == UnitStatus::Failed)
            .map(|u| u.name.clone())
            .collect()
    }
}

/// What an export left in the staging directory.
#[derive(Debug, Clone, Default)]
pub struct ExportOutcome {
    pub version: String,
    pub units: UnitReport,
    pub additional_info: Map<String, Value>,
}

/// Where a restore writes. Test targets are distinct identifiers, never the
/// production one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreTarget {
    /// Database name, bucket naming rule or logical index
    pub name: String,
    pub test: bool,
}

impl std::fmt::Display for RestoreTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.test {
            write!(f, "{} (test)", self.name)
        } else {
            write!(f, "{} (production)", self.name)
        }
    }
}

/// Identity and connection details shared by both directions.
pub trait Driver: Send + Sync {
    fn kind(&self) -> ServiceKind;

    /// Secret reference holding the service credential, if one is required.
    fn credential_ref(&self) -> Option<&Path>;

    fn load_credentials(&self) -> Result<Credentials> {
        Credentials::load(self.credential_ref())
    }
}

#[async_trait]
pub trait BackupDriver: Driver {
    /// Export service state into `staging`. Independent units that fail are
    /// recorded in the outcome; only a failure of every unit is an error.
    async fn export(&self, credentials: &Credentials, staging: &Path) -> Result<ExportOutcome>;

    /// Format-specific consistency check of an unpacked backup.
    fn check_structure(&self, staging: &Path, manifest: &Manifest) -> Result<()>;
}

#[async_trait]
pub trait RestoreDriver: Driver {
    fn target(&self, test: bool) -> RestoreTarget;

    /// Human readable list of the mutations `import` would perform.
    fn planned_actions(&self, manifest: &Manifest, target: &RestoreTarget) -> Vec<String>;

    /// Import an unpacked backup into `target`.
    async fn import(
        &self,
        credentials: &Credentials,
        staging: &Path,
        manifest: &Manifest,
        target: &RestoreTarget,
    ) -> Result<UnitReport>;
}

pub trait ServiceDriver: BackupDriver + RestoreDriver {}

impl<T: BackupDriver + RestoreDriver> ServiceDriver for T {}

/// External collaborators handed to drivers.
#[derive(Clone)]
pub struct Toolbox {
    pub runner: Arc<dyn CommandRunner>,
    pub kv: Arc<dyn KeyValueConnector>,
}

impl Toolbox {
    pub fn system(config: &Config) -> Self {
        Self {
            runner: Arc::new(SystemRunner),
            kv: Arc::new(RedisConnector::new(&config.redis)),
        }
    }
}

/// Driver for one service.
pub fn driver_for(kind: ServiceKind, config: &Config, tools: &Toolbox) -> Box<dyn ServiceDriver> {
    match kind {
        ServiceKind::Postgres => Box::new(postgres::PostgresDriver::new(
            config.postgres.clone(),
            tools.runner.clone(),
        )),
        ServiceKind::TimeSeries => Box::new(timeseries::TimeSeriesDriver::new(
            config.influxdb.clone(),
            tools.runner.clone(),
        )),
        ServiceKind::KeyValue => Box::new(keyvalue::KeyValueDriver::new(
            config.redis.clone(),
            tools.kv.clone(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_report_counts() {
        let mut report = UnitReport::default();
        report.succeed("metrics");
        report.count_success();
        report.fail("events", "restore failed");

        assert_eq!(report.total(), 3);
        assert!(!report.is_clean());
        assert_eq!(report.units.len(), 2);
        assert_eq!(report.failed_names(), vec!["events"]);
    }

    #[test]
    fn test_driver_for_matches_kind() {
        let config = Config::default();
        let tools = Toolbox::system(&config);
        for kind in ServiceKind::ALL {
            assert_eq!(driver_for(kind, &config, &tools).kind(), kind);
        }
    }

    #[test]
    fn test_target_display() {
        let target = RestoreTarget {
            name: "platform_restore_test".into(),
            test: true,
        };
        assert_eq!(target.to_string(), "platform_restore_test (test)");
    }
}

//! Redis driver: snapshot trigger, key export and keyed restore.

use super::kv_store::{KeyValueConnector, KeyValueStore};
use super::{BackupDriver, Driver, ExportOutcome, RestoreDriver, RestoreTarget, UnitReport};
use crate::config::RedisConfig;
use crate::executor::manifest::Manifest;
use crate::secrets::Credentials;
use crate::service::ServiceKind;
use crate::utils::{BackupError, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

pub const KEYS_FILE: &str = "keys.json";
pub const RDB_FILE: &str = "dump.rdb";
const RDB_MAGIC: &[u8] = b"REDIS";

/// One exported key. `key` and `value` are base64; `value` is the server's
/// DUMP serialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyRecord {
    pub key: String,
    pub ttl_ms: i64,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyExport {
    pub db: i64,
    pub keys: Vec<KeyRecord>,
}

impl KeyExport {
    pub fn read(staging: &Path) -> Result<Self> {
        let path = staging.join(KEYS_FILE);
        let bytes = std::fs::read(&path).map_err(|_| {
            BackupError::IntegrityCheckFailed(format!("{} missing from backup", KEYS_FILE))
        })?;
        serde_json::from_slice(&bytes).map_err(|e| {
            BackupError::IntegrityCheckFailed(format!("{} is not valid: {}", KEYS_FILE, e))
        })
    }
}

pub struct KeyValueDriver {
    config: RedisConfig,
    connector: Arc<dyn KeyValueConnector>,
}

impl KeyValueDriver {
    pub fn new(config: RedisConfig, connector: Arc<dyn KeyValueConnector>) -> Self {
        Self { config, connector }
    }

    /// Trigger BGSAVE and wait for LASTSAVE to advance. Returns whether a fresh
    /// snapshot completed; on timeout the existing snapshot is used.
    async fn snapshot(&self, store: &dyn KeyValueStore) -> Result<(bool, i64)> {
        let before = store.last_save().await?;
        if let Err(e) = store.bgsave().await {
            // Usually "Background save already in progress"; keep polling.
            warn!("BGSAVE not accepted: {}", e);
        }

        let timeout = Duration::from_secs(self.config.snapshot_timeout_secs);
        let interval = Duration::from_secs(self.config.poll_interval_secs.max(1));
        let start = Instant::now();
        loop {
            let current = store.last_save().await?;
            if current > before {
                info!(last_save = current, "Snapshot completed");
                return Ok((true, current));
            }
            if start.elapsed() >= timeout {
                warn!(
                    "Snapshot did not complete within {}s, proceeding with snapshot from {}",
                    timeout.as_secs(),
                    current
                );
                return Ok((false, current));
            }
            tokio::time::sleep(interval.min(timeout.saturating_sub(start.elapsed()))).await;
        }
    }

    async fn export_keys(&self, store: &dyn KeyValueStore, units: &mut UnitReport) -> Result<KeyExport> {
        let keys = store.scan_keys().await?;
        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            let name = String::from_utf8_lossy(&key).to_string();
            let exported = async {
                let ttl_ms = store.pttl(&key).await?;
                let payload = store.dump(&key).await?;
                Ok::<_, BackupError>((ttl_ms, payload))
            }
            .await;
            match exported {
                Ok((_, None)) => {
                    // Expired or deleted between SCAN and DUMP.
                    tracing::debug!(key = %name, "Key vanished during export");
                }
                Ok((ttl_ms, Some(payload))) => {
                    units.count_success();
                    records.push(KeyRecord {
                        key: STANDARD.encode(&key),
                        ttl_ms,
                        value: STANDARD.encode(payload),
                    });
                }
                Err(e) => units.fail(name, e),
            }
        }
        Ok(KeyExport {
            db: self.config.db,
            keys: records,
        })
    }
}

impl Driver for KeyValueDriver {
    fn kind(&self) -> ServiceKind {
        ServiceKind::KeyValue
    }

    fn credential_ref(&self) -> Option<&Path> {
        self.config.password_file.as_deref()
    }
}

#[async_trait]
impl BackupDriver for KeyValueDriver {
    async fn export(&self, credentials: &Credentials, staging: &Path) -> Result<ExportOutcome> {
        let store = self
            .connector
            .connect(self.config.db, credentials.secret())
            .await?;
        let version = store.server_version().await?;
        let (snapshot_fresh, last_save) = self.snapshot(store.as_ref()).await?;

        let mut units = UnitReport::default();
        let rdb_included = match &self.config.rdb_path {
            Some(rdb) => match std::fs::copy(rdb, staging.join(RDB_FILE)) {
                Ok(bytes) => {
                    info!(rdb = %rdb.display(), bytes, "Copied snapshot file");
                    true
                }
                Err(e) => {
                    units.fail(RDB_FILE, e);
                    false
                }
            },
            None => false,
        };

        let export = self.export_keys(store.as_ref(), &mut units).await?;
        std::fs::write(staging.join(KEYS_FILE), serde_json::to_vec(&export)?)?;
        info!(keys = export.keys.len(), failed = units.failed, "Exported keys");

        let mut additional_info = serde_json::Map::new();
        additional_info.insert("key_count".into(), Value::from(export.keys.len()));
        additional_info.insert("db".into(), Value::from(self.config.db));
        additional_info.insert("snapshot_fresh".into(), Value::from(snapshot_fresh));
        additional_info.insert("last_save".into(), Value::from(last_save));
        additional_info.insert("rdb_included".into(), Value::from(rdb_included));
        additional_info.insert("host".into(), Value::from(self.connector.address()));

        Ok(ExportOutcome {
            version,
            units,
            additional_info,
        })
    }

    fn check_structure(&self, staging: &Path, manifest: &Manifest) -> Result<()> {
        let export = KeyExport::read(staging)?;
        let expected = manifest.info_u64("key_count").unwrap_or(0);
        if export.keys.len() as u64 != expected {
            return Err(BackupError::IntegrityCheckFailed(format!(
                "{} holds {} keys, manifest records {}",
                KEYS_FILE,
                export.keys.len(),
                expected
            )));
        }
        for record in &export.keys {
            if STANDARD.decode(&record.key).is_err() || STANDARD.decode(&record.value).is_err() {
                return Err(BackupError::IntegrityCheckFailed(format!(
                    "{} contains an undecodable record",
                    KEYS_FILE
                )));
            }
        }

        let rdb = staging.join(RDB_FILE);
        if rdb.exists() {
            let mut magic = [0u8; 5];
            let read = std::fs::File::open(&rdb)
                .and_then(|mut f| std::io::Read::read_exact(&mut f, &mut magic));
            if read.is_err() || magic != RDB_MAGIC {
                return Err(BackupError::IntegrityCheckFailed(format!(
                    "{} is not an RDB file",
                    RDB_FILE
                )));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RestoreDriver for KeyValueDriver {
    fn target(&self, test: bool) -> RestoreTarget {
        let db = if test { self.config.test_db } else { self.config.db };
        RestoreTarget {
            name: format!("db {}", db),
            test,
        }
    }

    fn planned_actions(&self, manifest: &Manifest, target: &RestoreTarget) -> Vec<String> {
        vec![
            format!("FLUSHDB on {} at {}", target.name, self.connector.address()),
            format!(
                "RESTORE {} keys with REPLACE",
                manifest.info_u64("key_count").unwrap_or(0)
            ),
        ]
    }

    async fn import(
        &self,
        credentials: &Credentials,
        staging: &Path,
        _manifest: &Manifest,
        target: &RestoreTarget,
    ) -> Result<UnitReport> {
        let export = KeyExport::read(staging)?;
        let db = if target.test { self.config.test_db } else { self.config.db };
        let store = self.connector.connect(db, credentials.secret()).await?;

        store.flushdb().await?;
        info!(db, keys = export.keys.len(), "Flushed target, restoring keys");

        let mut units = UnitReport::default();
        for record in &export.keys {
            let key = match STANDARD.decode(&record.key) {
                Ok(k) => k,
                Err(e) => {
                    units.fail(record.key.clone(), e);
                    continue;
                }
            };
            let name = String::from_utf8_lossy(&key).to_string();
            let restored = match STANDARD.decode(&record.value) {
                Ok(payload) => store.restore(&key, record.ttl_ms, &payload).await,
                Err(e) => Err(BackupError::IntegrityCheckFailed(e.to_string())),
            };
            match restored {
                Ok(()) => units.count_success(),
                Err(e) => units.fail(name, e),
            }
        }
        Ok(units)
    }
}

#[cfg(test)]
mod tests {
    use super::super::kv_store::testing::MemoryConnector;
    use super::*;
    use crate::executor::manifest::BackupType;
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;

    fn config() -> RedisConfig {
        RedisConfig {
            snapshot_timeout_secs: 2,
            poll_interval_secs: 1,
            ..RedisConfig::default()
        }
    }

    fn manifest_for(outcome: &ExportOutcome) -> Manifest {
        Manifest {
            timestamp: chrono::Utc::now().to_rfc3339(),
            service: ServiceKind::KeyValue,
            backup_type: BackupType::Full,
            version: outcome.version.clone(),
            size: 0,
            retention_days: 7,
            additional_info: outcome.additional_info.clone(),
        }
    }

    #[tokio::test]
    async fn test_backup_then_test_restore_round_trip() {
        let memory = MemoryConnector::new();
        for (k, v) in [("a", "1"), ("b", "2"), ("c", "3")] {
            memory.insert(0, k, v);
        }
        let driver = KeyValueDriver::new(config(), Arc::new(memory.clone()));
        let staging = TempDir::new().unwrap();

        let outcome = driver.export(&Credentials::none(), staging.path()).await.unwrap();
        assert_eq!(outcome.units.succeeded, 3);
        assert_eq!(outcome.additional_info["snapshot_fresh"], true);
        let manifest = manifest_for(&outcome);
        driver.check_structure(staging.path(), &manifest).unwrap();

        let target = driver.target(true);
        let report = driver
            .import(&Credentials::none(), staging.path(), &manifest, &target)
            .await
            .unwrap();

        assert_eq!(report.succeeded, 3);
        assert_eq!(report.failed, 0);
        let restored = memory.contents(15);
        assert_eq!(restored.len(), 3);
        assert_eq!(restored["a"], "1");
        assert_eq!(restored["b"], "2");
        assert_eq!(restored["c"], "3");
        assert_eq!(*memory.state.flushed.lock().unwrap(), vec![15]);
        // Production index untouched
        assert_eq!(memory.contents(0).len(), 3);
    }

    #[tokio::test]
    async fn test_stale_snapshot_proceeds() {
        let memory = MemoryConnector::new();
        memory.insert(0, "only", "value");
        memory.state.snapshots_complete.store(false, Ordering::SeqCst);
        let driver = KeyValueDriver::new(config(), Arc::new(memory));
        let staging = TempDir::new().unwrap();

        let outcome = driver.export(&Credentials::none(), staging.path()).await.unwrap();
        assert_eq!(outcome.additional_info["snapshot_fresh"], false);
        assert_eq!(outcome.additional_info["key_count"], 1);
    }

    #[tokio::test]
    async fn test_failing_key_is_recorded_not_fatal() {
        let memory = MemoryConnector::new();
        for k in ["a", "b", "c"] {
            memory.insert(0, k, "v");
        }
        let driver = KeyValueDriver::new(config(), Arc::new(memory.clone()));
        let staging = TempDir::new().unwrap();
        let outcome = driver.export(&Credentials::none(), staging.path()).await.unwrap();
        let manifest = manifest_for(&outcome);

        memory.state.failing_keys.lock().unwrap().insert(b"b".to_vec());
        let report = driver
            .import(&Credentials::none(), staging.path(), &manifest, &driver.target(true))
            .await
            .unwrap();
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.failed_names(), vec!["b"]);
    }

    #[tokio::test]
    async fn test_structure_rejects_count_mismatch_and_bad_rdb() {
        let memory = MemoryConnector::new();
        memory.insert(0, "a", "1");
        let driver = KeyValueDriver::new(config(), Arc::new(memory));
        let staging = TempDir::new().unwrap();
        let outcome = driver.export(&Credentials::none(), staging.path()).await.unwrap();

        let mut manifest = manifest_for(&outcome);
        manifest.additional_info.insert("key_count".into(), Value::from(5));
        assert!(driver.check_structure(staging.path(), &manifest).is_err());

        let manifest = manifest_for(&outcome);
        std::fs::write(staging.path().join(RDB_FILE), b"garbage").unwrap();
        assert!(driver.check_structure(staging.path(), &manifest).is_err());
        std::fs::write(staging.path().join(RDB_FILE), b"REDIS0011rest").unwrap();
        assert!(driver.check_structure(staging.path(), &manifest).is_ok());
    }

    #[test]
    fn test_targets_never_share_index() {
        let driver = KeyValueDriver::new(config(), Arc::new(MemoryConnector::new()));
        assert_ne!(driver.target(true).name, driver.target(false).name);
    }
}

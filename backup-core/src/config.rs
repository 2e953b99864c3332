//! Configuration management for backup, restore and disaster recovery.
//!
//! Loaded from a TOML file. Environment overrides are applied by the binaries'
//! entry points only; library code receives a fully-built [`Config`].

use crate::service::ServiceKind;
use crate::utils::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub encryption: EncryptionConfig,
    #[serde(default)]
    pub notification: NotificationConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub postgres: PostgresConfig,
    #[serde(default)]
    pub influxdb: InfluxConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub disaster_recovery: DisasterRecoveryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root of the artifact tree (`<base>/<service>/...`)
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,

    /// Scratch space for per-run working directories and restore sessions
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,

    /// Reported in notifications
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Reported in notifications
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_keep_daily")]
    pub keep_daily: u32,
    #[serde(default = "default_keep_weekly")]
    pub keep_weekly: u32,
    #[serde(default = "default_keep_monthly")]
    pub keep_monthly: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionConfig {
    /// Secret reference holding the symmetric key material
    #[serde(default = "default_key_file")]
    pub key_file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// Webhook receiving JSON status messages; notifications are disabled when unset
    #[serde(default)]
    pub webhook_url: Option<String>,

    #[serde(default = "default_notify_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteType {
    None,
    S3,
    Rsync,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    #[serde(default = "default_remote_type")]
    pub remote_type: RemoteType,

    /// `s3://bucket/prefix` or an rsync destination such as `host:/backups`
    #[serde(default)]
    pub uri: Option<String>,

    #[serde(default = "default_remote_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_postgres_port")]
    pub port: u16,
    #[serde(default = "default_postgres_user")]
    pub user: String,
    #[serde(default = "default_postgres_database")]
    pub database: String,
    /// Database restored into by `--test`; never the production database
    #[serde(default = "default_postgres_test_database")]
    pub test_database: String,
    #[serde(default = "default_postgres_password_file")]
    pub password_file: PathBuf,
    #[serde(default = "default_postgres_min_size")]
    pub min_size_bytes: u64,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfluxConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_influx_port")]
    pub port: u16,
    #[serde(default = "default_influx_org")]
    pub org: String,
    #[serde(default = "default_influx_token_file")]
    pub token_file: PathBuf,
    /// Buckets to back up; discovered from the server when empty
    #[serde(default)]
    pub buckets: Vec<String>,
    /// Appended to every bucket name when restoring with `--test`
    #[serde(default = "default_test_bucket_suffix")]
    pub test_bucket_suffix: String,
    #[serde(default = "default_min_size")]
    pub min_size_bytes: u64,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_redis_port")]
    pub port: u16,
    #[serde(default)]
    pub db: i64,
    /// Logical database restored into by `--test`
    #[serde(default = "default_redis_test_db")]
    pub test_db: i64,
    /// Optional; when set the file must exist
    #[serde(default)]
    pub password_file: Option<PathBuf>,
    #[serde(default = "default_snapshot_timeout")]
    pub snapshot_timeout_secs: u64,
    #[serde(default = "default_snapshot_poll")]
    pub poll_interval_secs: u64,
    /// Locally mounted RDB file copied into the artifact after the snapshot
    #[serde(default)]
    pub rdb_path: Option<PathBuf>,
    /// Small key spaces legitimately encrypt to a few hundred bytes
    #[serde(default = "default_redis_min_size")]
    pub min_size_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "default_max_age_hours")]
    pub max_age_hours: u64,
    #[serde(default = "default_storage_alert_percent")]
    pub storage_alert_percent: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadConfig {
    pub namespace: String,
    pub deployment: String,
    #[serde(default = "default_replicas")]
    pub replicas: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisasterRecoveryConfig {
    #[serde(default = "default_phase_timeout")]
    pub phase_timeout_secs: u64,
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,
    #[serde(default = "default_dr_poll")]
    pub poll_interval_secs: u64,
    /// Deployments scaled down before and back up after the restores
    #[serde(default)]
    pub workloads: Vec<WorkloadConfig>,
}

// Default values
fn default_base_dir() -> PathBuf {
    PathBuf::from("/backups")
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("/tmp/platform-backup")
}

fn default_environment() -> String {
    "production".to_string()
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_keep_daily() -> u32 {
    7
}

fn default_keep_weekly() -> u32 {
    4
}

fn default_keep_monthly() -> u32 {
    6
}

fn default_key_file() -> PathBuf {
    PathBuf::from("/run/secrets/backup-encryption-key")
}

fn default_notify_timeout() -> u64 {
    10
}

fn default_remote_type() -> RemoteType {
    RemoteType::None
}

fn default_remote_timeout() -> u64 {
    1800
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_postgres_port() -> u16 {
    5432
}

fn default_postgres_user() -> String {
    "postgres".to_string()
}

fn default_postgres_database() -> String {
    "platform".to_string()
}

fn default_postgres_test_database() -> String {
    "platform_restore_test".to_string()
}

fn default_postgres_password_file() -> PathBuf {
    PathBuf::from("/run/secrets/postgres-password")
}

fn default_postgres_min_size() -> u64 {
    10 * 1024
}

fn default_min_size() -> u64 {
    1024
}

fn default_redis_min_size() -> u64 {
    256
}

fn default_command_timeout() -> u64 {
    3600
}

fn default_influx_port() -> u16 {
    8086
}

fn default_influx_org() -> String {
    "platform".to_string()
}

fn default_influx_token_file() -> PathBuf {
    PathBuf::from("/run/secrets/influxdb-token")
}

fn default_test_bucket_suffix() -> String {
    "_restore_test".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_redis_test_db() -> i64 {
    15
}

fn default_snapshot_timeout() -> u64 {
    300
}

fn default_snapshot_poll() -> u64 {
    2
}

fn default_max_age_hours() -> u64 {
    26
}

fn default_storage_alert_percent() -> u8 {
    85
}

fn default_replicas() -> u32 {
    1
}

fn default_phase_timeout() -> u64 {
    3600
}

fn default_drain_timeout() -> u64 {
    300
}

fn default_dr_poll() -> u64 {
    5
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            work_dir: default_work_dir(),
            environment: default_environment(),
            namespace: default_namespace(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            keep_daily: default_keep_daily(),
            keep_weekly: default_keep_weekly(),
            keep_monthly: default_keep_monthly(),
        }
    }
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            key_file: default_key_file(),
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            timeout_secs: default_notify_timeout(),
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            remote_type: default_remote_type(),
            uri: None,
            timeout_secs: default_remote_timeout(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_postgres_port(),
            user: default_postgres_user(),
            database: default_postgres_database(),
            test_database: default_postgres_test_database(),
            password_file: default_postgres_password_file(),
            min_size_bytes: default_postgres_min_size(),
            command_timeout_secs: default_command_timeout(),
        }
    }
}

impl Default for InfluxConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_influx_port(),
            org: default_influx_org(),
            token_file: default_influx_token_file(),
            buckets: Vec::new(),
            test_bucket_suffix: default_test_bucket_suffix(),
            min_size_bytes: default_min_size(),
            command_timeout_secs: default_command_timeout(),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_redis_port(),
            db: 0,
            test_db: default_redis_test_db(),
            password_file: None,
            snapshot_timeout_secs: default_snapshot_timeout(),
            poll_interval_secs: default_snapshot_poll(),
            rdb_path: None,
            min_size_bytes: default_redis_min_size(),
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            max_age_hours: default_max_age_hours(),
            storage_alert_percent: default_storage_alert_percent(),
        }
    }
}

impl Default for DisasterRecoveryConfig {
    fn default() -> Self {
        Self {
            phase_timeout_secs: default_phase_timeout(),
            drain_timeout_secs: default_drain_timeout(),
            poll_interval_secs: default_dr_poll(),
            workloads: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| BackupError::Config(format!("{}: {}", path.display(), e)))?;
        Ok(config)
    }

    /// Apply environment overrides. `lookup` is `std::env::var(..).ok()` at the
    /// entry point and a map in tests.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("BACKUP_BASE_DIR") {
            self.storage.base_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("BACKUP_WORK_DIR") {
            self.storage.work_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("BACKUP_ENCRYPTION_KEY_FILE") {
            self.encryption.key_file = PathBuf::from(v);
        }
        if let Some(v) = lookup("BACKUP_WEBHOOK_URL") {
            self.notification.webhook_url = Some(v).filter(|s| !s.is_empty());
        }
        if let Some(v) = lookup("ENVIRONMENT") {
            self.storage.environment = v;
        }
        if let Some(v) = lookup("NAMESPACE") {
            self.storage.namespace = v;
        }
        if let Some(v) = lookup("REMOTE_TYPE") {
            match v.to_ascii_lowercase().as_str() {
                "s3" => self.remote.remote_type = RemoteType::S3,
                "rsync" => self.remote.remote_type = RemoteType::Rsync,
                "none" | "" => self.remote.remote_type = RemoteType::None,
                other => tracing::warn!("Ignoring unknown REMOTE_TYPE '{}'", other),
            }
        }
        if let Some(v) = lookup("REMOTE_URI") {
            self.remote.uri = Some(v).filter(|s| !s.is_empty());
        }
        if let Some(v) = lookup("LOG_LEVEL") {
            self.log.level = v;
        }
        if let Some(v) = lookup("LOG_FORMAT") {
            self.log.format = v;
        }
    }

    /// Reject configurations that would let a test restore touch production.
    pub fn validate(&self) -> Result<()> {
        if self.postgres.test_database == self.postgres.database {
            return Err(BackupError::Config(
                "postgres.test_database must differ from postgres.database".into(),
            ));
        }
        if self.influxdb.test_bucket_suffix.is_empty() {
            return Err(BackupError::Config(
                "influxdb.test_bucket_suffix must not be empty".into(),
            ));
        }
        if self.redis.test_db == self.redis.db {
            return Err(BackupError::Config(
                "redis.test_db must differ from redis.db".into(),
            ));
        }
        let r = &self.retention;
        if r.keep_daily == 0 || r.keep_weekly == 0 || r.keep_monthly == 0 {
            return Err(BackupError::Config("retention values must be positive".into()));
        }
        if self.redis.snapshot_timeout_secs == 0
            || self.disaster_recovery.phase_timeout_secs == 0
            || self.postgres.command_timeout_secs == 0
            || self.influxdb.command_timeout_secs == 0
        {
            return Err(BackupError::Config("timeouts must be positive".into()));
        }
        if self.remote.remote_type != RemoteType::None && self.remote.uri.is_none() {
            return Err(BackupError::Config(
                "remote.uri is required when remote.remote_type is set".into(),
            ));
        }
        Ok(())
    }

    /// Directory holding one service's artifacts.
    pub fn service_dir(&self, kind: ServiceKind) -> PathBuf {
        self.storage.base_dir.join(kind.name())
    }

    /// Minimum acceptable artifact size for a service.
    pub fn min_size_bytes(&self, kind: ServiceKind) -> u64 {
        match kind {
            ServiceKind::Postgres => self.postgres.min_size_bytes,
            ServiceKind::TimeSeries => self.influxdb.min_size_bytes,
            ServiceKind::KeyValue => self.redis.min_size_bytes,
        }
    }

    /// Host and port probed before backups and after disaster recovery.
    pub fn endpoint(&self, kind: ServiceKind) -> (String, u16) {
        match kind {
            ServiceKind::Postgres => (self.postgres.host.clone(), self.postgres.port),
            ServiceKind::TimeSeries => (self.influxdb.host.clone(), self.influxdb.port),
            ServiceKind::KeyValue => (self.redis.host.clone(), self.redis.port),
        }
    }

    pub fn phase_timeout(&self) -> Duration {
        Duration::from_secs(self.disaster_recovery.phase_timeout_secs)
    }
}

//! Error types shared by every backup, restore and verification path.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Service {service} is unreachable at {endpoint}")]
    ServiceUnhealthy { service: String, endpoint: String },

    #[error("Credentials missing: {}", .0.display())]
    CredentialsMissing(PathBuf),

    #[error("Encryption key missing: {}", .0.display())]
    KeyMissing(PathBuf),

    #[error("Integrity check failed: {0}")]
    IntegrityCheckFailed(String),

    #[error("{failed} of {total} units failed")]
    PartialUnitFailure { failed: usize, total: usize },

    #[error("Phase {phase} exceeded its {seconds}s timeout")]
    PhaseTimeout { phase: String, seconds: u64 },

    #[error("Destructive action not confirmed: {0}")]
    DestructiveActionNotConfirmed(String),

    #[error("Manifest missing: {}", .0.display())]
    ManifestMissing(PathBuf),

    #[error("Manifest invalid: {0}")]
    ManifestInvalid(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{program} exited with code {code:?}: {stderr}")]
    Command {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("{program} timed out after {seconds}s")]
    CommandTimeout { program: String, seconds: u64 },

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Key-value store error: {0}")]
    KeyValue(#[from] redis::RedisError),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl BackupError {
    /// Errors the caller may log and continue past.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            BackupError::PartialUnitFailure { .. } | BackupError::PhaseTimeout { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;

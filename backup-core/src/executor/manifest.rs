//! Manifest types describing a backup artifact.
//!
//! The manifest is written as `manifest.json` inside the staged backup (so it
//! travels inside the encrypted artifact) and copied next to the artifact as a
//! sidecar carrying the artifact's checksum.

use crate::service::ServiceKind;
use crate::utils::{BackupError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

/// File name of the manifest inside a staged backup.
pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupType {
    /// Every unit exported
    Full,
    /// Some independent units failed and were skipped
    Partial,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// RFC 3339 creation time
    pub timestamp: String,
    pub service: ServiceKind,
    pub backup_type: BackupType,
    /// Server version reported by the service
    pub version: String,
    /// Bytes of staged payload, excluding the manifest itself
    pub size: u64,
    /// Daily retention in effect when the backup was taken
    pub retention_days: u32,
    /// Service-specific statistics
    #[serde(default)]
    pub additional_info: Map<String, Value>,
}

impl Manifest {
    /// Write `manifest.json` into a staging directory.
    pub fn write_to_dir(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(MANIFEST_FILE);
        std::fs::write(&path, serde_json::to_vec_pretty(self)?)?;
        Ok(path)
    }

    /// Read and parse `manifest.json` from an unpacked backup.
    pub fn read_from_dir(dir: &Path) -> Result<Self> {
        let path = dir.join(MANIFEST_FILE);
        let bytes = std::fs::read(&path).map_err(|_| BackupError::ManifestMissing(path.clone()))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| BackupError::ManifestInvalid(format!("{}: {}", path.display(), e)))
    }

    /// Reject a manifest that belongs to another service or lacks required fields.
    pub fn validate_for(&self, kind: ServiceKind) -> Result<()> {
        if self.service != kind {
            return Err(BackupError::ManifestInvalid(format!(
                "manifest is for {}, expected {}",
                self.service, kind
            )));
        }
        if chrono::DateTime::parse_from_rfc3339(&self.timestamp).is_err() {
            return Err(BackupError::ManifestInvalid(format!(
                "timestamp '{}' is not RFC 3339",
                self.timestamp
            )));
        }
        Ok(())
    }

    pub fn info_u64(&self, key: &str) -> Option<u64> {
        self.additional_info.get(key).and_then(Value::as_u64)
    }

    pub fn info_str(&self, key: &str) -> Option<&str> {
        self.additional_info.get(key).and_then(Value::as_str)
    }

    pub fn info_strings(&self, key: &str) -> Vec<String> {
        self.additional_info
            .get(key)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Manifest copy stored next to an artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SidecarManifest {
    #[serde(flatten)]
    pub manifest: Manifest,
    pub artifact: String,
    pub artifact_size: u64,
    pub artifact_sha256: String,
}

impl SidecarManifest {
    pub fn write(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }

    pub fn read(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|_| BackupError::ManifestMissing(path.to_path_buf()))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| BackupError::ManifestInvalid(format!("{}: {}", path.display(), e)))
    }
}

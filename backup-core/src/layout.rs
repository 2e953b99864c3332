//! On-disk artifact layout for one service.
//!
//! ```text
//! <base>/<service>/<service>_<YYYYmmdd_HHMMSS>.tar.zst.enc
//! <base>/<service>/<service>_<YYYYmmdd_HHMMSS>.manifest.json
//! <base>/<service>/latest_backup.tar.zst.enc -> <service>_<...>.tar.zst.enc
//! <base>/<service>/weekly/...
//! <base>/<service>/monthly/...
//! ```

use crate::fs::archive::ARCHIVE_EXTENSION;
use crate::retention::RetentionClass;
use crate::service::ServiceKind;
use crate::utils::{BackupError, Result};
use chrono::{DateTime, Local};
use serde::Serialize;
use std::path::{Path, PathBuf};

pub const ENCRYPTED_SUFFIX: &str = "enc";
pub const SIDECAR_SUFFIX: &str = "manifest.json";

/// File extension of every artifact.
pub fn artifact_extension() -> String {
    format!("{}.{}", ARCHIVE_EXTENSION, ENCRYPTED_SUFFIX)
}

/// `<service>_<timestamp>.tar.zst.enc`
pub fn artifact_name(kind: ServiceKind, timestamp: &str) -> String {
    format!("{}_{}.{}", kind.name(), timestamp, artifact_extension())
}

/// Name of the symlink pointing at the newest artifact.
pub fn latest_name() -> String {
    format!("latest_backup.{}", artifact_extension())
}

/// Sidecar manifest path for an artifact in any retention directory.
pub fn sidecar_path(artifact: &Path) -> PathBuf {
    let name = artifact
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let stem = name
        .strip_suffix(&format!(".{}", artifact_extension()))
        .unwrap_or(&name);
    artifact.with_file_name(format!("{}.{}", stem, SIDECAR_SUFFIX))
}

/// Directory holding artifacts of one retention class.
pub fn class_dir(service_dir: &Path, class: RetentionClass) -> PathBuf {
    match class {
        RetentionClass::Daily => service_dir.to_path_buf(),
        RetentionClass::Weekly => service_dir.join("weekly"),
        RetentionClass::Monthly => service_dir.join("monthly"),
    }
}

fn is_artifact_name(kind: ServiceKind, name: &str) -> bool {
    name.starts_with(&format!("{}_", kind.name()))
        && name.ends_with(&format!(".{}", artifact_extension()))
        && name != latest_name()
}

#[derive(Debug, Clone, Serialize)]
pub struct ArtifactInfo {
    pub path: PathBuf,
    pub size: u64,
    pub modified: DateTime<Local>,
    pub class: RetentionClass,
    pub has_sidecar: bool,
}

impl ArtifactInfo {
    /// Age relative to `now`, clamped at zero for clock skew.
    pub fn age(&self, now: DateTime<Local>) -> chrono::Duration {
        (now - self.modified).max(chrono::Duration::zero())
    }
}

/// Regular artifact files of one class. Symlinks, temp files and sidecars are
/// skipped; a missing directory yields an empty list.
pub fn list_class(
    service_dir: &Path,
    kind: ServiceKind,
    class: RetentionClass,
) -> Result<Vec<ArtifactInfo>> {
    let dir = class_dir(service_dir, class);
    let entries = match std::fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut artifacts = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if !is_artifact_name(kind, &name) {
            continue;
        }
        let meta = std::fs::symlink_metadata(entry.path())?;
        if !meta.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        artifacts.push(ArtifactInfo {
            has_sidecar: sidecar_path(&path).is_file(),
            size: meta.len(),
            modified: DateTime::<Local>::from(meta.modified()?),
            class,
            path,
        });
    }
    artifacts.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| b.path.cmp(&a.path)));
    Ok(artifacts)
}

/// All artifacts of a service across retention classes, newest first.
pub fn list_artifacts(service_dir: &Path, kind: ServiceKind) -> Result<Vec<ArtifactInfo>> {
    let mut all = Vec::new();
    for class in RetentionClass::ALL {
        all.extend(list_class(service_dir, kind, class)?);
    }
    all.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| b.path.cmp(&a.path)));
    Ok(all)
}

/// Newest daily artifact by filesystem mtime. The `latest` symlink is not
/// consulted, so a half-updated pointer never selects a stale artifact.
pub fn find_latest(service_dir: &Path, kind: ServiceKind) -> Result<ArtifactInfo> {
    list_class(service_dir, kind, RetentionClass::Daily)?
        .into_iter()
        .next()
        .ok_or_else(|| {
            BackupError::NotFound(format!(
                "no {} artifacts in {}",
                kind,
                service_dir.display()
            ))
        })
}

/// Explicit path if given, otherwise the newest artifact.
pub fn resolve_artifact(
    service_dir: &Path,
    kind: ServiceKind,
    explicit: Option<&Path>,
) -> Result<PathBuf> {
    match explicit {
        Some(path) if path.exists() => Ok(path.to_path_buf()),
        Some(path) => Err(BackupError::NotFound(format!(
            "backup file {}",
            path.display()
        ))),
        None => Ok(find_latest(service_dir, kind)?.path),
    }
}

/// Repoint `latest_backup.*` at `artifact`. The new link is created under a
/// temporary name and renamed over the old one so readers never observe a
/// missing pointer.
pub fn update_latest(service_dir: &Path, artifact: &Path) -> Result<PathBuf> {
    let target = artifact
        .file_name()
        .ok_or_else(|| BackupError::NotFound(format!("artifact {}", artifact.display())))?;
    let latest = service_dir.join(latest_name());
    let tmp = service_dir.join(format!(
        ".{}.{}",
        latest_name(),
        uuid::Uuid::new_v4().simple()
    ));

    #[cfg(unix)]
    std::os::unix::fs::symlink(target, &tmp)?;
    #[cfg(not(unix))]
    std::fs::copy(artifact, &tmp)?;

    if let Err(e) = std::fs::rename(&tmp, &latest) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e.into());
    }
    tracing::debug!(latest = %latest.display(), "Updated latest pointer");
    Ok(latest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    fn touch(path: &Path, age: Duration) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"artifact").unwrap();
        let file = std::fs::File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - age).unwrap();
    }

    #[test]
    fn test_names() {
        assert_eq!(
            artifact_name(ServiceKind::Postgres, "20240310_020000"),
            "postgres_20240310_020000.tar.zst.enc"
        );
        assert_eq!(latest_name(), "latest_backup.tar.zst.enc");
        assert_eq!(
            sidecar_path(Path::new("/b/redis/weekly/redis_20240310_020000.tar.zst.enc")),
            PathBuf::from("/b/redis/weekly/redis_20240310_020000.manifest.json")
        );
    }

    #[test]
    fn test_find_latest_uses_mtime() {
        let dir = TempDir::new().unwrap();
        let older_name = dir.path().join(artifact_name(ServiceKind::KeyValue, "20240310_020000"));
        let newer_name = dir.path().join(artifact_name(ServiceKind::KeyValue, "20240101_020000"));
        // Name order and mtime order disagree on purpose.
        touch(&older_name, Duration::from_secs(7200));
        touch(&newer_name, Duration::from_secs(60));

        let latest = find_latest(dir.path(), ServiceKind::KeyValue).unwrap();
        assert_eq!(latest.path, newer_name);
    }

    #[test]
    fn test_find_latest_empty() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            find_latest(&dir.path().join("missing"), ServiceKind::Postgres),
            Err(BackupError::NotFound(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_update_latest_and_listing_skips_symlink() {
        let dir = TempDir::new().unwrap();
        let first = dir.path().join(artifact_name(ServiceKind::Postgres, "20240309_020000"));
        let second = dir.path().join(artifact_name(ServiceKind::Postgres, "20240310_020000"));
        touch(&first, Duration::from_secs(86400));
        touch(&second, Duration::from_secs(10));
        std::fs::write(sidecar_path(&second), b"{}").unwrap();

        update_latest(dir.path(), &first).unwrap();
        let latest = update_latest(dir.path(), &second).unwrap();
        assert_eq!(
            std::fs::read_link(&latest).unwrap(),
            PathBuf::from(second.file_name().unwrap())
        );

        let listed = list_artifacts(dir.path(), ServiceKind::Postgres).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].path, second);
        assert!(listed[0].has_sidecar);
        assert!(!listed[1].has_sidecar);

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with('.'))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_resolve_explicit_missing() {
        let dir = TempDir::new().unwrap();
        let result = resolve_artifact(
            dir.path(),
            ServiceKind::TimeSeries,
            Some(&dir.path().join("nope.tar.zst.enc")),
        );
        assert!(matches!(result, Err(BackupError::NotFound(_))));
    }
}

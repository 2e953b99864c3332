//! Artifact integrity checks and checksums.

use super::archive;
use crate::crypto;
use crate::utils::{BackupError, Result};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::path::Path;

/// Default minimum artifact size
pub const DEFAULT_MIN_SIZE: u64 = 1024;

/// Check that an artifact exists, is at least `min_size` bytes and passes the
/// self-check for its format: encrypted framing for `.enc`, a full
/// decompression test for `.zst`.
pub fn verify_integrity(path: &Path, min_size: u64) -> Result<()> {
    let metadata = std::fs::metadata(path).map_err(|_| {
        BackupError::IntegrityCheckFailed(format!("{} does not exist", path.display()))
    })?;
    if !metadata.is_file() {
        return Err(BackupError::IntegrityCheckFailed(format!(
            "{} is not a regular file",
            path.display()
        )));
    }
    if metadata.len() < min_size {
        return Err(BackupError::IntegrityCheckFailed(format!(
            "{} is {} bytes, below the {} byte minimum",
            path.display(),
            metadata.len(),
            min_size
        )));
    }

    let name = path.to_string_lossy();
    if name.ends_with(".enc") {
        crypto::check_encrypted_header(path)?;
    } else if name.ends_with(".zst") {
        archive::test_stream(path)?;
    }

    tracing::debug!(artifact = %path.display(), size = metadata.len(), "Integrity check passed");
    Ok(())
}

/// Boolean form of [`verify_integrity`]; the failure reason is logged.
pub fn is_intact(path: &Path, min_size: u64) -> bool {
    match verify_integrity(path, min_size) {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(artifact = %path.display(), "{}", e);
            false
        }
    }
}

/// Computes the SHA-256 digest of a file as lowercase hex.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::ArtifactCipher;
    use tempfile::TempDir;

    #[test]
    fn test_missing_artifact() {
        let dir = TempDir::new().unwrap();
        assert!(!is_intact(&dir.path().join("absent.tar.zst.enc"), 0));
    }

    #[test]
    fn test_size_threshold() {
        let dir = TempDir::new().unwrap();
        let cipher = ArtifactCipher::from_material(b"k").unwrap();
        let path = dir.path().join("postgres_20240101_000000.tar.zst.enc");
        std::fs::write(&path, cipher.encrypt(&vec![1u8; 2048]).unwrap()).unwrap();

        assert!(verify_integrity(&path, DEFAULT_MIN_SIZE).is_ok());
        assert!(matches!(
            verify_integrity(&path, 10 * 1024),
            Err(BackupError::IntegrityCheckFailed(_))
        ));
    }

    #[test]
    fn test_format_self_check() {
        let dir = TempDir::new().unwrap();
        let fake_enc = dir.path().join("redis.tar.zst.enc");
        std::fs::write(&fake_enc, vec![0u8; 4096]).unwrap();
        assert!(!is_intact(&fake_enc, DEFAULT_MIN_SIZE));

        let fake_zst = dir.path().join("redis.tar.zst");
        std::fs::write(&fake_zst, vec![0u8; 4096]).unwrap();
        assert!(!is_intact(&fake_zst, DEFAULT_MIN_SIZE));
    }

    #[test]
    fn test_sha256_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data");
        std::fs::write(&path, b"abc").unwrap();
        assert_eq!(
            sha256_file(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}

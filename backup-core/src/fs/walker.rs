//! Deterministic traversal of a staging directory.
//!
//! Entries come back sorted by path so that archives built from the same
//! directory contents are byte-identical.

use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Information about an entry discovered during walking
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Full path to the entry
    pub path: PathBuf,

    /// Relative path from the root
    pub relative_path: PathBuf,

    /// File size in bytes (0 for directories)
    pub size: u64,

    /// Is this a directory?
    pub is_dir: bool,
}

/// Walk a staging tree and collect every file and directory below `root`.
///
/// Symlinks are rejected: a staging directory only ever holds regular files
/// written by the service exporters.
pub fn walk_directory(root: &Path) -> std::io::Result<Vec<FileInfo>> {
    let mut entries = Vec::new();

    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = entry?;
        if entry.depth() == 0 {
            continue;
        }

        let file_type = entry.file_type();
        if file_type.is_symlink() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("symlink in staging directory: {}", entry.path().display()),
            ));
        }

        let path = entry.path().to_path_buf();
        let relative_path = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
        let size = if file_type.is_dir() { 0 } else { entry.metadata()?.len() };

        entries.push(FileInfo {
            path,
            relative_path,
            size,
            is_dir: file_type.is_dir(),
        });
    }

    Ok(entries)
}

/// Calculate total size of all files below `root`
pub fn calculate_total_size(root: &Path) -> std::io::Result<u64> {
    Ok(walk_directory(root)?.iter().map(|f| f.size).sum())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_walk_empty_directory() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let files = walk_directory(temp_dir.path())?;
        assert_eq!(files.len(), 0);
        Ok(())
    }

    #[test]
    fn test_walk_is_sorted() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;

        fs::create_dir(temp_dir.path().join("buckets"))?;
        fs::write(temp_dir.path().join("manifest.json"), b"{}")?;
        fs::write(temp_dir.path().join("buckets/metrics.tar"), b"content2")?;
        fs::write(temp_dir.path().join("alpha.txt"), b"content1")?;

        let files = walk_directory(temp_dir.path())?;
        let names: Vec<_> = files
            .iter()
            .map(|f| f.relative_path.to_string_lossy().to_string())
            .collect();
        assert_eq!(
            names,
            vec!["alpha.txt", "buckets", "buckets/metrics.tar", "manifest.json"]
        );
        assert!(files[1].is_dir);
        Ok(())
    }

    #[test]
    fn test_calculate_total_size() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;

        fs::write(temp_dir.path().join("file1.txt"), b"12345")?; // 5 bytes
        fs::create_dir(temp_dir.path().join("sub"))?;
        fs::write(temp_dir.path().join("sub/file2.txt"), b"1234567")?; // 7 bytes

        assert_eq!(calculate_total_size(temp_dir.path())?, 12);
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinks_rejected() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        fs::write(temp_dir.path().join("real"), b"x")?;
        std::os::unix::fs::symlink(temp_dir.path().join("real"), temp_dir.path().join("link"))?;
        assert!(walk_directory(temp_dir.path()).is_err());
        Ok(())
    }
}

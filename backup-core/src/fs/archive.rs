//! Deterministic tar + zstd container for staged backup directories.

use super::walker::walk_directory;
use crate::utils::{BackupError, Result};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Component, Path};
use tar::{Archive, Builder, EntryType, Header};

/// Extension of an unencrypted archive.
pub const ARCHIVE_EXTENSION: &str = "tar.zst";

const ZSTD_LEVEL: i32 = 3;

/// Pack `source_dir` into a zstd-compressed tar at `dest`. Entry order, mtimes,
/// owners and modes are normalised so identical inputs give identical bytes.
/// Returns the archive size.
pub fn compress(source_dir: &Path, dest: &Path) -> Result<u64> {
    if !source_dir.is_dir() {
        return Err(BackupError::Archive(format!(
            "{} is not a directory",
            source_dir.display()
        )));
    }

    let entries = walk_directory(source_dir)?;
    let file = BufWriter::new(File::create(dest)?);
    let encoder = zstd::stream::write::Encoder::new(file, ZSTD_LEVEL)?;
    let mut builder = Builder::new(encoder);

    for entry in &entries {
        let mut header = Header::new_gnu();
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        if entry.is_dir {
            header.set_entry_type(EntryType::Directory);
            header.set_mode(0o755);
            header.set_size(0);
            builder.append_data(&mut header, &entry.relative_path, std::io::empty())?;
        } else {
            header.set_entry_type(EntryType::Regular);
            header.set_mode(0o644);
            header.set_size(entry.size);
            let data = BufReader::new(File::open(&entry.path)?);
            builder.append_data(&mut header, &entry.relative_path, data)?;
        }
    }

    let encoder = builder.into_inner()?;
    let mut file = encoder.finish()?;
    file.flush()?;
    file.get_ref().sync_all()?;

    Ok(std::fs::metadata(dest)?.len())
}

/// Unpack an archive produced by [`compress`] into `dest_dir`. Only regular
/// files and directories with relative, non-escaping paths are accepted.
pub fn decompress(archive_path: &Path, dest_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dest_dir)?;
    let decoder = zstd::stream::read::Decoder::new(File::open(archive_path)?)?;
    let mut archive = Archive::new(decoder);

    for entry in archive.entries()? {
        let mut entry = entry?;
        let entry_type = entry.header().entry_type();
        match entry_type {
            EntryType::Directory | EntryType::Regular => {}
            other => {
                return Err(BackupError::Archive(format!(
                    "unsupported entry type {:?}",
                    other
                )))
            }
        }

        let path = entry.path()?.into_owned();
        if !is_safe_relative(&path) {
            return Err(BackupError::Archive(format!(
                "unsafe path in archive: {}",
                path.display()
            )));
        }

        let dest_path = dest_dir.join(&path);
        if entry_type == EntryType::Directory {
            std::fs::create_dir_all(&dest_path)?;
        } else {
            if let Some(parent) = dest_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            entry.unpack(&dest_path)?;
        }
    }

    Ok(())
}

/// Decode the whole zstd stream without writing anything; the compressed
/// stream test used by integrity checks.
pub fn test_stream(archive_path: &Path) -> Result<u64> {
    let mut decoder = zstd::stream::read::Decoder::new(File::open(archive_path)?)?;
    std::io::copy(&mut decoder, &mut std::io::sink())
        .map_err(|e| BackupError::IntegrityCheckFailed(format!("compressed stream test: {}", e)))
}

fn is_safe_relative(path: &Path) -> bool {
    path.components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn stage(dir: &Path) {
        fs::create_dir_all(dir.join("buckets/metrics")).unwrap();
        fs::write(dir.join("manifest.json"), br#"{"service":"influxdb"}"#).unwrap();
        fs::write(dir.join("buckets/metrics/shard.tar"), vec![9u8; 4096]).unwrap();
    }

    #[test]
    fn test_compress_decompress() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        let out = temp.path().join("out");
        let archive = temp.path().join("backup.tar.zst");
        stage(&src);

        let size = compress(&src, &archive).unwrap();
        assert!(size > 0);
        assert!(test_stream(&archive).unwrap() > 4096);

        decompress(&archive, &out).unwrap();
        assert_eq!(
            fs::read(out.join("buckets/metrics/shard.tar")).unwrap(),
            vec![9u8; 4096]
        );
        assert_eq!(
            fs::read_to_string(out.join("manifest.json")).unwrap(),
            r#"{"service":"influxdb"}"#
        );
    }

    #[test]
    fn test_compress_is_deterministic() {
        let temp = TempDir::new().unwrap();
        let a = temp.path().join("a");
        let b = temp.path().join("b");
        stage(&a);
        std::thread::sleep(std::time::Duration::from_millis(20));
        stage(&b);

        compress(&a, &temp.path().join("a.tar.zst")).unwrap();
        compress(&b, &temp.path().join("b.tar.zst")).unwrap();
        assert_eq!(
            fs::read(temp.path().join("a.tar.zst")).unwrap(),
            fs::read(temp.path().join("b.tar.zst")).unwrap()
        );
    }

    #[test]
    fn test_corrupt_stream_detected() {
        let temp = TempDir::new().unwrap();
        let bogus = temp.path().join("bogus.tar.zst");
        fs::write(&bogus, b"definitely not zstd").unwrap();
        assert!(test_stream(&bogus).is_err());
    }

    #[test]
    fn test_safe_paths() {
        assert!(is_safe_relative(Path::new("buckets/metrics/a")));
        assert!(!is_safe_relative(Path::new("../etc/passwd")));
        assert!(!is_safe_relative(Path::new("/etc/passwd")));
    }
}

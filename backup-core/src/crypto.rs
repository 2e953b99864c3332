//! Artifact encryption at rest.
//!
//! Artifacts are encrypted with AES-256-GCM in fixed-size frames so that large
//! dumps never have to be held in memory. Layout:
//!
//! - 8 bytes: magic header `PBKENC01`
//! - 8 bytes: random nonce prefix
//! - frames: 1 byte final-flag, 4 bytes little-endian ciphertext length, ciphertext + tag
//!
//! Each frame's nonce is the prefix followed by the big-endian frame counter,
//! and the final-flag is authenticated as associated data, so reordered,
//! dropped or truncated frames fail to decrypt.

use crate::secrets::{read_secret, SecretKind};
use crate::utils::{BackupError, Result};
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

/// Magic bytes identifying an encrypted artifact
pub const ENCRYPTED_MAGIC: &[u8; 8] = b"PBKENC01";

/// Plaintext bytes per frame
pub const FRAME_SIZE: usize = 1024 * 1024;

const PREFIX_SIZE: usize = 8;
const TAG_SIZE: usize = 16;
const HEADER_SIZE: usize = ENCRYPTED_MAGIC.len() + PREFIX_SIZE;
const FRAME_HEADER_SIZE: usize = 5;

/// Symmetric cipher keyed from a secret reference.
#[derive(Clone)]
pub struct ArtifactCipher {
    cipher: Aes256Gcm,
}

impl ArtifactCipher {
    /// Load key material from the key file. Fails with `KeyMissing` rather than
    /// ever falling back to plaintext.
    pub fn from_key_file(path: &Path) -> Result<Self> {
        let material = read_secret(path, SecretKind::EncryptionKey)?;
        Self::from_material(&material)
    }

    /// Derive the 256-bit key as SHA-256 of the key material.
    pub fn from_material(material: &[u8]) -> Result<Self> {
        let digest = Sha256::digest(material);
        let cipher = Aes256Gcm::new_from_slice(&digest)
            .map_err(|e| BackupError::Crypto(format!("invalid key length: {}", e)))?;
        Ok(Self { cipher })
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(plaintext.len() + HEADER_SIZE + 64);
        self.encrypt_stream(plaintext, &mut out)?;
        Ok(out)
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(ciphertext.len());
        self.decrypt_stream(ciphertext, &mut out)?;
        Ok(out)
    }

    /// Encrypt `src` into a new file at `dst`. Returns the ciphertext size.
    pub fn encrypt_file(&self, src: &Path, dst: &Path) -> Result<u64> {
        let reader = BufReader::new(File::open(src)?);
        let mut writer = BufWriter::new(File::create(dst)?);
        let written = self.encrypt_stream(reader, &mut writer)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(written)
    }

    /// Decrypt `src` into a new file at `dst`. Returns the plaintext size.
    pub fn decrypt_file(&self, src: &Path, dst: &Path) -> Result<u64> {
        let reader = BufReader::new(File::open(src)?);
        let mut writer = BufWriter::new(File::create(dst)?);
        let written = self.decrypt_stream(reader, &mut writer)?;
        writer.flush()?;
        Ok(written)
    }

    pub fn encrypt_stream<R: Read, W: Write>(&self, mut reader: R, mut writer: W) -> Result<u64> {
        let mut prefix = [0u8; PREFIX_SIZE];
        rand::thread_rng().fill_bytes(&mut prefix);

        writer.write_all(ENCRYPTED_MAGIC)?;
        writer.write_all(&prefix)?;
        let mut written = HEADER_SIZE as u64;

        let mut current = vec![0u8; FRAME_SIZE];
        let mut next = vec![0u8; FRAME_SIZE];
        let mut current_len = read_full(&mut reader, &mut current)?;
        let mut counter: u32 = 0;

        loop {
            // Look ahead one frame to know whether this one is final.
            let next_len = if current_len == FRAME_SIZE {
                read_full(&mut reader, &mut next)?
            } else {
                0
            };
            let is_final = next_len == 0;
            let flag = [is_final as u8];

            let nonce = frame_nonce(&prefix, counter);
            let sealed = self
                .cipher
                .encrypt(
                    Nonce::from_slice(&nonce),
                    Payload {
                        msg: &current[..current_len],
                        aad: &flag,
                    },
                )
                .map_err(|e| BackupError::Crypto(format!("encryption failed: {}", e)))?;

            writer.write_all(&flag)?;
            writer.write_all(&(sealed.len() as u32).to_le_bytes())?;
            writer.write_all(&sealed)?;
            written += (FRAME_HEADER_SIZE + sealed.len()) as u64;

            if is_final {
                break;
            }
            std::mem::swap(&mut current, &mut next);
            current_len = next_len;
            counter = counter
                .checked_add(1)
                .ok_or_else(|| BackupError::Crypto("too many frames".into()))?;
        }

        Ok(written)
    }

    pub fn decrypt_stream<R: Read, W: Write>(&self, mut reader: R, mut writer: W) -> Result<u64> {
        let prefix = read_header(&mut reader)?;
        let mut counter: u32 = 0;
        let mut written = 0u64;

        loop {
            let mut frame_header = [0u8; FRAME_HEADER_SIZE];
            if read_full(&mut reader, &mut frame_header)? != FRAME_HEADER_SIZE {
                return Err(BackupError::IntegrityCheckFailed(
                    "encrypted artifact is truncated".into(),
                ));
            }
            let flag = frame_header[0];
            let len = u32::from_le_bytes([
                frame_header[1],
                frame_header[2],
                frame_header[3],
                frame_header[4],
            ]) as usize;
            if flag > 1 || len < TAG_SIZE || len > FRAME_SIZE + TAG_SIZE {
                return Err(BackupError::IntegrityCheckFailed(format!(
                    "malformed frame {} (flag {}, length {})",
                    counter, flag, len
                )));
            }

            let mut sealed = vec![0u8; len];
            if read_full(&mut reader, &mut sealed)? != len {
                return Err(BackupError::IntegrityCheckFailed(
                    "encrypted artifact is truncated".into(),
                ));
            }

            let nonce = frame_nonce(&prefix, counter);
            let plain = self
                .cipher
                .decrypt(
                    Nonce::from_slice(&nonce),
                    Payload {
                        msg: &sealed,
                        aad: &[flag],
                    },
                )
                .map_err(|_| {
                    BackupError::Crypto(format!(
                        "decryption failed at frame {} (wrong key or corrupted data)",
                        counter
                    ))
                })?;
            writer.write_all(&plain)?;
            written += plain.len() as u64;

            if flag == 1 {
                break;
            }
            counter = counter
                .checked_add(1)
                .ok_or_else(|| BackupError::Crypto("too many frames".into()))?;
        }

        let mut trailing = [0u8; 1];
        if reader.read(&mut trailing)? != 0 {
            return Err(BackupError::IntegrityCheckFailed(
                "unexpected data after final frame".into(),
            ));
        }
        Ok(written)
    }
}

/// Cheap structural check of an encrypted artifact without the key: magic
/// header present and first frame header plausible.
pub fn check_encrypted_header(path: &Path) -> Result<()> {
    let mut reader = BufReader::new(File::open(path)?);
    read_header(&mut reader)?;

    let mut frame_header = [0u8; FRAME_HEADER_SIZE];
    if read_full(&mut reader, &mut frame_header)? != FRAME_HEADER_SIZE {
        return Err(BackupError::IntegrityCheckFailed(
            "encrypted artifact has no frames".into(),
        ));
    }
    let len = u32::from_le_bytes([
        frame_header[1],
        frame_header[2],
        frame_header[3],
        frame_header[4],
    ]) as usize;
    if frame_header[0] > 1 || len < TAG_SIZE || len > FRAME_SIZE + TAG_SIZE {
        return Err(BackupError::IntegrityCheckFailed(
            "encrypted artifact has a malformed first frame".into(),
        ));
    }
    Ok(())
}

/// Check if data starts with the encryption magic header
pub fn is_encrypted(data: &[u8]) -> bool {
    data.len() >= ENCRYPTED_MAGIC.len() && &data[..ENCRYPTED_MAGIC.len()] == ENCRYPTED_MAGIC
}

fn read_header<R: Read>(reader: &mut R) -> Result<[u8; PREFIX_SIZE]> {
    let mut header = [0u8; HEADER_SIZE];
    if read_full(reader, &mut header)? != HEADER_SIZE || !is_encrypted(&header) {
        return Err(BackupError::IntegrityCheckFailed(
            "missing encryption header".into(),
        ));
    }
    let mut prefix = [0u8; PREFIX_SIZE];
    prefix.copy_from_slice(&header[ENCRYPTED_MAGIC.len()..]);
    Ok(prefix)
}

fn frame_nonce(prefix: &[u8; PREFIX_SIZE], counter: u32) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[..PREFIX_SIZE].copy_from_slice(prefix);
    nonce[PREFIX_SIZE..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

/// Fill `buf` as far as the reader allows; returns bytes read (short only at EOF).
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_cipher() -> ArtifactCipher {
        ArtifactCipher::from_material(b"correct horse battery staple").unwrap()
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let cipher = test_cipher();
        let plaintext = b"Hello, World! This is a backup.";
        let ciphertext = cipher.encrypt(plaintext).unwrap();

        assert_ne!(&ciphertext[..], plaintext);
        assert!(is_encrypted(&ciphertext));
        assert_eq!(cipher.decrypt(&ciphertext).unwrap(), plaintext);
    }

    #[test]
    fn test_empty_and_multi_frame_payloads() {
        let cipher = test_cipher();
        assert!(cipher.decrypt(&cipher.encrypt(b"").unwrap()).unwrap().is_empty());

        // Exactly two frames, then two frames and a tail.
        for len in [FRAME_SIZE * 2, FRAME_SIZE * 2 + 17] {
            let plaintext: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let ciphertext = cipher.encrypt(&plaintext).unwrap();
            assert_eq!(cipher.decrypt(&ciphertext).unwrap(), plaintext);
        }
    }

    #[test]
    fn test_wrong_key_fails() {
        let ciphertext = test_cipher().encrypt(b"secret rows").unwrap();
        let other = ArtifactCipher::from_material(b"another key").unwrap();
        assert!(matches!(other.decrypt(&ciphertext), Err(BackupError::Crypto(_))));
    }

    #[test]
    fn test_truncation_detected() {
        let cipher = test_cipher();
        let plaintext = vec![7u8; FRAME_SIZE + 100];
        let ciphertext = cipher.encrypt(&plaintext).unwrap();

        // Drop the final frame entirely: the first frame is not flagged final.
        let first_frame_end = HEADER_SIZE + FRAME_HEADER_SIZE + FRAME_SIZE + TAG_SIZE;
        let truncated = &ciphertext[..first_frame_end];
        assert!(matches!(
            cipher.decrypt(truncated),
            Err(BackupError::IntegrityCheckFailed(_))
        ));

        // Flip the final-flag of the first frame: authentication must fail.
        let mut forged = truncated.to_vec();
        forged[HEADER_SIZE] = 1;
        assert!(cipher.decrypt(&forged).is_err());
    }

    #[test]
    fn test_missing_key_file() {
        let dir = TempDir::new().unwrap();
        let result = ArtifactCipher::from_key_file(&dir.path().join("nope"));
        assert!(matches!(result, Err(BackupError::KeyMissing(_))));
    }

    #[test]
    fn test_file_roundtrip_and_header_check() {
        let dir = TempDir::new().unwrap();
        let plain = dir.path().join("dump.tar.zst");
        let enc = dir.path().join("dump.tar.zst.enc");
        let out = dir.path().join("out.tar.zst");
        std::fs::write(&plain, vec![42u8; 5000]).unwrap();

        let cipher = test_cipher();
        cipher.encrypt_file(&plain, &enc).unwrap();
        check_encrypted_header(&enc).unwrap();
        assert_eq!(cipher.decrypt_file(&enc, &out).unwrap(), 5000);
        assert_eq!(std::fs::read(&out).unwrap(), vec![42u8; 5000]);

        // A plaintext file fails the header check.
        assert!(check_encrypted_header(&plain).is_err());
    }
}

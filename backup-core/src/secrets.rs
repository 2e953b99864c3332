//! Secret references resolved from files mounted by the secret distribution system.

use crate::utils::{BackupError, Result};
use std::fmt;
use std::path::Path;

/// What a secret reference is used for; decides the error reported when it is absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretKind {
    Credentials,
    EncryptionKey,
}

/// Read a secret file. Absent, unreadable or empty files are reported as
/// `CredentialsMissing` / `KeyMissing`; trailing whitespace is trimmed.
pub fn read_secret(path: &Path, kind: SecretKind) -> Result<Vec<u8>> {
    let missing = || match kind {
        SecretKind::Credentials => BackupError::CredentialsMissing(path.to_path_buf()),
        SecretKind::EncryptionKey => BackupError::KeyMissing(path.to_path_buf()),
    };

    let mut bytes = std::fs::read(path).map_err(|_| missing())?;
    while bytes.last().is_some_and(|b| b.is_ascii_whitespace()) {
        bytes.pop();
    }
    if bytes.is_empty() {
        return Err(missing());
    }
    Ok(bytes)
}

/// A resolved credential. `Debug` never prints the value.
#[derive(Clone, Default)]
pub struct Credentials(Option<String>);

impl Credentials {
    pub fn none() -> Self {
        Self(None)
    }

    /// Resolve an optional credential reference.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            None => Ok(Self::none()),
            Some(path) => {
                let bytes = read_secret(path, SecretKind::Credentials)?;
                let value = String::from_utf8(bytes)
                    .map_err(|_| BackupError::CredentialsMissing(path.to_path_buf()))?;
                Ok(Self(Some(value)))
            }
        }
    }

    pub fn secret(&self) -> Option<&str> {
        self.0.as_deref()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(_) => f.write_str("Credentials(***)"),
            None => f.write_str("Credentials(none)"),
        }
    }
}

//! Credential store adapter for the root identity
//!
//! The certificate authority only needs a named get/set blob store. Two
//! implementations are provided: an in-memory map for tests and embedding,
//! and a directory of files with owner-only permissions.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use crate::error::{Error, Result};

/// Name under which the root private key (PKCS#8 DER) is stored.
pub const PRIVATE_KEY: &str = "privateKey";

/// Name under which the root certificate (DER) is stored.
pub const CERTIFICATE: &str = "certificate";

/// A keychain-like store of named secrets.
pub trait CredentialStore: Send + Sync {
    /// Fetch a value. `Ok(None)` means the name has never been set.
    fn get(&self, name: &str) -> Result<Option<Vec<u8>>>;

    /// Store a value, replacing any previous one.
    fn set(&self, name: &str, value: &[u8]) -> Result<()>;
}

/// Volatile store backed by a map.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStore for MemoryStore {
    fn get(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(name).cloned())
    }

    fn set(&self, name: &str, value: &[u8]) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(name.to_string(), value.to_vec());
        Ok(())
    }
}

/// Store that keeps each value in its own file under a directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Open a store rooted at `dir`, creating the directory if needed.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(|e| {
            Error::store(format!(
                "Failed to create store directory '{}': {}",
                dir.display(),
                e
            ))
        })?;
        Ok(Self { dir })
    }

    /// Open the store in the platform data directory.
    pub fn open_default() -> Result<Self> {
        Self::open(default_store_dir()?)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(Error::store(format!("Invalid store key '{}'", name)));
        }
        Ok(self.dir.join(format!("{}.der", name)))
    }
}

impl CredentialStore for FileStore {
    fn get(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(name)?;
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::store(format!(
                "Failed to read '{}': {}",
                path.display(),
                e
            ))),
        }
    }

    fn set(&self, name: &str, value: &[u8]) -> Result<()> {
        let path = self.path_for(name)?;
        let tmp = path.with_extension("der.tmp");

        let write = || -> std::io::Result<()> {
            let mut options = std::fs::OpenOptions::new();
            options.write(true).create(true).truncate(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt;
                options.mode(0o600);
            }
            let mut file = options.open(&tmp)?;
            file.write_all(value)?;
            file.sync_all()?;
            std::fs::rename(&tmp, &path)
        };

        write().map_err(|e| {
            Error::store(format!("Failed to write '{}': {}", path.display(), e))
        })
    }
}

/// Platform data directory used when no store directory is configured.
pub fn default_store_dir() -> Result<PathBuf> {
    directories::ProjectDirs::from("", "", "tapwire")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or_else(|| Error::store("Could not determine a home directory for the store"))
}

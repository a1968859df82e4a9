//! On-disk local index for backends that cannot address entries by
//! (service, account) natively.
//!
//! The file is a small JSON document carrying a format version and a flat
//! list of entries. Callers hold the key store's [`FileLock`](crate::lock::FileLock)
//! around load, mutate and save.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{KeyringError, Result};

/// Current on-disk format version.
pub const INDEX_VERSION: u32 = 1;

/// An index entry keyed by (service, account).
pub trait IndexEntry {
    fn service(&self) -> &str;
    fn account(&self) -> &str;

    fn matches(&self, service: &str, account: &str) -> bool {
        self.service() == service && self.account() == account
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct IndexDocument<T> {
    version: u32,
    entries: T,
}

/// Versioned list of entries persisted at a key store path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIndex<E> {
    entries: Vec<E>,
}

impl<E> Default for LocalIndex<E> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<E> LocalIndex<E>
where
    E: IndexEntry + Serialize + DeserializeOwned,
{
    /// Load the index. A missing or empty file is an empty index.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(KeyringError::io(
                    format!("Failed to read key store {}", path.display()),
                    e,
                ));
            }
        };

        if bytes.is_empty() {
            return Ok(Self::default());
        }

        let document: IndexDocument<Vec<E>> =
            serde_json::from_slice(&bytes).map_err(|e| corrupt(path, e.to_string()))?;
        if document.version != INDEX_VERSION {
            return Err(corrupt(
                path,
                format!("unsupported format version {}", document.version),
            ));
        }

        Ok(Self {
            entries: document.entries,
        })
    }

    /// Write the index atomically via a temp file in the same directory.
    pub fn save(&self, path: &Path) -> Result<()> {
        let parent = parent_dir(path);
        ensure_dir(&parent)?;

        let document = IndexDocument {
            version: INDEX_VERSION,
            entries: &self.entries,
        };
        let json = serde_json::to_vec_pretty(&document)
            .map_err(|e| KeyringError::Backend(format!("Failed to serialize key store: {e}")))?;

        let mut temp_file = tempfile::NamedTempFile::new_in(&parent)
            .map_err(|e| KeyringError::io("Failed to create temp file", e))?;
        temp_file
            .write_all(&json)
            .map_err(|e| KeyringError::io("Failed to write temp file", e))?;
        temp_file
            .flush()
            .map_err(|e| KeyringError::io("Failed to flush temp file", e))?;
        temp_file.persist(path).map_err(|e| {
            KeyringError::io(
                format!("Failed to replace key store {}", path.display()),
                e.error,
            )
        })?;

        Ok(())
    }

    pub fn find(&self, service: &str, account: &str) -> Option<&E> {
        self.entries.iter().find(|e| e.matches(service, account))
    }

    pub fn find_mut(&mut self, service: &str, account: &str) -> Option<&mut E> {
        self.entries.iter_mut().find(|e| e.matches(service, account))
    }

    /// Insert or replace the entry for its key, returning the replaced one.
    pub fn upsert(&mut self, entry: E) -> Option<E> {
        match self
            .entries
            .iter()
            .position(|e| e.matches(entry.service(), entry.account()))
        {
            Some(pos) => Some(std::mem::replace(&mut self.entries[pos], entry)),
            None => {
                self.entries.push(entry);
                None
            }
        }
    }

    pub fn remove(&mut self, service: &str, account: &str) -> Option<E> {
        let pos = self
            .entries
            .iter()
            .position(|e| e.matches(service, account))?;
        Some(self.entries.remove(pos))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn corrupt(path: &Path, reason: String) -> KeyringError {
    KeyringError::CorruptIndex {
        path: path.to_path_buf(),
        reason,
    }
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Create the key store directory, owner-only on Unix when newly created.
pub(crate) fn ensure_dir(dir: &Path) -> Result<()> {
    if dir.is_dir() {
        return Ok(());
    }
    fs::create_dir_all(dir).map_err(|e| {
        KeyringError::io(format!("Failed to create key store dir {}", dir.display()), e)
    })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o700)).map_err(|e| {
            KeyringError::io(format!("Failed to set permissions on {}", dir.display()), e)
        })?;
    }

    Ok(())
}

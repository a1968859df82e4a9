//! In-memory backend
//!
//! Last-resort fallback that works everywhere. Nothing is encrypted and
//! nothing survives the process; each instance has its own entries.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::debug;

use super::{Backend, BackendId};
use crate::error::{KeyringError, Result, handle_lock_poison};
use crate::secret::Password;

type Key = (String, String);

#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<Key, Password>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries. Fails like the password operations once a
    /// writer has panicked while holding the entries.
    pub fn len(&self) -> Result<usize> {
        let entries = self.entries.lock().map_err(handle_lock_poison)?;
        Ok(entries.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        self.len().map(|n| n == 0)
    }

    fn key(service: &str, account: &str) -> Key {
        (service.to_string(), account.to_string())
    }
}

impl Backend for MemoryBackend {
    fn id(&self) -> BackendId {
        BackendId::Memory
    }

    fn get_password(&self, service: &str, account: &str) -> Result<Password> {
        let entries = self.entries.lock().map_err(handle_lock_poison)?;
        entries
            .get(&Self::key(service, account))
            .cloned()
            .ok_or_else(|| KeyringError::not_found(service, account))
    }

    fn set_password(&self, service: &str, account: &str, password: &str) -> Result<()> {
        debug!(service, account, "Storing password in memory");
        let mut entries = self.entries.lock().map_err(handle_lock_poison)?;
        entries.insert(Self::key(service, account), Password::new(password));
        Ok(())
    }

    fn delete_password(&self, service: &str, account: &str) -> Result<()> {
        let mut entries = self.entries.lock().map_err(handle_lock_poison)?;
        entries
            .remove(&Self::key(service, account))
            .map(drop)
            .ok_or_else(|| KeyringError::not_found(service, account))
    }
}

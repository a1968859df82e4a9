//! Storage backends.
//!
//! Each backend binds the uniform (service, account) -> password keyspace to
//! one native secret store. Native calls go through a small per-backend trait
//! so the bookkeeping around them can be exercised without the real store.

use std::path::{Path, PathBuf};

use crate::error::{KeyringError, Result};
use crate::secret::Password;

pub mod dpapi;
pub mod gnome_keyring;
pub mod keychain;
pub mod kwallet;
pub mod memory;
pub mod secret_service;

/// Identity of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendId {
    /// macOS Keychain
    Keychain,
    /// Windows DPAPI with a local encrypted index file
    WindowsDpapi,
    /// freedesktop.org Secret Service over D-Bus
    SecretService,
    /// KDE Wallet over D-Bus
    KWallet,
    /// libgnome-keyring with a local item id index file
    GnomeKeyring,
    /// Unencrypted, process-local storage
    Memory,
}

impl BackendId {
    /// Registered name of the backend.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Keychain => "keychain",
            Self::WindowsDpapi => "windows-dpapi",
            Self::SecretService => "secret-service",
            Self::KWallet => "kwallet",
            Self::GnomeKeyring => "gnome-keyring",
            Self::Memory => "memory",
        }
    }
}

impl std::fmt::Display for BackendId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backend trait for secret storage
pub trait Backend: Send + Sync {
    fn id(&self) -> BackendId;

    /// Whether this host's OS family and native facility can run the backend.
    fn is_supported(&self) -> bool {
        true
    }

    /// Whether the backend keeps its entries in a key store file.
    fn is_key_store_path_required(&self) -> bool {
        false
    }

    fn key_store_path(&self) -> Result<&Path> {
        Err(KeyringError::KeyStorePathUnsupported(self.id()))
    }

    fn set_key_store_path(&mut self, _path: PathBuf) -> Result<()> {
        Err(KeyringError::KeyStorePathUnsupported(self.id()))
    }

    /// Get the password stored for (service, account)
    fn get_password(&self, service: &str, account: &str) -> Result<Password>;

    /// Create or overwrite the password for (service, account)
    fn set_password(&self, service: &str, account: &str, password: &str) -> Result<()>;

    /// Delete the password for (service, account)
    fn delete_password(&self, service: &str, account: &str) -> Result<()>;
}

impl std::fmt::Debug for dyn Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend").field("id", &self.id()).finish()
    }
}

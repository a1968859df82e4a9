//! The `Keyring` facade.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::backend::{Backend, BackendId};
use crate::config::Config;
use crate::error::Result;
use crate::factory;
use crate::secret::Password;

/// Password store bound to one backend for its whole lifetime.
pub struct Keyring {
    backend: Box<dyn Backend>,
}

impl Keyring {
    /// Bind the first usable backend in default order.
    pub fn create() -> Result<Self> {
        factory::create().map(Self::from_backend)
    }

    /// Bind exactly `id`; fails with `BackendNotSupported` if it cannot run here.
    pub fn with_backend(id: BackendId) -> Result<Self> {
        factory::create_preferred(id).map(Self::from_backend)
    }

    /// Bind the backend registered under `name`.
    pub fn with_backend_name(name: &str) -> Result<Self> {
        factory::create_named(name).map(Self::from_backend)
    }

    /// Bind per `config`, then apply its key store path where one is used.
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut keyring = match &config.backend {
            Some(name) => Self::with_backend_name(name)?,
            None => Self::create()?,
        };

        if let Some(path) = &config.key_store_path {
            if keyring.is_key_store_path_required() {
                keyring.set_key_store_path(path.clone())?;
            } else {
                debug!(backend = %keyring.backend_id(), "Ignoring key store path");
            }
        }
        Ok(keyring)
    }

    /// Wrap an already constructed backend.
    pub fn from_backend(backend: Box<dyn Backend>) -> Self {
        Self { backend }
    }

    pub fn backend_id(&self) -> BackendId {
        self.backend.id()
    }

    pub fn is_key_store_path_required(&self) -> bool {
        self.backend.is_key_store_path_required()
    }

    pub fn key_store_path(&self) -> Result<&Path> {
        self.backend.key_store_path()
    }

    pub fn set_key_store_path(&mut self, path: impl Into<PathBuf>) -> Result<()> {
        self.backend.set_key_store_path(path.into())
    }

    pub fn get_password(&self, service: &str, account: &str) -> Result<Password> {
        self.backend.get_password(service, account)
    }

    pub fn set_password(&self, service: &str, account: &str, password: &str) -> Result<()> {
        self.backend.set_password(service, account, password)
    }

    pub fn delete_password(&self, service: &str, account: &str) -> Result<()> {
        self.backend.delete_password(service, account)
    }
}

impl std::fmt::Debug for Keyring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keyring")
            .field("backend", &self.backend_id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dpapi::fake::XorProtector;
    use crate::backend::dpapi::DpapiBackend;
    use crate::error::KeyringError;

    #[test]
    fn memory_scenario() {
        let keyring = Keyring::with_backend(BackendId::Memory).unwrap();
        keyring.set_password("acme.api", "alice", "p4ssw0rd!").unwrap();
        assert_eq!(
            keyring.get_password("acme.api", "alice").unwrap(),
            "p4ssw0rd!"
        );

        keyring.delete_password("acme.api", "alice").unwrap();
        assert!(keyring.get_password("acme.api", "alice").unwrap_err().is_not_found());
    }

    #[test]
    fn key_store_path_on_memory_is_unsupported() {
        let mut keyring = Keyring::with_backend_name("memory").unwrap();
        assert!(!keyring.is_key_store_path_required());
        assert!(matches!(
            keyring.key_store_path(),
            Err(KeyringError::KeyStorePathUnsupported(BackendId::Memory))
        ));
        assert!(keyring.set_key_store_path("keys.keystore").is_err());
    }

    #[test]
    fn key_store_path_is_forwarded() {
        let dir = tempfile::tempdir().unwrap();
        let backend =
            DpapiBackend::with_protector(XorProtector(0x21), dir.path().join("a.keystore"));
        let mut keyring = Keyring::from_backend(Box::new(backend));

        assert!(keyring.is_key_store_path_required());
        keyring.set_key_store_path(dir.path().join("b.keystore")).unwrap();
        assert_eq!(keyring.key_store_path().unwrap(), dir.path().join("b.keystore"));

        keyring.set_password("svc", "acct", "secret").unwrap();
        assert!(dir.path().join("b.keystore").exists());
        assert!(!dir.path().join("a.keystore").exists());
    }

    #[test]
    fn from_config_with_backend_name() {
        let config = Config::default()
            .with_backend("memory")
            .with_key_store_path("ignored.keystore");
        let keyring = Keyring::from_config(&config).unwrap();
        assert_eq!(keyring.backend_id(), BackendId::Memory);

        let err = Keyring::from_config(&Config::default().with_backend("nope")).unwrap_err();
        assert!(matches!(err, KeyringError::UnregisteredBackend(_)));
    }

    #[test]
    fn debug_shows_backend_only() {
        let keyring = Keyring::with_backend(BackendId::Memory).unwrap();
        assert_eq!(format!("{keyring:?}"), "Keyring { backend: Memory }");
    }
}

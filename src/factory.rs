//! Backend selection.
//!
//! The registry is an ordered list of (id, constructor) pairs. A candidate is
//! usable when its constructor succeeds and the constructed backend reports
//! `is_supported()`. Anything else, including a panic inside the constructor,
//! only demotes that candidate.

use std::panic::{self, AssertUnwindSafe};

use tracing::{debug, info};

use crate::backend::memory::MemoryBackend;
use crate::backend::{Backend, BackendId};
use crate::error::{KeyringError, Result};

/// Zero-argument backend constructor.
pub type Constructor = fn() -> Result<Box<dyn Backend>>;

/// Built-in registry in default probe order.
const REGISTRY: &[(BackendId, Constructor)] = &[
    (BackendId::Keychain, keychain),
    (BackendId::WindowsDpapi, windows_dpapi),
    (BackendId::SecretService, secret_service),
    (BackendId::KWallet, kwallet),
    (BackendId::GnomeKeyring, gnome_keyring),
    (BackendId::Memory, memory),
];

fn keychain() -> Result<Box<dyn Backend>> {
    #[cfg(target_os = "macos")]
    {
        use crate::backend::keychain::KeychainBackend;
        Ok(Box::new(KeychainBackend::new()?))
    }
    #[cfg(not(target_os = "macos"))]
    {
        Err(KeyringError::BackendNotSupported(BackendId::Keychain))
    }
}

fn windows_dpapi() -> Result<Box<dyn Backend>> {
    #[cfg(windows)]
    {
        use crate::backend::dpapi::DpapiBackend;
        Ok(Box::new(DpapiBackend::new()?))
    }
    #[cfg(not(windows))]
    {
        Err(KeyringError::BackendNotSupported(BackendId::WindowsDpapi))
    }
}

fn secret_service() -> Result<Box<dyn Backend>> {
    #[cfg(all(unix, not(target_os = "macos"), feature = "secret-service-backend"))]
    {
        use crate::backend::secret_service::SecretServiceBackend;
        Ok(Box::new(SecretServiceBackend::new()?))
    }
    #[cfg(not(all(unix, not(target_os = "macos"), feature = "secret-service-backend")))]
    {
        Err(KeyringError::BackendNotSupported(BackendId::SecretService))
    }
}

fn kwallet() -> Result<Box<dyn Backend>> {
    #[cfg(all(unix, not(target_os = "macos"), feature = "kwallet-backend"))]
    {
        use crate::backend::kwallet::KWalletBackend;
        Ok(Box::new(KWalletBackend::new()?))
    }
    #[cfg(not(all(unix, not(target_os = "macos"), feature = "kwallet-backend")))]
    {
        Err(KeyringError::BackendNotSupported(BackendId::KWallet))
    }
}

fn gnome_keyring() -> Result<Box<dyn Backend>> {
    #[cfg(all(unix, not(target_os = "macos"), feature = "gnome-keyring-backend"))]
    {
        use crate::backend::gnome_keyring::GnomeKeyringBackend;
        Ok(Box::new(GnomeKeyringBackend::new()?))
    }
    #[cfg(not(all(unix, not(target_os = "macos"), feature = "gnome-keyring-backend")))]
    {
        Err(KeyringError::BackendNotSupported(BackendId::GnomeKeyring))
    }
}

fn memory() -> Result<Box<dyn Backend>> {
    Ok(Box::new(MemoryBackend::new()))
}

/// Ordered set of candidate backends.
#[derive(Debug, Clone)]
pub struct BackendFactory {
    entries: Vec<(BackendId, Constructor)>,
}

impl Default for BackendFactory {
    fn default() -> Self {
        Self::new(REGISTRY.to_vec())
    }
}

impl BackendFactory {
    pub fn new(entries: Vec<(BackendId, Constructor)>) -> Self {
        Self { entries }
    }

    /// Append a candidate after the existing ones.
    pub fn register(mut self, id: BackendId, constructor: Constructor) -> Self {
        self.entries.push((id, constructor));
        self
    }

    /// Registered ids in probe order.
    pub fn ids(&self) -> Vec<BackendId> {
        self.entries.iter().map(|(id, _)| *id).collect()
    }

    /// Bind the first candidate that constructs and passes its probe.
    pub fn create(&self) -> Result<Box<dyn Backend>> {
        for (id, constructor) in &self.entries {
            if let Some(backend) = try_construct(*id, *constructor) {
                info!(backend = %id, "Selected keyring backend");
                return Ok(backend);
            }
        }
        Err(KeyringError::NoBackendAvailable)
    }

    /// Bind exactly `id`, with no fallback.
    pub fn create_preferred(&self, id: BackendId) -> Result<Box<dyn Backend>> {
        let (_, constructor) = self
            .entries
            .iter()
            .find(|(candidate, _)| *candidate == id)
            .ok_or_else(|| KeyringError::UnregisteredBackend(id.to_string()))?;

        let backend =
            try_construct(id, *constructor).ok_or(KeyringError::BackendNotSupported(id))?;
        info!(backend = %id, "Selected preferred keyring backend");
        Ok(backend)
    }

    /// Bind the backend registered under `name`.
    pub fn create_named(&self, name: &str) -> Result<Box<dyn Backend>> {
        let id = self
            .entries
            .iter()
            .map(|(id, _)| *id)
            .find(|id| id.as_str() == name)
            .ok_or_else(|| KeyringError::UnregisteredBackend(name.to_string()))?;
        self.create_preferred(id)
    }
}

fn try_construct(id: BackendId, constructor: Constructor) -> Option<Box<dyn Backend>> {
    let attempt = panic::catch_unwind(AssertUnwindSafe(|| {
        let backend = constructor()?;
        Ok::<_, KeyringError>(backend.is_supported().then_some(backend))
    }));

    match attempt {
        Ok(Ok(Some(backend))) => Some(backend),
        Ok(Ok(None)) => {
            debug!(backend = %id, "Backend failed its capability probe");
            None
        }
        Ok(Err(e)) => {
            debug!(backend = %id, error = %e, "Backend could not be constructed");
            None
        }
        Err(_) => {
            debug!(backend = %id, "Backend panicked during construction");
            None
        }
    }
}

/// Registered backend ids in default probe order.
pub fn registered_backends() -> Vec<BackendId> {
    BackendFactory::default().ids()
}

/// Bind the first usable backend in default order.
pub fn create() -> Result<Box<dyn Backend>> {
    BackendFactory::default().create()
}

pub fn create_preferred(id: BackendId) -> Result<Box<dyn Backend>> {
    BackendFactory::default().create_preferred(id)
}

pub fn create_named(name: &str) -> Result<Box<dyn Backend>> {
    BackendFactory::default().create_named(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secret::Password;

    /// Constructs fine but reports the native facility as unreachable.
    struct Unreachable(BackendId);

    impl Backend for Unreachable {
        fn id(&self) -> BackendId {
            self.0
        }
        fn is_supported(&self) -> bool {
            false
        }
        fn get_password(&self, service: &str, account: &str) -> Result<Password> {
            Err(KeyringError::not_found(service, account))
        }
        fn set_password(&self, _: &str, _: &str, _: &str) -> Result<()> {
            Ok(())
        }
        fn delete_password(&self, service: &str, account: &str) -> Result<()> {
            Err(KeyringError::not_found(service, account))
        }
    }

    fn panicking() -> Result<Box<dyn Backend>> {
        panic!("native library failed to link");
    }

    fn refusing() -> Result<Box<dyn Backend>> {
        Err(KeyringError::BackendNotSupported(BackendId::KWallet))
    }

    fn unreachable_keyring() -> Result<Box<dyn Backend>> {
        Ok(Box::new(Unreachable(BackendId::GnomeKeyring)))
    }

    #[test]
    fn default_order() {
        assert_eq!(
            registered_backends(),
            vec![
                BackendId::Keychain,
                BackendId::WindowsDpapi,
                BackendId::SecretService,
                BackendId::KWallet,
                BackendId::GnomeKeyring,
                BackendId::Memory,
            ]
        );
    }

    #[test]
    fn failing_candidates_fall_through_to_memory() {
        let factory = BackendFactory::new(Vec::new())
            .register(BackendId::Keychain, panicking)
            .register(BackendId::KWallet, refusing)
            .register(BackendId::GnomeKeyring, unreachable_keyring)
            .register(BackendId::Memory, memory);
        let backend = factory.create().unwrap();
        assert_eq!(backend.id(), BackendId::Memory);
    }

    #[test]
    fn exhausted_registry_is_no_backend_available() {
        let factory = BackendFactory::new(Vec::new())
            .register(BackendId::Keychain, panicking)
            .register(BackendId::GnomeKeyring, unreachable_keyring);
        assert!(matches!(
            factory.create().unwrap_err(),
            KeyringError::NoBackendAvailable
        ));
    }

    #[test]
    fn preferred_does_not_fall_back() {
        let factory = BackendFactory::new(Vec::new())
            .register(BackendId::GnomeKeyring, unreachable_keyring)
            .register(BackendId::Memory, memory);
        assert!(matches!(
            factory.create_preferred(BackendId::GnomeKeyring).unwrap_err(),
            KeyringError::BackendNotSupported(BackendId::GnomeKeyring)
        ));
        assert_eq!(
            factory.create_preferred(BackendId::Memory).unwrap().id(),
            BackendId::Memory
        );
    }

    #[test]
    fn unregistered_is_distinct_from_unsupported() {
        let factory = BackendFactory::new(Vec::new())
            .register(BackendId::Keychain, panicking)
            .register(BackendId::Memory, memory);

        let unregistered = factory.create_named("does-not-exist").unwrap_err();
        assert!(matches!(
            unregistered,
            KeyringError::UnregisteredBackend(ref n) if n == "does-not-exist"
        ));
        assert!(!unregistered.is_not_supported());

        let unsupported = factory.create_named("keychain").unwrap_err();
        assert!(unsupported.is_not_supported());

        // Known id, but absent from this registry.
        assert!(matches!(
            factory.create_preferred(BackendId::KWallet).unwrap_err(),
            KeyringError::UnregisteredBackend(_)
        ));
    }

    #[test]
    fn default_registry_always_binds_something() {
        let backend = create().unwrap();
        assert!(backend.is_supported());
        assert_eq!(create_named("memory").unwrap().id(), BackendId::Memory);
    }

    #[cfg(not(target_os = "macos"))]
    #[test]
    fn keychain_unsupported_off_macos() {
        assert!(matches!(
            create_preferred(BackendId::Keychain).unwrap_err(),
            KeyringError::BackendNotSupported(BackendId::Keychain)
        ));
    }
}

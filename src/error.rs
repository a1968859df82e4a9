//! Error types for keyring operations

use std::path::PathBuf;

use thiserror::Error;

use crate::backend::BackendId;

/// Errors raised by the file-based lock.
#[derive(Debug, Error)]
pub enum LockError {
    /// `lock()` was called on an instance that already holds the lock
    #[error("Lock on {} is already held by this instance", .0.display())]
    AlreadyLocked(PathBuf),

    /// The lock file could not be created, opened or locked
    #[error("Failed to obtain lock on {}: {source}", path.display())]
    Acquire {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Keyring errors
#[derive(Debug, Error)]
pub enum KeyringError {
    /// Every registered backend failed its capability probe
    #[error("No available keyring backend found")]
    NoBackendAvailable,

    /// The requested backend is registered but cannot run on this host
    #[error("The backend '{0}' is not supported on this host")]
    BackendNotSupported(BackendId),

    /// The requested backend name is not in the registry
    #[error("Unregistered keyring backend: '{0}'")]
    UnregisteredBackend(String),

    /// No secret is stored for the key
    #[error("No password stored for service '{service}' and account '{account}'")]
    NotFound { service: String, account: String },

    /// More than one native entry matches the key
    #[error("Too many credentials ({matches}) match service '{service}' account '{account}'")]
    Ambiguous {
        service: String,
        account: String,
        matches: usize,
    },

    /// The native store refused access
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// A value could not be encoded or decoded as UTF-8
    #[error("Unsupported encoding: {0}")]
    Encoding(String),

    /// Stored ciphertext could not be decrypted
    #[error("Failed to decrypt password: {0}")]
    Decryption(String),

    /// The native encryption primitive failed
    #[error("Failed to encrypt password: {0}")]
    Encryption(String),

    #[error(transparent)]
    Lock(#[from] LockError),

    /// The bound backend does not keep a key store file
    #[error("Key store path is not supported by the '{0}' backend")]
    KeyStorePathUnsupported(BackendId),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// The local index file exists but cannot be understood
    #[error("Corrupt key store {}: {reason}", path.display())]
    CorruptIndex { path: PathBuf, reason: String },

    /// Any other native failure
    #[error("Backend error: {0}")]
    Backend(String),
}

impl KeyringError {
    pub(crate) fn not_found(service: &str, account: &str) -> Self {
        Self::NotFound {
            service: service.to_string(),
            account: account.to_string(),
        }
    }

    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// True for `NotFound`
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// True for the errors raised while selecting a backend
    pub fn is_not_supported(&self) -> bool {
        matches!(self, Self::NoBackendAvailable | Self::BackendNotSupported(_))
    }
}

/// Result type for keyring operations
pub type Result<T> = std::result::Result<T, KeyringError>;

/// Coarse classification of a native call failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeErrorKind {
    NotFound,
    AccessDenied,
    Other,
}

/// Failure reported across the native call boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeError {
    pub kind: NativeErrorKind,
    pub message: String,
}

impl NativeError {
    pub fn new(kind: NativeErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(NativeErrorKind::NotFound, message)
    }

    pub fn access_denied(message: impl Into<String>) -> Self {
        Self::new(NativeErrorKind::AccessDenied, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(NativeErrorKind::Other, message)
    }

    /// Map onto the public taxonomy for an operation on (service, account).
    pub(crate) fn into_keyring_error(self, service: &str, account: &str) -> KeyringError {
        match self.kind {
            NativeErrorKind::NotFound => KeyringError::not_found(service, account),
            NativeErrorKind::AccessDenied => KeyringError::AccessDenied(self.message),
            NativeErrorKind::Other => KeyringError::Backend(self.message),
        }
    }
}

impl std::fmt::Display for NativeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for NativeError {}

/// Handle Mutex poison errors consistently
pub(crate) fn handle_lock_poison<T>(e: std::sync::PoisonError<T>) -> KeyringError {
    KeyringError::Backend(format!("Lock poisoned: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_errors_map_to_taxonomy() {
        let err = NativeError::not_found("missing").into_keyring_error("svc", "acct");
        assert!(err.is_not_found());

        let err = NativeError::access_denied("user cancelled").into_keyring_error("svc", "acct");
        assert!(matches!(err, KeyringError::AccessDenied(msg) if msg == "user cancelled"));

        let err = NativeError::other("daemon gone").into_keyring_error("svc", "acct");
        assert!(matches!(err, KeyringError::Backend(_)));
    }

    #[test]
    fn selection_errors_are_not_supported() {
        assert!(KeyringError::NoBackendAvailable.is_not_supported());
        assert!(KeyringError::BackendNotSupported(BackendId::Keychain).is_not_supported());
        assert!(!KeyringError::UnregisteredBackend("nope".into()).is_not_supported());
    }

    #[test]
    fn not_found_message_names_key() {
        let msg = KeyringError::not_found("acme.api", "alice").to_string();
        assert!(msg.contains("acme.api"));
        assert!(msg.contains("alice"));
    }
}

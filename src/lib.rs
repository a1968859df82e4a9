//! Cross-platform password storage.
//!
//! A [`Keyring`] binds one native secret store for its lifetime and exposes a
//! uniform (service, account) -> password keyspace over it:
//!
//! - macOS Keychain
//! - Windows DPAPI with a local encrypted index file
//! - freedesktop.org Secret Service
//! - KDE Wallet
//! - GNOME Keyring (libgnome-keyring) with a local item id index file
//! - an in-memory fallback that always works
//!
//! [`Keyring::create`] probes these in that order and binds the first one that
//! can run on the host.
//!
//! ```
//! use keyring_bridge::{BackendId, Keyring};
//!
//! let keyring = Keyring::with_backend(BackendId::Memory)?;
//! keyring.set_password("acme.api", "alice", "p4ssw0rd!")?;
//! assert_eq!(keyring.get_password("acme.api", "alice")?.expose(), "p4ssw0rd!");
//! keyring.delete_password("acme.api", "alice")?;
//! # Ok::<(), keyring_bridge::KeyringError>(())
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod factory;
pub mod index;
pub mod keyring;
pub mod lock;
pub mod secret;

pub use backend::{Backend, BackendId};
pub use config::Config;
pub use error::{KeyringError, LockError, NativeError, NativeErrorKind, Result};
pub use factory::{BackendFactory, create, create_named, create_preferred, registered_backends};
pub use keyring::Keyring;
pub use lock::{FileLock, FileLockGuard};
pub use secret::Password;

//! freedesktop.org Secret Service backend
//!
//! Entries live in the default collection as items carrying `service` and
//! `account` attributes. The collection is searched by those attributes on
//! every call; more than one match means the key is ambiguous and nothing is
//! read, written or deleted.

use std::collections::HashMap;

use tracing::debug;
use zeroize::Zeroizing;

use super::{Backend, BackendId};
use crate::error::{KeyringError, NativeError, Result};
use crate::secret::Password;

const ATTR_SERVICE: &str = "service";
const ATTR_ACCOUNT: &str = "account";

/// Items found by one attribute search.
#[derive(Debug, PartialEq, Eq)]
pub enum Matches<T> {
    Missing,
    One(T),
    /// Number of matching items; nothing was touched
    Many(usize),
}

impl<T> Matches<T> {
    pub fn from_items(mut items: Vec<T>) -> Self {
        match items.len() {
            0 => Self::Missing,
            1 => items.pop().map_or(Self::Missing, Self::One),
            n => Self::Many(n),
        }
    }

    pub fn try_map<U, E>(
        self,
        f: impl FnOnce(T) -> std::result::Result<U, E>,
    ) -> std::result::Result<Matches<U>, E> {
        Ok(match self {
            Self::Missing => Matches::Missing,
            Self::One(item) => Matches::One(f(item)?),
            Self::Many(n) => Matches::Many(n),
        })
    }
}

/// Default-collection calls used by [`SecretServiceBackend`].
///
/// Each call searches by `attributes` and acts only when exactly one item
/// matches, so the search and the action share one collection session.
pub trait SecretCollection: Send + Sync {
    /// Unlock the collection, prompting the user if the service requires it.
    fn unlock(&self) -> std::result::Result<(), NativeError>;

    fn read(
        &self,
        attributes: &HashMap<&str, &str>,
    ) -> std::result::Result<Matches<Zeroizing<Vec<u8>>>, NativeError>;

    /// Update the single match, or create an item when there is none. A
    /// create replaces any item with the same attributes that appeared since
    /// the search.
    fn write(
        &self,
        label: &str,
        attributes: &HashMap<&str, &str>,
        secret: &[u8],
    ) -> std::result::Result<Matches<()>, NativeError>;

    fn delete(
        &self,
        attributes: &HashMap<&str, &str>,
    ) -> std::result::Result<Matches<()>, NativeError>;
}

pub struct SecretServiceBackend<C> {
    collection: C,
}

fn attributes<'a>(service: &'a str, account: &'a str) -> HashMap<&'a str, &'a str> {
    HashMap::from([(ATTR_SERVICE, service), (ATTR_ACCOUNT, account)])
}

fn label(service: &str, account: &str) -> String {
    format!("{account}@{service}")
}

impl<C: SecretCollection> SecretServiceBackend<C> {
    pub fn with_collection(collection: C) -> Self {
        Self { collection }
    }

    /// Unlock, run `op` against the key's attributes, and reject ambiguous keys.
    fn unlocked<T>(
        &self,
        service: &str,
        account: &str,
        op: impl FnOnce(&C, &HashMap<&str, &str>) -> std::result::Result<Matches<T>, NativeError>,
    ) -> Result<Option<T>> {
        let native = |e: NativeError| e.into_keyring_error(service, account);

        self.collection.unlock().map_err(native)?;
        match op(&self.collection, &attributes(service, account)).map_err(native)? {
            Matches::Missing => Ok(None),
            Matches::One(found) => Ok(Some(found)),
            Matches::Many(matches) => Err(KeyringError::Ambiguous {
                service: service.to_string(),
                account: account.to_string(),
                matches,
            }),
        }
    }
}

impl<C: SecretCollection> Backend for SecretServiceBackend<C> {
    fn id(&self) -> BackendId {
        BackendId::SecretService
    }

    fn get_password(&self, service: &str, account: &str) -> Result<Password> {
        let secret = self
            .unlocked(service, account, |c, attrs| c.read(attrs))?
            .ok_or_else(|| KeyringError::not_found(service, account))?;
        Password::from_utf8(secret)
    }

    fn set_password(&self, service: &str, account: &str, password: &str) -> Result<()> {
        let label = label(service, account);
        let updated = self.unlocked(service, account, |c, attrs| {
            c.write(&label, attrs, password.as_bytes())
        })?;
        match updated {
            Some(()) => debug!(service, account, "Updated secret service item"),
            None => debug!(service, account, "Created secret service item"),
        }
        Ok(())
    }

    fn delete_password(&self, service: &str, account: &str) -> Result<()> {
        self.unlocked(service, account, |c, attrs| c.delete(attrs))?
            .ok_or_else(|| KeyringError::not_found(service, account))
    }
}

#[cfg(all(
    unix,
    not(target_os = "macos"),
    feature = "secret-service-backend"
))]
pub use self::native::DefaultCollection;

#[cfg(all(
    unix,
    not(target_os = "macos"),
    feature = "secret-service-backend"
))]
mod native {
    use std::collections::HashMap;

    use secret_service::blocking::{Collection, SecretService};
    use secret_service::{EncryptionType, Error as SsError};
    use zeroize::Zeroizing;

    use super::{Matches, SecretCollection, SecretServiceBackend};
    use crate::backend::BackendId;
    use crate::error::{KeyringError, NativeError, NativeErrorKind, Result};

    const CONTENT_TYPE: &str = "text/plain";

    fn native_error(e: SsError) -> NativeError {
        let kind = match e {
            SsError::NoResult => NativeErrorKind::NotFound,
            SsError::Locked | SsError::Prompt => NativeErrorKind::AccessDenied,
            _ => NativeErrorKind::Other,
        };
        NativeError::new(kind, e.to_string())
    }

    /// The session's default collection, over an encrypted session.
    pub struct DefaultCollection {
        ss: SecretService<'static>,
    }

    impl DefaultCollection {
        pub fn connect() -> std::result::Result<Self, NativeError> {
            let ss = SecretService::connect(EncryptionType::Dh).map_err(native_error)?;
            Ok(Self { ss })
        }

        fn collection(&self) -> std::result::Result<Collection<'_>, NativeError> {
            self.ss.get_default_collection().map_err(native_error)
        }
    }

    impl SecretCollection for DefaultCollection {
        fn unlock(&self) -> std::result::Result<(), NativeError> {
            let collection = self.collection()?;
            if collection.is_locked().map_err(native_error)? {
                collection.unlock().map_err(native_error)?;
            }
            Ok(())
        }

        fn read(
            &self,
            attributes: &HashMap<&str, &str>,
        ) -> std::result::Result<Matches<Zeroizing<Vec<u8>>>, NativeError> {
            let collection = self.collection()?;
            let items = collection
                .search_items(attributes.clone())
                .map_err(native_error)?;
            Matches::from_items(items)
                .try_map(|item| item.get_secret().map(Zeroizing::new).map_err(native_error))
        }

        fn write(
            &self,
            label: &str,
            attributes: &HashMap<&str, &str>,
            secret: &[u8],
        ) -> std::result::Result<Matches<()>, NativeError> {
            let collection = self.collection()?;
            let items = collection
                .search_items(attributes.clone())
                .map_err(native_error)?;
            match Matches::from_items(items) {
                Matches::Missing => {
                    collection
                        .create_item(label, attributes.clone(), secret, true, CONTENT_TYPE)
                        .map_err(native_error)?;
                    Ok(Matches::Missing)
                }
                found => found.try_map(|item| {
                    item.set_secret(secret, CONTENT_TYPE).map_err(native_error)?;
                    item.set_label(label).map_err(native_error)
                }),
            }
        }

        fn delete(
            &self,
            attributes: &HashMap<&str, &str>,
        ) -> std::result::Result<Matches<()>, NativeError> {
            let collection = self.collection()?;
            let items = collection
                .search_items(attributes.clone())
                .map_err(native_error)?;
            Matches::from_items(items).try_map(|item| item.delete().map_err(native_error))
        }
    }

    impl SecretServiceBackend<DefaultCollection> {
        /// Connect to the session bus and check the default collection exists.
        pub fn new() -> Result<Self> {
            let unsupported = |e: NativeError| {
                tracing::debug!(error = %e, "Secret Service unavailable");
                KeyringError::BackendNotSupported(BackendId::SecretService)
            };
            let collection = DefaultCollection::connect().map_err(unsupported)?;
            collection.collection().map_err(unsupported)?;
            Ok(Self::with_collection(collection))
        }
    }
}

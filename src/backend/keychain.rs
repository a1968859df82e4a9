//! macOS Keychain backend
//!
//! Stores each (service, account) as one generic password item. The native
//! API rejects duplicate items, so `set` looks the item up first and either
//! modifies its content in place or adds a new one.

use tracing::debug;
use zeroize::Zeroizing;

use super::{Backend, BackendId};
use crate::error::{KeyringError, NativeError, Result};
use crate::secret::Password;

/// Native keychain calls used by [`KeychainBackend`].
pub trait KeychainApi: Send + Sync {
    /// Native item handle
    type Item;

    /// Look up a generic password, returning its content and item handle.
    fn find_generic_password(
        &self,
        service: &str,
        account: &str,
    ) -> std::result::Result<Option<(Zeroizing<Vec<u8>>, Self::Item)>, NativeError>;

    fn add_generic_password(
        &self,
        service: &str,
        account: &str,
        password: &[u8],
    ) -> std::result::Result<(), NativeError>;

    fn modify_content(
        &self,
        item: &mut Self::Item,
        password: &[u8],
    ) -> std::result::Result<(), NativeError>;

    fn delete_item(&self, item: Self::Item) -> std::result::Result<(), NativeError>;

    fn is_available(&self) -> bool {
        true
    }
}

pub struct KeychainBackend<A> {
    api: A,
}

impl<A: KeychainApi> KeychainBackend<A> {
    pub fn with_api(api: A) -> Self {
        Self { api }
    }
}

impl<A: KeychainApi> Backend for KeychainBackend<A> {
    fn id(&self) -> BackendId {
        BackendId::Keychain
    }

    fn is_supported(&self) -> bool {
        self.api.is_available()
    }

    fn get_password(&self, service: &str, account: &str) -> Result<Password> {
        debug!(service, account, "Reading keychain item");
        match self
            .api
            .find_generic_password(service, account)
            .map_err(|e| e.into_keyring_error(service, account))?
        {
            Some((data, _item)) => Password::from_utf8(data),
            None => Err(KeyringError::not_found(service, account)),
        }
    }

    fn set_password(&self, service: &str, account: &str, password: &str) -> Result<()> {
        let existing = self
            .api
            .find_generic_password(service, account)
            .map_err(|e| e.into_keyring_error(service, account))?;

        match existing {
            Some((_old, mut item)) => {
                debug!(service, account, "Modifying existing keychain item");
                self.api.modify_content(&mut item, password.as_bytes())
            }
            None => {
                debug!(service, account, "Adding keychain item");
                self.api
                    .add_generic_password(service, account, password.as_bytes())
            }
        }
        .map_err(|e| e.into_keyring_error(service, account))
    }

    fn delete_password(&self, service: &str, account: &str) -> Result<()> {
        let (_data, item) = self
            .api
            .find_generic_password(service, account)
            .map_err(|e| e.into_keyring_error(service, account))?
            .ok_or_else(|| KeyringError::not_found(service, account))?;

        self.api
            .delete_item(item)
            .map_err(|e| e.into_keyring_error(service, account))
    }
}

#[cfg(target_os = "macos")]
pub use self::native::SystemKeychain;

#[cfg(target_os = "macos")]
mod native {
    use security_framework::base::Error as SecError;
    use security_framework::os::macos::keychain::SecKeychain;
    use security_framework::os::macos::keychain_item::SecKeychainItem;
    use security_framework::os::macos::passwords::find_generic_password;
    use zeroize::Zeroizing;

    use super::{KeychainApi, KeychainBackend};
    use crate::backend::BackendId;
    use crate::error::{KeyringError, NativeError, NativeErrorKind, Result};

    const ERR_SEC_USER_CANCELED: i32 = -128;
    const ERR_SEC_AUTH_FAILED: i32 = -25293;
    const ERR_SEC_ITEM_NOT_FOUND: i32 = -25300;
    const ERR_SEC_INTERACTION_NOT_ALLOWED: i32 = -25308;

    fn native_error(e: SecError) -> NativeError {
        let kind = match e.code() {
            ERR_SEC_ITEM_NOT_FOUND => NativeErrorKind::NotFound,
            ERR_SEC_USER_CANCELED | ERR_SEC_AUTH_FAILED | ERR_SEC_INTERACTION_NOT_ALLOWED => {
                NativeErrorKind::AccessDenied
            }
            _ => NativeErrorKind::Other,
        };
        let message = e
            .message()
            .unwrap_or_else(|| format!("Keychain error {}", e.code()));
        NativeError::new(kind, message)
    }

    /// The user's default keychain search list.
    pub struct SystemKeychain;

    impl KeychainApi for SystemKeychain {
        type Item = SecKeychainItem;

        fn find_generic_password(
            &self,
            service: &str,
            account: &str,
        ) -> std::result::Result<Option<(Zeroizing<Vec<u8>>, SecKeychainItem)>, NativeError>
        {
            match find_generic_password(None, service, account) {
                Ok((password, item)) => Ok(Some((Zeroizing::new(password.to_vec()), item))),
                Err(e) if e.code() == ERR_SEC_ITEM_NOT_FOUND => Ok(None),
                Err(e) => Err(native_error(e)),
            }
        }

        fn add_generic_password(
            &self,
            service: &str,
            account: &str,
            password: &[u8],
        ) -> std::result::Result<(), NativeError> {
            let keychain = SecKeychain::default().map_err(native_error)?;
            keychain
                .add_generic_password(service, account, password)
                .map_err(native_error)
        }

        fn modify_content(
            &self,
            item: &mut SecKeychainItem,
            password: &[u8],
        ) -> std::result::Result<(), NativeError> {
            item.set_password(password).map_err(native_error)
        }

        fn delete_item(&self, item: SecKeychainItem) -> std::result::Result<(), NativeError> {
            item.delete();
            Ok(())
        }
    }

    impl KeychainBackend<SystemKeychain> {
        /// Bind to the default keychain, failing if it cannot be opened.
        pub fn new() -> Result<Self> {
            SecKeychain::default().map_err(|e| {
                tracing::debug!(error = %e, "Default keychain unavailable");
                KeyringError::BackendNotSupported(BackendId::Keychain)
            })?;
            Ok(Self::with_api(SystemKeychain))
        }
    }
}

//! GNOME Keyring backend (libgnome-keyring)
//!
//! The legacy GNOME keyring API addresses items by a numeric id that it picks
//! at creation time. The id for each (service, account) is remembered in a
//! local index file guarded by the key store's [`FileLock`]. The secret itself
//! only ever lives in the keyring.
//!
//! The index and the keyring are separate stores and no lock spans both, so
//! a crash between the two writes can leave an index entry pointing at a
//! missing item or an orphaned keyring item.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use zeroize::Zeroizing;

use super::{Backend, BackendId};
use crate::error::{KeyringError, NativeError, NativeErrorKind, Result, handle_lock_poison};
use crate::index::{IndexEntry, LocalIndex};
use crate::lock::FileLock;
use crate::secret::Password;

/// Native keyring calls used by [`GnomeKeyringBackend`].
pub trait GnomeKeyringApi: Send + Sync {
    /// Unlock the default keyring. An already unlocked keyring is success.
    fn unlock(&self) -> std::result::Result<(), NativeError>;

    /// Create or update a network password item and return its id.
    fn set_network_password(
        &self,
        service: &str,
        account: &str,
        password: &str,
    ) -> std::result::Result<u32, NativeError>;

    fn item_secret(&self, item_id: u32) -> std::result::Result<Zeroizing<Vec<u8>>, NativeError>;

    fn delete_item(&self, item_id: u32) -> std::result::Result<(), NativeError>;

    fn is_available(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemEntry {
    service: String,
    account: String,
    item_id: u32,
}

impl IndexEntry for ItemEntry {
    fn service(&self) -> &str {
        &self.service
    }

    fn account(&self) -> &str {
        &self.account
    }
}

pub struct GnomeKeyringBackend<A> {
    api: A,
    key_store_path: PathBuf,
    op_lock: Mutex<()>,
}

impl<A: GnomeKeyringApi> GnomeKeyringBackend<A> {
    pub fn with_api(api: A, key_store_path: PathBuf) -> Self {
        Self {
            api,
            key_store_path,
            op_lock: Mutex::new(()),
        }
    }

    fn with_index<R>(
        &self,
        f: impl FnOnce(&mut LocalIndex<ItemEntry>, &Path) -> Result<R>,
    ) -> Result<R> {
        let _in_process = self.op_lock.lock().map_err(handle_lock_poison)?;
        let mut lock = FileLock::for_key_store(&self.key_store_path);
        let _guard = lock.acquire()?;

        let mut index = LocalIndex::load(&self.key_store_path)?;
        f(&mut index, &self.key_store_path)
    }
}

impl<A: GnomeKeyringApi> Backend for GnomeKeyringBackend<A> {
    fn id(&self) -> BackendId {
        BackendId::GnomeKeyring
    }

    fn is_supported(&self) -> bool {
        self.api.is_available()
    }

    fn is_key_store_path_required(&self) -> bool {
        true
    }

    fn key_store_path(&self) -> Result<&Path> {
        Ok(&self.key_store_path)
    }

    fn set_key_store_path(&mut self, path: PathBuf) -> Result<()> {
        self.key_store_path = path;
        Ok(())
    }

    fn get_password(&self, service: &str, account: &str) -> Result<Password> {
        let item_id = self.with_index(|index, _| {
            index
                .find(service, account)
                .map(|entry| entry.item_id)
                .ok_or_else(|| KeyringError::not_found(service, account))
        })?;

        debug!(service, account, item_id, "Reading GNOME keyring item");
        let secret = self
            .api
            .item_secret(item_id)
            .map_err(|e| e.into_keyring_error(service, account))?;
        Password::from_utf8(secret)
    }

    fn set_password(&self, service: &str, account: &str, password: &str) -> Result<()> {
        self.api
            .unlock()
            .map_err(|e| e.into_keyring_error(service, account))?;
        let item_id = self
            .api
            .set_network_password(service, account, password)
            .map_err(|e| e.into_keyring_error(service, account))?;
        debug!(service, account, item_id, "Stored GNOME keyring item");

        let replaced = self.with_index(|index, path| {
            let replaced = index.upsert(ItemEntry {
                service: service.to_string(),
                account: account.to_string(),
                item_id,
            });
            index.save(path)?;
            Ok(replaced)
        })?;

        if let Some(old) = replaced.filter(|old| old.item_id != item_id) {
            if let Err(e) = self.api.delete_item(old.item_id) {
                warn!(
                    service,
                    account,
                    item_id = old.item_id,
                    error = %e,
                    "Failed to remove superseded keyring item"
                );
            }
        }
        Ok(())
    }

    fn delete_password(&self, service: &str, account: &str) -> Result<()> {
        let removed = self.with_index(|index, path| {
            let removed = index
                .remove(service, account)
                .ok_or_else(|| KeyringError::not_found(service, account))?;
            index.save(path)?;
            Ok(removed)
        })?;

        match self.api.delete_item(removed.item_id) {
            Ok(()) => Ok(()),
            Err(e) if e.kind == NativeErrorKind::NotFound => {
                debug!(service, account, item_id = removed.item_id, "Keyring item already gone");
                Ok(())
            }
            Err(e) => Err(e.into_keyring_error(service, account)),
        }
    }
}

#[cfg(all(unix, not(target_os = "macos"), feature = "gnome-keyring-backend"))]
pub use self::native::LibGnomeKeyring;

#[cfg(all(unix, not(target_os = "macos"), feature = "gnome-keyring-backend"))]
mod native {
    use std::ffi::{CStr, CString, c_char, c_int, c_void};
    use std::ptr;

    use libloading::Library;
    use zeroize::Zeroizing;

    use super::{GnomeKeyringApi, GnomeKeyringBackend};
    use crate::backend::BackendId;
    use crate::config;
    use crate::error::{KeyringError, NativeError, NativeErrorKind, Result};

    const LIBRARY_NAME: &str = "libgnome-keyring.so.0";

    const RESULT_OK: c_int = 0;
    const RESULT_DENIED: c_int = 1;
    const RESULT_ALREADY_UNLOCKED: c_int = 3;
    const RESULT_NO_MATCH: c_int = 9;

    const ITEM_INFO_SECRET: c_int = 1;

    type UnlockSync = unsafe extern "C" fn(*const c_char, *const c_char) -> c_int;
    type SetNetworkPasswordSync = unsafe extern "C" fn(
        *const c_char,
        *const c_char,
        *const c_char,
        *const c_char,
        *const c_char,
        *const c_char,
        *const c_char,
        u32,
        *const c_char,
        *mut u32,
    ) -> c_int;
    type ItemGetInfoFullSync =
        unsafe extern "C" fn(*const c_char, u32, c_int, *mut *mut c_void) -> c_int;
    type ItemInfoGetSecret = unsafe extern "C" fn(*mut c_void) -> *mut c_char;
    type FreePassword = unsafe extern "C" fn(*mut c_char);
    type ItemInfoFree = unsafe extern "C" fn(*mut c_void);
    type ItemDeleteSync = unsafe extern "C" fn(*const c_char, u32) -> c_int;
    type ResultToMessage = unsafe extern "C" fn(c_int) -> *const c_char;

    /// libgnome-keyring loaded at runtime.
    pub struct LibGnomeKeyring {
        unlock_sync: UnlockSync,
        set_network_password_sync: SetNetworkPasswordSync,
        item_get_info_full_sync: ItemGetInfoFullSync,
        item_info_get_secret: ItemInfoGetSecret,
        free_password: FreePassword,
        item_info_free: ItemInfoFree,
        item_delete_sync: ItemDeleteSync,
        result_to_message: ResultToMessage,
        // Keeps the symbols above valid.
        _library: Library,
    }

    impl LibGnomeKeyring {
        pub fn load() -> std::result::Result<Self, libloading::Error> {
            unsafe {
                let library = Library::new(LIBRARY_NAME)?;
                let unlock_sync: UnlockSync = *library.get(b"gnome_keyring_unlock_sync\0")?;
                let set_network_password_sync: SetNetworkPasswordSync =
                    *library.get(b"gnome_keyring_set_network_password_sync\0")?;
                let item_get_info_full_sync: ItemGetInfoFullSync =
                    *library.get(b"gnome_keyring_item_get_info_full_sync\0")?;
                let item_info_get_secret: ItemInfoGetSecret =
                    *library.get(b"gnome_keyring_item_info_get_secret\0")?;
                let free_password: FreePassword = *library.get(b"gnome_keyring_free_password\0")?;
                let item_info_free: ItemInfoFree = *library.get(b"gnome_keyring_item_info_free\0")?;
                let item_delete_sync: ItemDeleteSync =
                    *library.get(b"gnome_keyring_item_delete_sync\0")?;
                let result_to_message: ResultToMessage =
                    *library.get(b"gnome_keyring_result_to_message\0")?;

                Ok(Self {
                    unlock_sync,
                    set_network_password_sync,
                    item_get_info_full_sync,
                    item_info_get_secret,
                    free_password,
                    item_info_free,
                    item_delete_sync,
                    result_to_message,
                    _library: library,
                })
            }
        }

        fn error(&self, code: c_int) -> NativeError {
            let message = unsafe {
                let raw = (self.result_to_message)(code);
                if raw.is_null() {
                    format!("GNOME keyring error {code}")
                } else {
                    CStr::from_ptr(raw).to_string_lossy().into_owned()
                }
            };
            let kind = match code {
                RESULT_DENIED => NativeErrorKind::AccessDenied,
                RESULT_NO_MATCH => NativeErrorKind::NotFound,
                _ => NativeErrorKind::Other,
            };
            NativeError::new(kind, message)
        }

        fn check(&self, code: c_int) -> std::result::Result<(), NativeError> {
            if code == RESULT_OK {
                Ok(())
            } else {
                Err(self.error(code))
            }
        }
    }

    fn c_string(value: &str) -> std::result::Result<CString, NativeError> {
        CString::new(value).map_err(|_| NativeError::other("Value contains an interior NUL byte"))
    }

    impl GnomeKeyringApi for LibGnomeKeyring {
        fn unlock(&self) -> std::result::Result<(), NativeError> {
            let code = unsafe { (self.unlock_sync)(ptr::null(), ptr::null()) };
            if code == RESULT_ALREADY_UNLOCKED {
                return Ok(());
            }
            self.check(code)
        }

        fn set_network_password(
            &self,
            service: &str,
            account: &str,
            password: &str,
        ) -> std::result::Result<u32, NativeError> {
            let server = c_string(service)?;
            let user = c_string(account)?;
            let secret = Zeroizing::new(c_string(password)?.into_bytes_with_nul());

            let mut item_id: u32 = 0;
            let code = unsafe {
                (self.set_network_password_sync)(
                    ptr::null(),
                    user.as_ptr(),
                    ptr::null(),
                    server.as_ptr(),
                    ptr::null(),
                    ptr::null(),
                    ptr::null(),
                    0,
                    secret.as_ptr().cast(),
                    &mut item_id,
                )
            };
            self.check(code)?;
            Ok(item_id)
        }

        fn item_secret(
            &self,
            item_id: u32,
        ) -> std::result::Result<Zeroizing<Vec<u8>>, NativeError> {
            let mut info: *mut c_void = ptr::null_mut();
            let code = unsafe {
                (self.item_get_info_full_sync)(ptr::null(), item_id, ITEM_INFO_SECRET, &mut info)
            };
            self.check(code)?;

            unsafe {
                let raw = (self.item_info_get_secret)(info);
                let secret = if raw.is_null() {
                    Err(NativeError::other("Keyring item has no secret"))
                } else {
                    let bytes = Zeroizing::new(CStr::from_ptr(raw).to_bytes().to_vec());
                    (self.free_password)(raw);
                    Ok(bytes)
                };
                (self.item_info_free)(info);
                secret
            }
        }

        fn delete_item(&self, item_id: u32) -> std::result::Result<(), NativeError> {
            let code = unsafe { (self.item_delete_sync)(ptr::null(), item_id) };
            self.check(code)
        }
    }

    impl GnomeKeyringBackend<LibGnomeKeyring> {
        /// Load libgnome-keyring and unlock the default keyring.
        pub fn new() -> Result<Self> {
            let api = LibGnomeKeyring::load().map_err(|e| {
                tracing::debug!(error = %e, "libgnome-keyring unavailable");
                KeyringError::BackendNotSupported(BackendId::GnomeKeyring)
            })?;
            api.unlock().map_err(|e| {
                tracing::debug!(error = %e, "GNOME keyring could not be unlocked");
                KeyringError::BackendNotSupported(BackendId::GnomeKeyring)
            })?;
            Ok(Self::with_api(
                api,
                config::default_key_store_path(BackendId::GnomeKeyring),
            ))
        }
    }
}

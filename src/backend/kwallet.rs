//! KDE Wallet backend
//!
//! The service name is the wallet folder and the account is the entry key.
//! The local wallet is opened for each call and closed again on every exit
//! path. A folder is removed once its last entry is deleted.

use std::sync::Mutex;

use tracing::{debug, warn};
use zeroize::Zeroizing;

use super::{Backend, BackendId};
use crate::error::{KeyringError, NativeError, Result, handle_lock_poison};
use crate::secret::Password;

/// Application id presented to kwalletd.
pub const APP_ID: &str = "keyring-bridge";

/// kwalletd calls used by [`KWalletBackend`].
pub trait WalletApi: Send + Sync {
    /// Name of the local (default) wallet
    fn local_wallet(&self) -> std::result::Result<String, NativeError>;

    fn is_open(&self, handle: i32) -> std::result::Result<bool, NativeError>;

    /// Open `wallet`, returning a negative handle on refusal.
    fn open(&self, wallet: &str, app: &str) -> std::result::Result<i32, NativeError>;

    fn close(&self, handle: i32, force: bool, app: &str) -> std::result::Result<i32, NativeError>;

    fn has_entry(
        &self,
        handle: i32,
        folder: &str,
        key: &str,
        app: &str,
    ) -> std::result::Result<bool, NativeError>;

    fn read_password(
        &self,
        handle: i32,
        folder: &str,
        key: &str,
        app: &str,
    ) -> std::result::Result<Zeroizing<String>, NativeError>;

    fn write_password(
        &self,
        handle: i32,
        folder: &str,
        key: &str,
        value: &str,
        app: &str,
    ) -> std::result::Result<i32, NativeError>;

    fn entry_list(
        &self,
        handle: i32,
        folder: &str,
        app: &str,
    ) -> std::result::Result<Vec<String>, NativeError>;

    fn remove_entry(
        &self,
        handle: i32,
        folder: &str,
        key: &str,
        app: &str,
    ) -> std::result::Result<i32, NativeError>;

    fn remove_folder(
        &self,
        handle: i32,
        folder: &str,
        app: &str,
    ) -> std::result::Result<bool, NativeError>;
}

pub struct KWalletBackend<W> {
    wallet: W,
    /// kwalletd handles are per connection; one call at a time.
    op_lock: Mutex<()>,
}

impl<W: WalletApi> KWalletBackend<W> {
    pub fn with_wallet(wallet: W) -> Self {
        Self {
            wallet,
            op_lock: Mutex::new(()),
        }
    }

    /// Open the local wallet, run `f` with the handle, then close it.
    fn with_open_wallet<R>(
        &self,
        service: &str,
        account: &str,
        f: impl FnOnce(i32) -> std::result::Result<R, NativeError>,
    ) -> Result<R> {
        let native = |e: NativeError| e.into_keyring_error(service, account);
        let _serial = self.op_lock.lock().map_err(handle_lock_poison)?;

        let name = self.wallet.local_wallet().map_err(native)?;
        let handle = self.wallet.open(&name, APP_ID).map_err(native)?;
        let refused = || KeyringError::AccessDenied(format!("Wallet '{name}' could not be opened"));
        if handle < 0 {
            return Err(refused());
        }

        // From here on the handle is closed whatever happens.
        let result = match self.wallet.is_open(handle) {
            Ok(true) => f(handle).map_err(native),
            Ok(false) => Err(refused()),
            Err(e) => Err(native(e)),
        };

        match self.wallet.close(handle, false, APP_ID) {
            Ok(_) => {}
            Err(e) => warn!(handle, error = %e, "Failed to close wallet"),
        }
        result
    }
}

fn check_status(status: i32, what: &str) -> std::result::Result<(), NativeError> {
    if status == 0 {
        Ok(())
    } else {
        Err(NativeError::other(format!("{what} failed with status {status}")))
    }
}

impl<W: WalletApi> Backend for KWalletBackend<W> {
    fn id(&self) -> BackendId {
        BackendId::KWallet
    }

    fn get_password(&self, service: &str, account: &str) -> Result<Password> {
        let secret = self.with_open_wallet(service, account, |handle| {
            if !self.wallet.has_entry(handle, service, account, APP_ID)? {
                return Ok(None);
            }
            self.wallet
                .read_password(handle, service, account, APP_ID)
                .map(Some)
        })?;

        secret
            .map(|s| Password::new(s.as_str()))
            .ok_or_else(|| KeyringError::not_found(service, account))
    }

    fn set_password(&self, service: &str, account: &str, password: &str) -> Result<()> {
        debug!(service, account, "Writing wallet entry");
        self.with_open_wallet(service, account, |handle| {
            let status = self
                .wallet
                .write_password(handle, service, account, password, APP_ID)?;
            check_status(status, "writePassword")
        })
    }

    fn delete_password(&self, service: &str, account: &str) -> Result<()> {
        let removed = self.with_open_wallet(service, account, |handle| {
            if !self.wallet.has_entry(handle, service, account, APP_ID)? {
                return Ok(false);
            }
            let status = self
                .wallet
                .remove_entry(handle, service, account, APP_ID)?;
            check_status(status, "removeEntry")?;

            if self.wallet.entry_list(handle, service, APP_ID)?.is_empty() {
                debug!(folder = service, "Removing empty wallet folder");
                self.wallet.remove_folder(handle, service, APP_ID)?;
            }
            Ok(true)
        })?;

        if removed {
            Ok(())
        } else {
            Err(KeyringError::not_found(service, account))
        }
    }
}

#[cfg(all(unix, not(target_os = "macos"), feature = "kwallet-backend"))]
pub use self::native::KWalletd;

#[cfg(all(unix, not(target_os = "macos"), feature = "kwallet-backend"))]
mod native {
    use zbus::blocking::{Connection, Proxy};
    use zeroize::Zeroizing;

    use super::{KWalletBackend, WalletApi};
    use crate::backend::BackendId;
    use crate::error::{KeyringError, NativeError, NativeErrorKind, Result};

    const DESTINATION: &str = "org.kde.kwalletd5";
    const PATH: &str = "/modules/kwalletd5";
    const INTERFACE: &str = "org.kde.KWallet";

    fn native_error(e: zbus::Error) -> NativeError {
        let kind = match &e {
            zbus::Error::MethodError(name, _, _) if name.as_str().ends_with("AccessDenied") => {
                NativeErrorKind::AccessDenied
            }
            _ => NativeErrorKind::Other,
        };
        NativeError::new(kind, e.to_string())
    }

    /// kwalletd5 on the session bus.
    pub struct KWalletd {
        proxy: Proxy<'static>,
    }

    impl KWalletd {
        pub fn connect() -> std::result::Result<Self, NativeError> {
            let connection = Connection::session().map_err(native_error)?;
            let proxy =
                Proxy::new(&connection, DESTINATION, PATH, INTERFACE).map_err(native_error)?;
            Ok(Self { proxy })
        }
    }

    impl WalletApi for KWalletd {
        fn local_wallet(&self) -> std::result::Result<String, NativeError> {
            self.proxy.call("localWallet", &()).map_err(native_error)
        }

        fn is_open(&self, handle: i32) -> std::result::Result<bool, NativeError> {
            self.proxy.call("isOpen", &(handle,)).map_err(native_error)
        }

        fn open(&self, wallet: &str, app: &str) -> std::result::Result<i32, NativeError> {
            self.proxy
                .call("open", &(wallet, 0i64, app))
                .map_err(native_error)
        }

        fn close(
            &self,
            handle: i32,
            force: bool,
            app: &str,
        ) -> std::result::Result<i32, NativeError> {
            self.proxy
                .call("close", &(handle, force, app))
                .map_err(native_error)
        }

        fn has_entry(
            &self,
            handle: i32,
            folder: &str,
            key: &str,
            app: &str,
        ) -> std::result::Result<bool, NativeError> {
            self.proxy
                .call("hasEntry", &(handle, folder, key, app))
                .map_err(native_error)
        }

        fn read_password(
            &self,
            handle: i32,
            folder: &str,
            key: &str,
            app: &str,
        ) -> std::result::Result<Zeroizing<String>, NativeError> {
            self.proxy
                .call("readPassword", &(handle, folder, key, app))
                .map(Zeroizing::new)
                .map_err(native_error)
        }

        fn write_password(
            &self,
            handle: i32,
            folder: &str,
            key: &str,
            value: &str,
            app: &str,
        ) -> std::result::Result<i32, NativeError> {
            self.proxy
                .call("writePassword", &(handle, folder, key, value, app))
                .map_err(native_error)
        }

        fn entry_list(
            &self,
            handle: i32,
            folder: &str,
            app: &str,
        ) -> std::result::Result<Vec<String>, NativeError> {
            self.proxy
                .call("entryList", &(handle, folder, app))
                .map_err(native_error)
        }

        fn remove_entry(
            &self,
            handle: i32,
            folder: &str,
            key: &str,
            app: &str,
        ) -> std::result::Result<i32, NativeError> {
            self.proxy
                .call("removeEntry", &(handle, folder, key, app))
                .map_err(native_error)
        }

        fn remove_folder(
            &self,
            handle: i32,
            folder: &str,
            app: &str,
        ) -> std::result::Result<bool, NativeError> {
            self.proxy
                .call("removeFolder", &(handle, folder, app))
                .map_err(native_error)
        }
    }

    impl KWalletBackend<KWalletd> {
        /// Connect to kwalletd and make one trial call.
        pub fn new() -> Result<Self> {
            let unsupported = |e: NativeError| {
                tracing::debug!(error = %e, "KWallet unavailable");
                KeyringError::BackendNotSupported(BackendId::KWallet)
            };
            let wallet = KWalletd::connect().map_err(unsupported)?;
            wallet.local_wallet().map_err(unsupported)?;
            Ok(Self::with_wallet(wallet))
        }
    }
}

//! Windows DPAPI backend
//!
//! DPAPI only encrypts bytes; it has no notion of named items. Passwords are
//! encrypted for the current user and the ciphertext is kept, together with
//! its (service, account), in a local index file. Every operation holds the
//! key store's [`FileLock`] for the full load, mutate and persist sequence.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::debug;
use zeroize::Zeroizing;

use super::{Backend, BackendId};
use crate::error::{KeyringError, NativeError, Result, handle_lock_poison};
use crate::index::{IndexEntry, LocalIndex};
use crate::lock::FileLock;
use crate::secret::Password;

/// Native encryption primitive used by [`DpapiBackend`].
pub trait DataProtection: Send + Sync {
    fn protect(&self, plaintext: &[u8]) -> std::result::Result<Vec<u8>, NativeError>;

    fn unprotect(&self, ciphertext: &[u8])
    -> std::result::Result<Zeroizing<Vec<u8>>, NativeError>;

    fn is_available(&self) -> bool {
        true
    }
}

/// One stored password: the key plus still-encrypted bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PasswordEntry {
    service: String,
    account: String,
    #[serde(serialize_with = "to_base64", deserialize_with = "from_base64")]
    ciphertext: Vec<u8>,
}

impl IndexEntry for PasswordEntry {
    fn service(&self) -> &str {
        &self.service
    }

    fn account(&self) -> &str {
        &self.account
    }
}

fn to_base64<S: Serializer>(bytes: &[u8], serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&STANDARD.encode(bytes))
}

fn from_base64<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Vec<u8>, D::Error> {
    let encoded = String::deserialize(deserializer)?;
    STANDARD.decode(encoded).map_err(serde::de::Error::custom)
}

pub struct DpapiBackend<P> {
    protector: P,
    key_store_path: PathBuf,
    /// Serializes threads of this process before they contend for the file lock.
    op_lock: Mutex<()>,
}

impl<P: DataProtection> DpapiBackend<P> {
    pub fn with_protector(protector: P, key_store_path: PathBuf) -> Self {
        Self {
            protector,
            key_store_path,
            op_lock: Mutex::new(()),
        }
    }

    /// Run `f` on the loaded index while holding the key store lock.
    fn with_index<R>(
        &self,
        f: impl FnOnce(&mut LocalIndex<PasswordEntry>, &Path) -> Result<R>,
    ) -> Result<R> {
        let _in_process = self.op_lock.lock().map_err(handle_lock_poison)?;
        let mut lock = FileLock::for_key_store(&self.key_store_path);
        let _guard = lock.acquire()?;

        let mut index = LocalIndex::load(&self.key_store_path)?;
        f(&mut index, &self.key_store_path)
    }

    fn encrypt(&self, password: &str) -> Result<Vec<u8>> {
        self.protector
            .protect(password.as_bytes())
            .map_err(|e| KeyringError::Encryption(e.message))
    }
}

impl<P: DataProtection> Backend for DpapiBackend<P> {
    fn id(&self) -> BackendId {
        BackendId::WindowsDpapi
    }

    fn is_supported(&self) -> bool {
        self.protector.is_available()
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
        debug!(service, account, "Reading DPAPI entry");
        let ciphertext = self.with_index(|index, _| {
            index
                .find(service, account)
                .map(|entry| entry.ciphertext.clone())
                .ok_or_else(|| KeyringError::not_found(service, account))
        })?;

        let plaintext = self
            .protector
            .unprotect(&ciphertext)
            .map_err(|e| KeyringError::Decryption(e.message))?;
        Password::from_utf8(plaintext)
    }

    fn set_password(&self, service: &str, account: &str, password: &str) -> Result<()> {
        let ciphertext = self.encrypt(password)?;
        self.with_index(|index, path| {
            let replaced = index.upsert(PasswordEntry {
                service: service.to_string(),
                account: account.to_string(),
                ciphertext,
            });
            debug!(service, account, replaced = replaced.is_some(), "Stored DPAPI entry");
            index.save(path)
        })
    }

    fn delete_password(&self, service: &str, account: &str) -> Result<()> {
        self.with_index(|index, path| {
            index
                .remove(service, account)
                .ok_or_else(|| KeyringError::not_found(service, account))?;
            index.save(path)
        })
    }
}

#[cfg(windows)]
pub use self::native::Dpapi;

#[cfg(windows)]
mod native {
    use std::ffi::c_void;
    use std::ptr;

    use zeroize::{Zeroize, Zeroizing};

    use super::{DataProtection, DpapiBackend};
    use crate::backend::BackendId;
    use crate::config;
    use crate::error::{NativeError, Result};

    const CRYPTPROTECT_UI_FORBIDDEN: u32 = 0x1;

    #[repr(C)]
    struct DataBlob {
        cb_data: u32,
        pb_data: *mut u8,
    }

    #[link(name = "crypt32")]
    unsafe extern "system" {
        fn CryptProtectData(
            p_data_in: *const DataBlob,
            sz_data_descr: *const u16,
            p_optional_entropy: *const DataBlob,
            pv_reserved: *mut c_void,
            p_prompt_struct: *mut c_void,
            dw_flags: u32,
            p_data_out: *mut DataBlob,
        ) -> i32;

        fn CryptUnprotectData(
            p_data_in: *const DataBlob,
            ppsz_data_descr: *mut *mut u16,
            p_optional_entropy: *const DataBlob,
            pv_reserved: *mut c_void,
            p_prompt_struct: *mut c_void,
            dw_flags: u32,
            p_data_out: *mut DataBlob,
        ) -> i32;
    }

    #[link(name = "kernel32")]
    unsafe extern "system" {
        fn LocalFree(h_mem: *mut c_void) -> *mut c_void;
    }

    /// Copy a DPAPI output blob and free the native allocation.
    ///
    /// # Safety
    ///
    /// `blob` must have been filled by a successful DPAPI call.
    unsafe fn take_blob(blob: &mut DataBlob, wipe: bool) -> Vec<u8> {
        let bytes = unsafe { std::slice::from_raw_parts_mut(blob.pb_data, blob.cb_data as usize) };
        let out = bytes.to_vec();
        if wipe {
            bytes.zeroize();
        }
        unsafe { LocalFree(blob.pb_data.cast()) };
        blob.pb_data = ptr::null_mut();
        blob.cb_data = 0;
        out
    }

    fn input_blob(data: &[u8]) -> std::result::Result<DataBlob, NativeError> {
        let cb_data = u32::try_from(data.len())
            .map_err(|_| NativeError::other("Password is too large for DPAPI"))?;
        Ok(DataBlob {
            cb_data,
            pb_data: data.as_ptr().cast_mut(),
        })
    }

    /// Current-user DPAPI.
    pub struct Dpapi;

    impl DataProtection for Dpapi {
        fn protect(&self, plaintext: &[u8]) -> std::result::Result<Vec<u8>, NativeError> {
            let input = input_blob(plaintext)?;
            let mut output = DataBlob {
                cb_data: 0,
                pb_data: ptr::null_mut(),
            };
            let ok = unsafe {
                CryptProtectData(
                    &input,
                    ptr::null(),
                    ptr::null(),
                    ptr::null_mut(),
                    ptr::null_mut(),
                    CRYPTPROTECT_UI_FORBIDDEN,
                    &mut output,
                )
            };
            if ok == 0 {
                return Err(NativeError::other(format!(
                    "CryptProtectData failed: {}",
                    std::io::Error::last_os_error()
                )));
            }
            Ok(unsafe { take_blob(&mut output, false) })
        }

        fn unprotect(
            &self,
            ciphertext: &[u8],
        ) -> std::result::Result<Zeroizing<Vec<u8>>, NativeError> {
            let input = input_blob(ciphertext)?;
            let mut output = DataBlob {
                cb_data: 0,
                pb_data: ptr::null_mut(),
            };
            let ok = unsafe {
                CryptUnprotectData(
                    &input,
                    ptr::null_mut(),
                    ptr::null(),
                    ptr::null_mut(),
                    ptr::null_mut(),
                    CRYPTPROTECT_UI_FORBIDDEN,
                    &mut output,
                )
            };
            if ok == 0 {
                return Err(NativeError::other(format!(
                    "CryptUnprotectData failed: {}",
                    std::io::Error::last_os_error()
                )));
            }
            Ok(Zeroizing::new(unsafe { take_blob(&mut output, true) }))
        }
    }

    impl DpapiBackend<Dpapi> {
        pub fn new() -> Result<Self> {
            Ok(Self::with_protector(
                Dpapi,
                config::default_key_store_path(BackendId::WindowsDpapi),
            ))
        }
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use zeroize::Zeroizing;

    use super::DataProtection;
    use crate::error::NativeError;

    /// Reversible byte mangling standing in for DPAPI.
    pub struct XorProtector(pub u8);

    impl DataProtection for XorProtector {
        fn protect(&self, plaintext: &[u8]) -> Result<Vec<u8>, NativeError> {
            let mut out = vec![0xd9];
            out.extend(plaintext.iter().map(|b| b ^ self.0));
            Ok(out)
        }

        fn unprotect(&self, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>, NativeError> {
            match ciphertext.split_first() {
                Some((0xd9, body)) => Ok(Zeroizing::new(body.iter().map(|b| b ^ self.0).collect())),
                _ => Err(NativeError::other("The data is invalid.")),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::XorProtector;
    use super::*;
    use crate::backend::conformance;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn backend_in(dir: &Path, name: &str) -> DpapiBackend<XorProtector> {
        DpapiBackend::with_protector(XorProtector(0x5a), dir.join(name))
    }

    #[test]
    fn conformance() {
        let dir = tempfile::tempdir().unwrap();
        let counter = AtomicUsize::new(0);
        conformance::run_all(|| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            Box::new(backend_in(dir.path(), &format!("store-{n}.keystore")))
        });
    }

    #[test]
    fn key_store_directory_is_created_on_first_use() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keyring-bridge").join("windows-dpapi.keystore");
        let backend = DpapiBackend::with_protector(XorProtector(0x5a), path.clone());

        assert!(backend.get_password("acme.api", "alice").unwrap_err().is_not_found());
        backend.set_password("acme.api", "alice", "p4ssw0rd!").unwrap();
        assert_eq!(
            backend.get_password("acme.api", "alice").unwrap().expose(),
            "p4ssw0rd!"
        );
        assert!(path.exists());
    }

    #[test]
    fn ciphertext_is_persisted_not_plaintext() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend_in(dir.path(), "keys.keystore");
        backend.set_password("acme.api", "alice", "p4ssw0rd!").unwrap();

        let raw = std::fs::read_to_string(dir.path().join("keys.keystore")).unwrap();
        assert!(raw.contains("acme.api"));
        assert!(!raw.contains("p4ssw0rd!"));
        assert!(dir.path().join("keys.keystore.lock").exists());
    }

    #[test]
    fn second_instance_sees_same_file() {
        let dir = tempfile::tempdir().unwrap();
        let writer = backend_in(dir.path(), "shared.keystore");
        let reader = backend_in(dir.path(), "shared.keystore");

        writer.set_password("svc", "acct", "secret").unwrap();
        assert_eq!(reader.get_password("svc", "acct").unwrap().expose(), "secret");
    }

    #[test]
    fn delete_missing_leaves_file_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend_in(dir.path(), "keys.keystore");
        backend.set_password("svc", "acct", "secret").unwrap();
        let before = std::fs::read(dir.path().join("keys.keystore")).unwrap();

        assert!(backend.delete_password("svc", "other").unwrap_err().is_not_found());
        let after = std::fs::read(dir.path().join("keys.keystore")).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn undecryptable_entry_is_decryption_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.keystore");
        std::fs::write(
            &path,
            r#"{"version":1,"entries":[{"service":"svc","account":"acct","ciphertext":"AAEC"}]}"#,
        )
        .unwrap();

        let backend = DpapiBackend::with_protector(XorProtector(0x5a), path);
        let err = backend.get_password("svc", "acct").unwrap_err();
        assert!(matches!(err, KeyringError::Decryption(_)));
    }

    #[test]
    fn key_store_path_is_configurable() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = backend_in(dir.path(), "first.keystore");
        assert!(backend.is_key_store_path_required());

        backend.set_password("svc", "acct", "one").unwrap();
        backend
            .set_key_store_path(dir.path().join("second.keystore"))
            .unwrap();
        assert_eq!(
            backend.key_store_path().unwrap(),
            dir.path().join("second.keystore")
        );
        assert!(backend.get_password("svc", "acct").unwrap_err().is_not_found());
    }

    #[test]
    fn concurrent_writers_do_not_lose_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.keystore");
        let handles: Vec<_> = (0..4)
            .map(|i| {
                // Separate instances so only the file lock serializes them.
                let backend = DpapiBackend::with_protector(XorProtector(0x5a), path.clone());
                thread::spawn(move || {
                    for j in 0..10 {
                        backend
                            .set_password("svc", &format!("acct-{i}-{j}"), "secret")
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let index = LocalIndex::<PasswordEntry>::load(&path).unwrap();
        assert_eq!(index.len(), 40);
    }
}

//! Password type that is wiped from memory on drop

use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{KeyringError, Result};

/// A password returned by a backend.
///
/// The buffer is zeroized when the value is dropped and the `Debug` and
/// `Display` implementations never print it.
///
/// ```
/// use keyring_bridge::Password;
///
/// let password = Password::new("p4ssw0rd!");
/// assert_eq!(password.expose(), "p4ssw0rd!");
/// assert!(!format!("{password:?}").contains("p4ssw0rd"));
/// ```
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Password {
    inner: String,
}

impl Password {
    #[must_use]
    pub fn new(s: impl Into<String>) -> Self {
        Self { inner: s.into() }
    }

    /// Decode native bytes as UTF-8, wiping the input either way.
    pub(crate) fn from_utf8(bytes: Zeroizing<Vec<u8>>) -> Result<Self> {
        match String::from_utf8(bytes.to_vec()) {
            Ok(inner) => Ok(Self { inner }),
            Err(e) => {
                let mut raw = e.into_bytes();
                raw.zeroize();
                Err(KeyringError::Encoding(
                    "stored password is not valid UTF-8".to_string(),
                ))
            }
        }
    }

    /// Borrow the plaintext.
    ///
    /// Keep the borrow short; do not copy the value into long-lived storage.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.inner
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl std::fmt::Debug for Password {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Password([REDACTED, {} bytes])", self.inner.len())
    }
}

impl std::fmt::Display for Password {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl PartialEq for Password {
    fn eq(&self, other: &Self) -> bool {
        self.inner.as_bytes().ct_eq(other.inner.as_bytes()).into()
    }
}

impl Eq for Password {}

impl PartialEq<&str> for Password {
    fn eq(&self, other: &&str) -> bool {
        self.inner.as_bytes().ct_eq(other.as_bytes()).into()
    }
}

//! Configuration from the environment and per-backend defaults.

use std::ffi::OsString;
use std::path::PathBuf;

use crate::backend::BackendId;

/// Backend name to bind instead of probing.
pub const BACKEND_ENV: &str = "KEYRING_BRIDGE_BACKEND";

/// Key store path for backends that keep one.
pub const KEYSTORE_ENV: &str = "KEYRING_BRIDGE_KEYSTORE";

const APP_DIR: &str = "keyring-bridge";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    /// Registered backend name; `None` probes in default order
    pub backend: Option<String>,
    /// Overrides the backend's default key store path
    pub key_store_path: Option<PathBuf>,
}

impl Config {
    /// Read [`BACKEND_ENV`] and [`KEYSTORE_ENV`]. Empty values count as unset.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var_os(name))
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<OsString>) -> Self {
        let non_empty = |name| lookup(name).filter(|v| !v.is_empty());
        Self {
            backend: non_empty(BACKEND_ENV).map(|v| v.to_string_lossy().into_owned()),
            key_store_path: non_empty(KEYSTORE_ENV).map(PathBuf::from),
        }
    }

    pub fn with_backend(mut self, name: impl Into<String>) -> Self {
        self.backend = Some(name.into());
        self
    }

    pub fn with_key_store_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.key_store_path = Some(path.into());
        self
    }
}

/// `<config dir>/keyring-bridge/<id>.keystore`, or `./<id>.keystore` when the
/// platform has no config directory.
pub fn default_key_store_path(id: BackendId) -> PathBuf {
    let file = format!("{id}.keystore");
    match dirs::config_dir() {
        Some(dir) => dir.join(APP_DIR).join(file),
        None => PathBuf::from(file),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<OsString> {
        let vars: HashMap<String, OsString> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), OsString::from(v)))
            .collect();
        move |name: &str| vars.get(name).cloned()
    }

    #[test]
    fn reads_both_variables() {
        let config = Config::from_lookup(lookup(&[
            (BACKEND_ENV, "memory"),
            (KEYSTORE_ENV, "/tmp/keys.keystore"),
        ]));
        assert_eq!(config.backend.as_deref(), Some("memory"));
        assert_eq!(
            config.key_store_path,
            Some(PathBuf::from("/tmp/keys.keystore"))
        );
    }

    #[test]
    fn empty_values_are_unset() {
        let config = Config::from_lookup(lookup(&[(BACKEND_ENV, ""), (KEYSTORE_ENV, "")]));
        assert_eq!(config, Config::default());
    }

    #[test]
    fn builders_override() {
        let config = Config::default()
            .with_backend("kwallet")
            .with_key_store_path("keys.keystore");
        assert_eq!(config.backend.as_deref(), Some("kwallet"));
        assert_eq!(config.key_store_path, Some(PathBuf::from("keys.keystore")));
    }

    #[test]
    fn default_path_is_named_after_backend() {
        let path = default_key_store_path(BackendId::GnomeKeyring);
        assert_eq!(path.file_name().unwrap(), "gnome-keyring.keystore");
        if dirs::config_dir().is_some() {
            assert_eq!(
                path.parent().unwrap().file_name().unwrap(),
                "keyring-bridge"
            );
        }
    }
}

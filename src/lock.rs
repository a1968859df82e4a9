//! Cross-process lock over a sentinel file.
//!
//! Backends that keep a local key store file take this lock around the whole
//! load, mutate and persist sequence. The lock is an OS advisory lock
//! (`flock()` on Unix, `LockFileEx` on Windows) obtained through `fs2`, so it
//! only excludes processes that also use it.
//!
//! There is no rollback: a crash between loading and persisting leaves the
//! index as it was before the call, which may disagree with the native store
//! it shadows.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::warn;

use crate::error::LockError;

/// Suffix appended to a key store path to name its lock file.
pub const LOCK_SUFFIX: &str = ".lock";

/// Advisory exclusive lock on a sentinel file.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    file: Option<File>,
}

impl FileLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
        }
    }

    /// Lock guarding the key store at `key_store` (`<key_store>.lock`).
    pub fn for_key_store(key_store: &Path) -> Self {
        let mut path = key_store.as_os_str().to_owned();
        path.push(LOCK_SUFFIX);
        Self::new(PathBuf::from(path))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_locked(&self) -> bool {
        self.file.is_some()
    }

    /// Acquires the lock, blocking until no other holder remains. A missing
    /// parent directory is created first.
    ///
    /// # Errors
    ///
    /// - [`LockError::AlreadyLocked`] if this instance already holds the lock.
    /// - [`LockError::Acquire`] if the sentinel cannot be created, opened or locked.
    pub fn lock(&mut self) -> Result<(), LockError> {
        if self.file.is_some() {
            return Err(LockError::AlreadyLocked(self.path.clone()));
        }

        let acquire = |source| LockError::Acquire {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            create_dir(parent).map_err(acquire)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .map_err(acquire)?;
        FileExt::lock_exclusive(&file).map_err(acquire)?;

        self.file = Some(file);
        Ok(())
    }

    /// Releases the lock. Failures are logged, never returned, and the
    /// instance is always left unlocked and reusable.
    pub fn release(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(e) = FileExt::unlock(&file) {
                warn!(path = %self.path.display(), error = %e, "Failed to release file lock");
            }
            drop(file);
        }
    }

    /// Acquires the lock and returns a guard that releases it on drop.
    pub fn acquire(&mut self) -> Result<FileLockGuard<'_>, LockError> {
        self.lock()?;
        Ok(FileLockGuard { lock: self })
    }
}

/// Same layout as the key store directory: owner-only on Unix.
fn create_dir(dir: &Path) -> std::io::Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(dir)
}

impl Drop for FileLock {
    fn drop(&mut self) {
        self.release();
    }
}

/// Holds a [`FileLock`] until dropped.
#[derive(Debug)]
pub struct FileLockGuard<'a> {
    lock: &'a mut FileLock,
}

impl FileLockGuard<'_> {
    pub fn path(&self) -> &Path {
        self.lock.path()
    }
}

impl Drop for FileLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn lock_path_is_derived_from_key_store() {
        let lock = FileLock::for_key_store(Path::new("/tmp/keys.keystore"));
        assert_eq!(lock.path(), Path::new("/tmp/keys.keystore.lock"));
    }

    #[test]
    fn second_lock_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let mut lock = FileLock::new(dir.path().join("store.lock"));

        lock.lock().unwrap();
        assert!(lock.is_locked());
        assert!(dir.path().join("store.lock").exists());

        let err = lock.lock().unwrap_err();
        assert!(matches!(err, LockError::AlreadyLocked(_)));
        assert!(lock.is_locked());
    }

    #[test]
    fn release_allows_relock() {
        let dir = tempfile::tempdir().unwrap();
        let mut lock = FileLock::new(dir.path().join("store.lock"));

        lock.lock().unwrap();
        lock.release();
        assert!(!lock.is_locked());
        lock.lock().unwrap();
        lock.release();
    }

    #[test]
    fn release_without_lock_is_harmless() {
        let dir = tempfile::tempdir().unwrap();
        let mut lock = FileLock::new(dir.path().join("store.lock"));
        lock.release();
        lock.release();
        assert!(!lock.is_locked());
    }

    #[test]
    fn guard_releases_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let mut lock = FileLock::new(dir.path().join("store.lock"));
        {
            let guard = lock.acquire().unwrap();
            assert!(guard.path().ends_with("store.lock"));
        }
        assert!(!lock.is_locked());
        lock.lock().unwrap();
    }

    #[test]
    fn missing_directories_are_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keyring-bridge").join("nested").join("store.lock");
        let mut lock = FileLock::new(&path);
        lock.lock().unwrap();
        assert!(lock.is_locked());
        assert!(path.exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(path.parent().unwrap()).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o700);
        }
    }

    #[test]
    fn unusable_directory_is_acquire_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        fs::write(&blocker, b"").unwrap();
        let mut lock = FileLock::new(blocker.join("store.lock"));
        let err = lock.lock().unwrap_err();
        assert!(matches!(err, LockError::Acquire { .. }));
        assert!(!lock.is_locked());
    }

    #[test]
    fn other_holder_blocks_until_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.lock");

        let mut first = FileLock::new(&path);
        first.lock().unwrap();

        let (tx, rx) = mpsc::channel();
        let contender_path = path.clone();
        let handle = thread::spawn(move || {
            let mut second = FileLock::new(contender_path);
            second.lock().unwrap();
            tx.send(()).unwrap();
            second.release();
        });

        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        first.release();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        handle.join().unwrap();
    }
}

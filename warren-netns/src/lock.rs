//! Advisory locking of the working directory

use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex, MutexGuard};

use nix::fcntl::{Flock, FlockArg};
use tracing::trace;
use warren_core::{Error, Result, WrapErr};

/// Lock serializing namespace acquisition and cleanup
///
/// Every operation except [`crate::RootlessNetns::run`] expects the caller
/// to hold this lock already.
pub trait AdvisoryLock: Send + Sync {
    /// Block until the lock is held
    fn lock(&self) -> Result<()>;

    /// Release the lock
    fn unlock(&self) -> Result<()>;
}

#[derive(Default)]
struct LockState {
    held: bool,
    file: Option<Flock<File>>,
}

/// `flock(2)` on a lock file
///
/// flock is per open file description, so threads of one process are
/// serialized by an in-process gate before the file lock is taken.
pub struct FileLock {
    path: PathBuf,
    state: Mutex<LockState>,
    released: Condvar,
}

impl std::fmt::Debug for FileLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileLock").field("path", &self.path).finish_non_exhaustive()
    }
}

impl FileLock {
    /// Create a lock on `path`, the file is created on first use
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: Mutex::new(LockState::default()),
            released: Condvar::new(),
        }
    }

    /// Path of the lock file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn state(&self) -> Result<MutexGuard<'_, LockState>> {
        self.state
            .lock()
            .map_err(|_| Error::namespace("lock state poisoned"))
    }

    fn open(&self) -> Result<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o600)
            .open(&self.path)
            .wrap_err(&format!("open lock file {}", self.path.display()))
    }
}

impl AdvisoryLock for FileLock {
    fn lock(&self) -> Result<()> {
        let mut state = self.state()?;
        while state.held {
            state = self
                .released
                .wait(state)
                .map_err(|_| Error::namespace("lock state poisoned"))?;
        }

        let file = self.open()?;
        let file = Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_, errno)| Error::wrap(format!("lock {}", self.path.display()), errno))?;

        state.held = true;
        state.file = Some(file);
        trace!(path = %self.path.display(), "Lock acquired");
        Ok(())
    }

    fn unlock(&self) -> Result<()> {
        let mut state = self.state()?;
        let file = state
            .file
            .take()
            .ok_or_else(|| Error::namespace(format!("{} is not locked", self.path.display())))?;

        state.held = false;
        drop(state);
        self.released.notify_one();

        file.unlock()
            .map_err(|(_, errno)| Error::wrap(format!("unlock {}", self.path.display()), errno))?;
        trace!(path = %self.path.display(), "Lock released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_lock_unlock() {
        let dir = tempfile::tempdir().unwrap();
        let lock = FileLock::new(dir.path().join("lock"));

        lock.lock().unwrap();
        assert!(lock.path().exists());
        lock.unlock().unwrap();

        lock.lock().unwrap();
        lock.unlock().unwrap();
    }

    #[test]
    fn test_unlock_without_lock() {
        let dir = tempfile::tempdir().unwrap();
        let lock = FileLock::new(dir.path().join("lock"));
        assert!(lock.unlock().is_err());
    }

    #[test]
    fn test_lock_serializes_threads() {
        let dir = tempfile::tempdir().unwrap();
        let lock = Arc::new(FileLock::new(dir.path().join("lock")));
        let inside = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lock = Arc::clone(&lock);
                let inside = Arc::clone(&inside);
                std::thread::spawn(move || {
                    for _ in 0..20 {
                        lock.lock().unwrap();
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        std::thread::yield_now();
                        inside.fetch_sub(1, Ordering::SeqCst);
                        lock.unlock().unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_lock_excludes_other_open_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock");
        let lock = FileLock::new(&path);
        lock.lock().unwrap();

        let other = File::open(&path).unwrap();
        assert!(Flock::lock(other, FlockArg::LockExclusiveNonblock).is_err());

        lock.unlock().unwrap();
        let other = File::open(&path).unwrap();
        assert!(Flock::lock(other, FlockArg::LockExclusiveNonblock).is_ok());
    }
}

//! Network namespace handle bound to a mount point
//!
//! The namespace is kept alive by bind-mounting its nsfs file onto a regular
//! file in the working directory. Every operation that needs to be inside
//! the namespace runs on a dedicated thread, so the calling thread never
//! changes namespaces and any mount namespace built on that thread is
//! released when it exits.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::mount::{MntFlags, MsFlags, mount, umount2};
use nix::sched::{CloneFlags, setns, unshare};
use nix::sys::statfs::{Statfs, fstatfs, statfs};
use tracing::{debug, warn};
use warren_core::{Error, Result};

/// Magic number of the nsfs pseudo filesystem
const NSFS_MAGIC: i64 = 0x6e73_6673;

/// Namespace file of the calling thread
const THREAD_NETNS: &str = "/proc/thread-self/ns/net";

const REMOVE_RETRY_INTERVAL: Duration = Duration::from_millis(10);
const REMOVE_RETRY_TIMEOUT: Duration = Duration::from_secs(60);

/// Open network namespace
///
/// The file descriptor is closed when the handle is dropped, on every exit
/// path. Dropping the handle does not destroy the namespace, the mount point
/// keeps it alive until [`unmount`] is called.
#[derive(Debug)]
pub struct NetnsHandle {
    file: File,
    path: PathBuf,
}

impl NetnsHandle {
    /// Open the namespace mounted at `path`
    ///
    /// Fails with [`Error::NotNamespace`] if a file exists at `path` but is
    /// not an nsfs object, e.g. a mount point left behind by a crash before
    /// the bind mount happened.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;

        if !is_nsfs(&fstatfs(&file)?) {
            return Err(Error::NotNamespace {
                path: path.to_path_buf(),
            });
        }

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Create a new, empty network namespace and bind it to `path`
    ///
    /// `path` must not exist. On failure the mount point is removed again.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(path)
            .map_err(|e| {
                Error::namespace(format!("failed to create mount point {}: {e}", path.display()))
            })?;

        let bound = std::thread::scope(|s| {
            s.spawn(|| bind_new_netns(path))
                .join()
                .unwrap_or_else(|_| Err(Error::namespace("netns creation thread panicked")))
        });

        if let Err(e) = bound {
            if let Err(rm) = std::fs::remove_file(path) {
                warn!(path = %path.display(), error = %rm, "Failed to remove mount point");
            }
            return Err(e);
        }

        debug!(path = %path.display(), "Created network namespace");
        Self::open(path)
    }

    /// Mount point of the namespace
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Inode of the namespace, equal for handles of the same namespace
    pub fn inode(&self) -> Result<u64> {
        Ok(self.file.metadata()?.ino())
    }

    /// Run `f` on a thread that has joined this namespace
    ///
    /// Namespace changes made by `f` (such as a new mount namespace) are
    /// confined to that thread. A panic in `f` is reported as an error.
    pub fn run<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send,
        T: Send,
    {
        std::thread::scope(|s| {
            s.spawn(|| {
                setns(&self.file, CloneFlags::CLONE_NEWNET).map_err(|e| {
                    Error::namespace(format!(
                        "failed to enter network namespace {}: {e}",
                        self.path.display()
                    ))
                })?;
                f()
            })
            .join()
            .unwrap_or_else(|_| Err(Error::namespace("network namespace thread panicked")))
        })
    }
}

#[allow(clippy::cast_possible_wrap, clippy::unnecessary_cast)]
fn is_nsfs(stat: &Statfs) -> bool {
    stat.filesystem_type().0 as i64 == NSFS_MAGIC
}

fn bind_new_netns(target: &Path) -> Result<()> {
    unshare(CloneFlags::CLONE_NEWNET)
        .map_err(|e| Error::namespace(format!("failed to create network namespace: {e}")))?;

    mount(
        Some(THREAD_NETNS),
        target,
        Some("none"),
        MsFlags::MS_BIND | MsFlags::MS_SHARED | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| {
        Error::namespace(format!(
            "failed to bind mount ns at {}: {e}",
            target.display()
        ))
    })
}

/// Unmount the namespace at `path` and remove the mount point
///
/// Idempotent: a missing path is not an error. A file that is not a
/// namespace is only removed.
pub fn unmount(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();

    match statfs(path) {
        Ok(stat) if is_nsfs(&stat) => {
            match umount2(path, MntFlags::MNT_DETACH) {
                Ok(()) | Err(Errno::EINVAL | Errno::ENOENT) => {}
                Err(e) => {
                    return Err(Error::namespace(format!(
                        "failed to unmount NS: at {}: {e}",
                        path.display()
                    )));
                }
            }
        }
        Ok(_) => debug!(path = %path.display(), "Mount point is not a namespace, removing it"),
        Err(Errno::ENOENT) => return Ok(()),
        Err(e) => {
            return Err(Error::namespace(format!(
                "failed to stat {}: {e}",
                path.display()
            )));
        }
    }

    remove_mount_point(path)
}

fn remove_mount_point(path: &Path) -> Result<()> {
    let started = Instant::now();
    loop {
        match std::fs::remove_file(path) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e)
                if e.raw_os_error() == Some(Errno::EBUSY as i32)
                    && started.elapsed() < REMOVE_RETRY_TIMEOUT =>
            {
                std::thread::sleep(REMOVE_RETRY_INTERVAL);
            }
            Err(e) => {
                return Err(Error::namespace(format!(
                    "failed to remove ns path {}: {e}",
                    path.display()
                )));
            }
        }
    }
}

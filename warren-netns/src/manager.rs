//! Rootless network namespace manager
//!
//! One namespace per working directory is shared by every process of the
//! user. Creation and teardown are decided by the persistent reference
//! count, which callers protect with an [`AdvisoryLock`].

use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use tracing::{debug, error, warn};
use warren_core::{Error, MultiError, NetworkInfo, ProcessId, Result, WrapErr};

use crate::config::{HelperKind, NetworkConfig, PluginBackend};
use crate::helper::{NetworkHelper, Pasta, Slirp4netns};
use crate::launcher::Launcher;
use crate::lock::AdvisoryLock;
use crate::mounts::MountSetup;
use crate::netns::{self, NetnsHandle};
use crate::refcount;
use crate::resolvconf::{HostResolvConf, ResolvConfGenerator};
use crate::supervisor::{Supervisor, Systemd};
use crate::{NETNS_NAME, PID_FILE};

/// Rootless network namespace manager
pub struct RootlessNetns {
    dir: PathBuf,
    config: NetworkConfig,
    helper: Arc<dyn NetworkHelper>,
    resolv_conf: Arc<dyn ResolvConfGenerator>,
    supervisor: Arc<dyn Supervisor>,
    info: Mutex<NetworkInfo>,
}

impl std::fmt::Debug for RootlessNetns {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootlessNetns")
            .field("dir", &self.dir)
            .field("helper", &self.helper.name())
            .finish_non_exhaustive()
    }
}

impl RootlessNetns {
    /// Create a manager for the namespace in `dir`
    ///
    /// The helper follows `config.helper`; the directory is created if
    /// needed.
    pub fn new(dir: impl Into<PathBuf>, config: NetworkConfig) -> Result<Self> {
        let dir = dir.into();
        create_dir(&dir).wrap_err("")?;

        let helper = default_helper(&config);
        Ok(Self {
            dir,
            resolv_conf: Arc::new(HostResolvConf::new(&config.resolv_conf)),
            supervisor: Arc::new(Systemd::new()),
            helper,
            config,
            info: Mutex::new(NetworkInfo::default()),
        })
    }

    /// Replace the networking helper
    #[must_use]
    pub fn with_helper(mut self, helper: Arc<dyn NetworkHelper>) -> Self {
        self.helper = helper;
        self
    }

    /// Replace the resolv.conf generator
    #[must_use]
    pub fn with_resolv_conf_generator(mut self, generator: Arc<dyn ResolvConfGenerator>) -> Self {
        self.resolv_conf = generator;
        self
    }

    /// Replace the process supervisor
    #[must_use]
    pub fn with_supervisor(mut self, supervisor: Arc<dyn Supervisor>) -> Self {
        self.supervisor = supervisor;
        self
    }

    /// Working directory
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Mount point of the namespace
    #[must_use]
    pub fn netns_path(&self) -> PathBuf {
        self.dir.join(NETNS_NAME)
    }

    /// Current reference count
    pub fn ref_count(&self) -> Result<u64> {
        refcount::read(&self.dir)
    }

    /// Network information of the helper
    ///
    /// Filled in when this manager started the helper or found it running.
    #[must_use]
    pub fn info(&self) -> NetworkInfo {
        self.info
            .lock()
            .map(|info| info.clone())
            .unwrap_or_default()
    }

    fn set_info(&self, info: NetworkInfo) {
        if let Ok(mut current) = self.info.lock() {
            *current = info;
        }
    }

    /// Open the namespace, creating it and starting the helper if needed
    ///
    /// Returns `true` alongside the handle if the namespace was created.
    /// The caller must hold the lock.
    pub fn acquire_or_create(&self) -> Result<(NetnsHandle, bool)> {
        let ns_path = self.netns_path();

        let handle = match NetnsHandle::open(&ns_path) {
            Ok(handle) => {
                if self.helper_running() {
                    let info = NetworkInfo::read(&self.dir)?;
                    self.set_info(info);
                    return Ok((handle, false));
                }
                handle
            }
            Err(e) => {
                // Left behind by a crash between creating the mount point
                // and mounting it
                if matches!(e, Error::NotNamespace { .. }) {
                    warn!(path = %ns_path.display(), "Removing stale rootless netns mount point");
                    let _ = std::fs::remove_file(&ns_path);
                }

                debug!(path = %ns_path.display(), "Creating rootless network namespace");
                // cleanup may have removed the directory
                create_dir(&self.dir).wrap_err("")?;
                NetnsHandle::create(&ns_path).wrap_err("create netns")?
            }
        };

        let launcher = Launcher::new(&self.dir, self.resolv_conf.as_ref(), self.supervisor.as_ref());
        match launcher.launch(self.config.helper, self.helper.as_ref(), &ns_path) {
            Ok(info) => {
                self.set_info(info);
                Ok((handle, true))
            }
            Err(e) => {
                drop(handle);
                self.rollback();
                Err(e)
            }
        }
    }

    /// Undo a namespace whose helper failed to come up completely
    ///
    /// A helper that did start holds the namespace open, so it is stopped
    /// along with the unmount.
    fn rollback(&self) {
        if let Err(e) = netns::unmount(self.netns_path()) {
            error!(error = %e, "Failed to unmount rootless netns after failed helper start");
        }
        if let Err(e) = self.stop_helper() {
            error!(error = %e, "Failed to stop rootless netns helper after failed start");
        }
        match std::fs::remove_file(self.dir.join(PID_FILE)) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                error!(error = %e, "Failed to remove rootless netns helper pid file");
            }
            _ => {}
        }
    }

    fn helper_running(&self) -> bool {
        let pid_file = self.dir.join(PID_FILE);
        let pid = match read_pid_file(&pid_file) {
            Ok(pid) => pid,
            Err(e) => {
                warn!(error = %e, "failed to read rootless netns program pid");
                return false;
            }
        };

        match kill(pid.as_nix_pid(), None) {
            Ok(()) => true,
            Err(Errno::ESRCH) => {
                warn!(pid = %pid, "rootless netns program no longer running, trying to start it again");
                false
            }
            Err(e) => {
                warn!(
                    pid = %pid,
                    error = %e,
                    "failed to check if rootless netns program is running, trying to start it again"
                );
                false
            }
        }
    }

    /// Tear everything down
    ///
    /// Every step is attempted; their errors are collected. A missing
    /// working directory means there is nothing to do.
    pub fn cleanup(&self) -> Result<()> {
        match std::fs::symlink_metadata(&self.dir) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        debug!(dir = %self.dir.display(), "Cleaning up rootless network namespace");

        let mut errors = MultiError::new();
        errors.check(netns::unmount(self.netns_path()));
        errors.check(self.stop_helper().wrap_err("kill network process"));

        match std::fs::remove_dir_all(&self.dir) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                errors.push(Error::wrap("remove rootless netns dir", e));
            }
            _ => {}
        }

        errors.into_result()
    }

    fn stop_helper(&self) -> Result<()> {
        let pid_file = self.dir.join(PID_FILE);
        let pid = match read_pid_file(&pid_file) {
            Ok(pid) => pid,
            Err(e) if e.is_not_found() => {
                debug!(path = %pid_file.display(), "Rootless netns conn pid file does not exist");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        match kill(pid.as_nix_pid(), Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn run_inner<F>(&self, work: F, cleanup_new: bool) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send,
    {
        let (handle, created) = self.acquire_or_create()?;
        let mounts = self.mount_setup();

        let result = handle.run(move || {
            mounts.apply()?;
            work()
        });
        drop(handle);

        if result.is_err() && created && cleanup_new {
            if let Err(e) = self.cleanup() {
                error!(error = %e, "Rootless netns cleanup error after failed setup");
            }
        }
        result
    }

    fn mount_setup(&self) -> MountSetup {
        let setup = MountSetup::new(&self.dir, self.config.runtime_dir())
            .with_resolv_conf(&self.config.resolv_conf);
        match self.config.plugins {
            PluginBackend::Cni => setup.with_cni_state_dir(&self.config.cni_state_dir),
            PluginBackend::Netavark => setup,
        }
    }

    /// Run `work` in the namespace and add `nets` users
    ///
    /// A namespace created by this call is torn down again if `work`
    /// fails. The caller must hold the lock.
    pub fn setup<F>(&self, nets: u32, work: F) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send,
    {
        self.run_inner(work, true)?;
        refcount::adjust(&self.dir, i64::from(nets))?;
        Ok(())
    }

    /// Run `work` in the namespace and remove `nets` users
    ///
    /// The namespace is cleaned up once the count drops to zero. Nothing is
    /// decremented if `work` fails, the caller retries. The caller must hold
    /// the lock.
    pub fn teardown<F>(&self, nets: u32, work: F) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send,
    {
        self.run_inner(work, true)?;

        let count = refcount::adjust(&self.dir, -i64::from(nets))?;
        if count == 0 {
            return self.cleanup();
        }
        Ok(())
    }

    /// Run long-lived `work` in the namespace
    ///
    /// `lock` is held while counting and acquiring but released while
    /// `work` runs.
    pub fn run<F>(&self, lock: &dyn AdvisoryLock, work: F) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send,
    {
        lock.lock()?;
        let result = self.run_locked(lock, work);
        if let Err(e) = lock.unlock() {
            warn!(error = %e, "Failed to release rootless netns lock");
        }
        result
    }

    fn run_locked<F>(&self, lock: &dyn AdvisoryLock, work: F) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send,
    {
        create_dir(&self.dir).wrap_err("")?;
        refcount::adjust(&self.dir, 1)?;

        let unlocked = move || {
            lock.unlock()?;
            let result = work();
            lock.lock()?;
            result
        };
        let result = self.run_inner(unlocked, false);

        match refcount::adjust(&self.dir, -1) {
            Err(e) if result.is_ok() => return Err(e),
            Err(e) => {
                error!(error = %e, "Failed to decrement ref count");
                return result;
            }
            Ok(0) => self.cleanup().wrap_err("cleanup")?,
            Ok(_) => {}
        }
        result
    }
}

fn default_helper(config: &NetworkConfig) -> Arc<dyn NetworkHelper> {
    let dirs = config.helper_binaries_dirs.clone();
    match config.helper {
        HelperKind::Pasta => Arc::new(Pasta::new(dirs, config.pasta_options.clone())),
        HelperKind::Slirp4netns => {
            let slirp = Slirp4netns::new(dirs, config.slirp_options.clone());
            match &config.network_cmd_path {
                Some(path) => Arc::new(slirp.with_binary(path)),
                None => Arc::new(slirp),
            }
        }
    }
}

fn create_dir(dir: &Path) -> std::io::Result<()> {
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(dir)
}

fn read_pid_file(path: &Path) -> Result<ProcessId> {
    std::fs::read_to_string(path)?.parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(dir: &Path) -> RootlessNetns {
        RootlessNetns::new(dir, NetworkConfig::new()).unwrap()
    }

    #[test]
    fn test_new_creates_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("warren/rootless-netns");
        let netns = manager(&dir);

        assert!(dir.is_dir());
        assert_eq!(netns.netns_path(), dir.join("rootless-netns"));
        assert_eq!(netns.ref_count().unwrap(), 0);
        assert_eq!(netns.info(), NetworkInfo::default());
    }

    #[test]
    fn test_default_helper_follows_config() {
        let pasta = default_helper(&NetworkConfig::new().with_helper(HelperKind::Pasta));
        assert_eq!(pasta.name(), "pasta");

        let slirp = default_helper(&NetworkConfig::new());
        assert_eq!(slirp.name(), "slirp4netns");
    }

    #[test]
    fn test_cleanup_twice() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("rootless-netns");
        let netns = manager(&dir);
        std::fs::write(dir.join("ref-count"), "0").unwrap();

        netns.cleanup().unwrap();
        assert!(!dir.exists());
        netns.cleanup().unwrap();
    }

    #[test]
    fn test_cleanup_stale_files() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("rootless-netns");
        let netns = manager(&dir);

        // Not a namespace, and a helper that has already exited
        std::fs::write(netns.netns_path(), "").unwrap();
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        std::fs::write(dir.join(PID_FILE), pid.to_string()).unwrap();

        netns.cleanup().unwrap();
        assert!(!dir.exists());
    }

    #[test]
    fn test_cleanup_reports_bad_pid_file() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("rootless-netns");
        let netns = manager(&dir);
        std::fs::write(dir.join(PID_FILE), "garbage").unwrap();

        let err = netns.cleanup().unwrap_err();
        assert!(err.to_string().contains("kill network process"));
        // The remaining steps still ran
        assert!(!dir.exists());
    }

    #[test]
    fn test_cleanup_stops_helper() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("rootless-netns");
        let netns = manager(&dir);

        let mut child = std::process::Command::new("sleep").arg("60").spawn().unwrap();
        std::fs::write(dir.join(PID_FILE), child.id().to_string()).unwrap();

        netns.cleanup().unwrap();
        let status = child.wait().unwrap();
        assert!(!status.success());
    }

    #[test]
    fn test_rollback_stops_started_helper() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("rootless-netns");
        let netns = manager(&dir);

        std::fs::write(netns.netns_path(), "").unwrap();
        let mut child = std::process::Command::new("sleep").arg("60").spawn().unwrap();
        std::fs::write(dir.join(PID_FILE), child.id().to_string()).unwrap();

        netns.rollback();
        let status = child.wait().unwrap();
        assert!(!status.success());
        assert!(!dir.join(PID_FILE).exists());
        assert!(!netns.netns_path().exists());
        assert!(dir.is_dir());

        // Nothing left to undo
        netns.rollback();
    }

    #[test]
    fn test_helper_running() {
        let tmp = tempfile::tempdir().unwrap();
        let netns = manager(tmp.path());
        assert!(!netns.helper_running());

        std::fs::write(tmp.path().join(PID_FILE), std::process::id().to_string()).unwrap();
        assert!(netns.helper_running());

        std::fs::write(tmp.path().join(PID_FILE), "-1").unwrap();
        assert!(!netns.helper_running());
    }
}

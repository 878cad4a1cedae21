//! Private mount namespace for work inside the rootless network namespace
//!
//! Plugins and helpers running in the namespace need a writable `/run` and
//! CNI state directory, and a resolver file of their own, without touching
//! the host mount namespace. The tree under `<workdir>/run` is prepared with
//! the required bind mounts and then mounted over `/run`.
//!
//! Must run on the thread that joined the network namespace, see
//! [`crate::NetnsHandle::run`].

use std::fs::OpenOptions;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use nix::mount::{MsFlags, mount};
use nix::sched::{CloneFlags, unshare};
use tracing::debug;
use warren_core::{Error, Result, WrapErr};

use crate::resolve::{is_below, resolve_path};
use crate::selinux::{self, IPTABLES_VAR_RUN_LABEL};
use crate::{RESOLV_CONF_FILE, RUN_DIR};

const RUN: &str = "/run";
const RUN_SYSTEMD: &str = "/run/systemd";
const SYSTEMD_RESOLVE: &str = "/run/systemd/resolve";

/// Builder of the private mount namespace
#[derive(Debug, Clone)]
pub struct MountSetup {
    workdir: PathBuf,
    runtime_dir: PathBuf,
    resolv_conf: PathBuf,
    cni_state_dir: Option<PathBuf>,
}

impl MountSetup {
    /// Create a mount setup for the namespace in `workdir`
    #[must_use]
    pub fn new(workdir: impl Into<PathBuf>, runtime_dir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            runtime_dir: runtime_dir.into(),
            resolv_conf: PathBuf::from("/etc/resolv.conf"),
            cni_state_dir: None,
        }
    }

    /// Override the host resolver file
    #[must_use]
    pub fn with_resolv_conf(mut self, path: impl Into<PathBuf>) -> Self {
        self.resolv_conf = path.into();
        self
    }

    /// Make the CNI state directory writable
    #[must_use]
    pub fn with_cni_state_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.cni_state_dir = Some(path.into());
        self
    }

    /// Location of the host path `path` inside the working directory
    #[must_use]
    pub fn host_path(&self, path: &Path) -> PathBuf {
        workdir_path(&self.workdir, path)
    }

    /// Build the mount namespace
    ///
    /// The order matters: every bind mount below `/run` must exist in the
    /// private tree before the tree replaces `/run`. A failed step leaves
    /// earlier mounts in place, they disappear with the calling thread.
    pub fn apply(&self) -> Result<()> {
        unshare(CloneFlags::CLONE_NEWNS).wrap_err("create new mount namespace")?;

        // Slave, not private: host unmounts must still reach us or we keep
        // devices busy that the host no longer sees as mounted
        mount(
            None::<&str>,
            "/",
            None::<&str>,
            MsFlags::MS_SLAVE | MsFlags::MS_REC,
            None::<&str>,
        )
        .wrap_err("set mount propagation to slave in new mount namespace")?;

        let rec_bind = MsFlags::MS_BIND | MsFlags::MS_REC;

        // Namespace paths of other containers live in the runtime dir
        mount_and_mkdir_dest(
            &self.runtime_dir,
            &self.host_path(&self.runtime_dir),
            None,
            rec_bind,
        )?;

        let run_systemd = Path::new(RUN_SYSTEMD);
        if run_systemd.exists() {
            mount_and_mkdir_dest(run_systemd, &self.host_path(run_systemd), None, rec_bind)?;
        }

        self.mount_resolv_conf()?;

        if let Some(cni_dir) = &self.cni_state_dir {
            self.mount_cni_dir(cni_dir)?;
        }

        let run_dir = self.workdir.join(RUN_DIR);
        mkdir_all(&run_dir).wrap_err("create run directory")?;
        selinux::relabel(&run_dir, IPTABLES_VAR_RUN_LABEL)?;
        mount_and_mkdir_dest(&run_dir, Path::new(RUN), None, rec_bind)?;

        debug!(workdir = %self.workdir.display(), "Mount namespace ready");
        Ok(())
    }

    fn mount_resolv_conf(&self) -> Result<()> {
        let run = Path::new(RUN);
        let mut target = resolve_path(&self.resolv_conf, run)?;

        // systemd-resolved replaces its files by rename, which would drop a
        // bind mount on the old inode
        if is_below(&target, Path::new(SYSTEMD_RESOLVE)) {
            mount_and_mkdir_dest(
                Path::new("tmpfs"),
                &self.host_path(Path::new(SYSTEMD_RESOLVE)),
                Some("tmpfs"),
                MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
            )?;
        }

        if is_below(&target, run) {
            target = self.host_path(&target);
            if let Some(parent) = target.parent() {
                mkdir_all(parent).wrap_err("create resolv.conf directory")?;
            }
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .mode(0o600)
                .open(&target)
                .wrap_err("create resolv.conf file")?;
        }

        let source = self.workdir.join(RESOLV_CONF_FILE);
        mount(
            Some(&source),
            &target,
            Some("none"),
            MsFlags::MS_BIND,
            None::<&str>,
        )
        .wrap_err(&format!("mount resolv.conf to {}", target.display()))?;

        debug!(target = %target.display(), "Mounted resolv.conf");
        Ok(())
    }

    fn mount_cni_dir(&self, cni_dir: &Path) -> Result<()> {
        let target = first_existing_ancestor(cni_dir).ok_or_else(|| {
            Error::namespace(format!("failed to stat {} directory", cni_dir.display()))
        })?;

        let source = self.host_path(&target);
        mkdir_all(&source).wrap_err("create var dir")?;
        selinux::relabel(&source, IPTABLES_VAR_RUN_LABEL)?;

        mount(
            Some(&source),
            &target,
            Some("none"),
            MsFlags::MS_BIND,
            None::<&str>,
        )
        .wrap_err(&format!(
            "mount {} to {}",
            source.display(),
            target.display()
        ))?;

        debug!(target = %target.display(), "Mounted CNI state directory");
        Ok(())
    }
}

/// Join an absolute host path below `workdir`
#[must_use]
pub fn workdir_path(workdir: &Path, path: &Path) -> PathBuf {
    workdir.join(path.strip_prefix("/").unwrap_or(path))
}

/// Find `path` or its closest existing ancestor, never `/` itself
#[must_use]
pub fn first_existing_ancestor(path: &Path) -> Option<PathBuf> {
    path.ancestors()
        .take_while(|p| !p.as_os_str().is_empty() && *p != Path::new("/"))
        .find(|p| p.exists())
        .map(Path::to_path_buf)
}

fn mkdir_all(path: &Path) -> std::io::Result<()> {
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(path)
}

fn mount_and_mkdir_dest(
    source: &Path,
    target: &Path,
    fstype: Option<&str>,
    flags: MsFlags,
) -> Result<()> {
    mkdir_all(target).wrap_err("create mount point")?;

    mount(Some(source), target, Some(fstype.unwrap_or("none")), flags, None::<&str>).wrap_err(
        &format!(
            "mount {} to {}",
            source.display(),
            target.display()
        ),
    )?;

    debug!(target = %target.display(), "Mounted");
    Ok(())
}

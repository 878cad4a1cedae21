//! Helper launch and bookkeeping
//!
//! Starts the configured helper against a fresh namespace, records its PID,
//! writes the namespace resolv.conf and persists the [`NetworkInfo`].

use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use tracing::{debug, error};
use warren_core::{Error, NetworkInfo, ProcessId, Result, WrapErr};

use crate::config::HelperKind;
use crate::helper::slirp::{DEFAULT_SUBNET, dns_address, namespace_address};
use crate::helper::{HelperOptions, NetworkHelper};
use crate::resolvconf::{ResolvConfGenerator, ResolvConfParams};
use crate::supervisor::Supervisor;
use crate::{PID_FILE, RESOLV_CONF_FILE};

/// Launches helpers for the namespace in one working directory
pub struct Launcher<'a> {
    workdir: &'a Path,
    resolv_conf: &'a dyn ResolvConfGenerator,
    supervisor: &'a dyn Supervisor,
}

impl<'a> Launcher<'a> {
    /// Create a launcher writing into `workdir`
    #[must_use]
    pub fn new(
        workdir: &'a Path,
        resolv_conf: &'a dyn ResolvConfGenerator,
        supervisor: &'a dyn Supervisor,
    ) -> Self {
        Self {
            workdir,
            resolv_conf,
            supervisor,
        }
    }

    fn pid_file(&self) -> PathBuf {
        self.workdir.join(PID_FILE)
    }

    /// Start `helper` for the namespace mounted at `netns`
    pub fn launch(
        &self,
        kind: HelperKind,
        helper: &dyn NetworkHelper,
        netns: &Path,
    ) -> Result<NetworkInfo> {
        let opts = HelperOptions {
            netns: netns.to_path_buf(),
            pid_file: self.pid_file(),
        };

        let info = match kind {
            HelperKind::Pasta => self.launch_pasta(helper, &opts)?,
            HelperKind::Slirp4netns => self.launch_slirp(helper, &opts)?,
        };

        info.write(self.workdir)?;
        debug!(helper = helper.name(), addresses = ?info.ip_addresses, "Helper ready");
        Ok(info)
    }

    fn launch_pasta(&self, helper: &dyn NetworkHelper, opts: &HelperOptions) -> Result<NetworkInfo> {
        let out = helper.setup(opts).wrap_err("setting up Pasta")?;

        if self.supervisor.runs_on_systemd() {
            // pasta daemonizes and writes the pid file itself
            let pid = std::fs::read_to_string(&opts.pid_file)
                .map_err(Error::from)
                .and_then(|content| content.parse::<ProcessId>())
                .wrap_err("unable to decode pasta PID")?;
            self.move_to_user_scope("pasta", pid);
        }

        self.write_resolv_conf(out.ipv6, out.dns_forward.clone())?;

        Ok(NetworkInfo {
            ip_addresses: out.addresses,
            dns_forward_ips: out.dns_forward,
            map_guest_ips: !out.map_guest.is_empty(),
        })
    }

    fn launch_slirp(&self, helper: &dyn NetworkHelper, opts: &HelperOptions) -> Result<NetworkInfo> {
        let out = helper.setup(opts).wrap_err("start slirp4netns")?;
        let pid = out.pid.ok_or_else(|| {
            Error::wrap(
                "start slirp4netns",
                Error::namespace("helper did not report its pid"),
            )
        })?;

        write_pid_file(&opts.pid_file, pid).wrap_err("write slirp4netns pid file")?;

        if self.supervisor.runs_on_systemd() {
            self.move_to_user_scope("slirp4netns", pid);
        }

        let subnet = out.subnet.unwrap_or(DEFAULT_SUBNET);
        let dns = dns_address(&subnet).wrap_err("determine default slirp4netns DNS address")?;
        let ip = namespace_address(&subnet).wrap_err("determine default slirp4netns ip address")?;

        self.write_resolv_conf(out.ipv6, vec![dns.into()])?;

        Ok(NetworkInfo {
            ip_addresses: vec![ip.into()],
            dns_forward_ips: vec![dns.into()],
            map_guest_ips: false,
        })
    }

    fn move_to_user_scope(&self, helper: &str, pid: ProcessId) {
        if let Err(e) = self.supervisor.move_to_user_scope(pid) {
            error!(
                pid = %pid,
                error = %e,
                "failed to move the rootless netns {helper} process to the systemd user.slice"
            );
        }
    }

    fn write_resolv_conf(&self, ipv6: bool, nameservers: Vec<std::net::IpAddr>) -> Result<()> {
        self.resolv_conf
            .generate(&ResolvConfParams {
                path: self.workdir.join(RESOLV_CONF_FILE),
                netns: true,
                ipv6_enabled: ipv6,
                keep_host_servers: true,
                nameservers,
            })
            .wrap_err("create resolv.conf")
    }
}

fn write_pid_file(path: &Path, pid: ProcessId) -> std::io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(pid.to_string().as_bytes())
}

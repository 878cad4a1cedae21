//! slirp4netns(1) helper
//!
//! slirp4netns stays attached to us: it signals readiness by writing to a
//! pipe inherited as fd 3 and it does not write a PID file itself.

#![allow(unsafe_code)]

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::net::Ipv4Addr;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sched::{CloneFlags, unshare};
use tracing::debug;
use warren_core::{Error, ProcessId, Result};

use super::{HelperOptions, HelperOutput, Ipv4Subnet, NetworkHelper, find_helper_binary};

const BINARY: &str = "slirp4netns";

/// Fd number of the ready pipe in the child
const READY_FD: i32 = 3;

/// Default MTU
pub const DEFAULT_MTU: u32 = 65520;

/// Smallest MTU accepted
pub const MIN_MTU: u32 = 68;

/// Subnet used when no `cidr` option is set
pub const DEFAULT_SUBNET: Ipv4Subnet =
    match Ipv4Subnet::from_parts(Ipv4Addr::new(10, 0, 2, 0), 24) {
        Some(subnet) => subnet,
        None => panic!("invalid default subnet"),
    };

const READY_POLL_INTERVAL_MS: u16 = 1000;

/// Offset of the built-in DNS forwarder in the subnet
const DNS_OFFSET: u32 = 3;

/// Offset of the namespace address in the subnet
const IP_OFFSET: u32 = 100;

/// Nameserver slirp4netns serves in `subnet`
pub fn dns_address(subnet: &Ipv4Subnet) -> Result<Ipv4Addr> {
    subnet.offset(DNS_OFFSET)
}

/// Address slirp4netns assigns in `subnet`
pub fn namespace_address(subnet: &Ipv4Subnet) -> Result<Ipv4Addr> {
    subnet.offset(IP_OFFSET)
}

/// Features advertised in `slirp4netns --help`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct SlirpFeatures {
    disable_host_loopback: bool,
    mtu: bool,
    enable_sandbox: bool,
    enable_seccomp: bool,
    cidr: bool,
    outbound_addr: bool,
    ipv6: bool,
}

impl SlirpFeatures {
    /// Parse the help output
    #[must_use]
    pub fn from_help(help: &str) -> Self {
        Self {
            disable_host_loopback: help.contains("--disable-host-loopback"),
            mtu: help.contains("--mtu"),
            enable_sandbox: help.contains("--enable-sandbox"),
            enable_seccomp: help.contains("--enable-seccomp"),
            cidr: help.contains("--cidr"),
            outbound_addr: help.contains("--outbound-addr"),
            ipv6: help.contains("--enable-ipv6"),
        }
    }

    fn detect(binary: &Path) -> Result<Self> {
        let out = Command::new(binary)
            .arg("--help")
            .output()
            .map_err(|e| helper_error(format!("checking slirp4netns binary {}: {e}", binary.display())))?;

        let mut help = String::from_utf8_lossy(&out.stdout).into_owned();
        help.push_str(&String::from_utf8_lossy(&out.stderr));

        if !out.status.success() {
            return Err(helper_error(format!(
                "checking slirp4netns binary {}: {help:?}",
                binary.display()
            )));
        }
        Ok(Self::from_help(&help))
    }
}

/// Parsed `key=value` slirp4netns options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlirpOptions {
    /// Subnet served to the namespace
    pub cidr: Option<Ipv4Subnet>,
    /// Block connections to the host loopback
    pub disable_host_loopback: bool,
    /// IPv6 connectivity
    pub enable_ipv6: bool,
    /// Tap interface MTU
    pub mtu: u32,
    /// Outbound IPv4 address or interface
    pub outbound_addr: Option<String>,
    /// Outbound IPv6 address or interface
    pub outbound_addr6: Option<String>,
}

impl Default for SlirpOptions {
    fn default() -> Self {
        Self {
            cidr: None,
            disable_host_loopback: true,
            enable_ipv6: true,
            mtu: DEFAULT_MTU,
            outbound_addr: None,
            outbound_addr6: None,
        }
    }
}

impl SlirpOptions {
    /// Parse options of the form `key=value`
    pub fn parse(options: &[String]) -> Result<Self> {
        let mut opts = Self::default();

        for option in options {
            let (key, value) = option.split_once('=').ok_or_else(|| {
                Error::invalid_config(format!("unknown option for slirp4netns: {option:?}"))
            })?;

            match key {
                "cidr" => opts.cidr = Some(value.parse()?),
                "allow_host_loopback" => opts.disable_host_loopback = !parse_bool(key, value)?,
                "enable_ipv6" => opts.enable_ipv6 = parse_bool(key, value)?,
                "mtu" => {
                    opts.mtu = value
                        .parse()
                        .ok()
                        .filter(|mtu| *mtu >= MIN_MTU)
                        .ok_or_else(|| Error::invalid_config(format!("invalid mtu {value:?}")))?;
                }
                "outbound_addr" => {
                    let valid = value.parse::<Ipv4Addr>().is_ok() || interface_exists(value);
                    if !valid {
                        return Err(Error::invalid_config(format!("invalid outbound_addr {value:?}")));
                    }
                    opts.outbound_addr = Some(value.to_string());
                }
                "outbound_addr6" => {
                    let valid = value.parse::<std::net::Ipv6Addr>().is_ok() || interface_exists(value);
                    if !valid {
                        return Err(Error::invalid_config(format!("invalid outbound_addr6: {value:?}")));
                    }
                    opts.outbound_addr6 = Some(value.to_string());
                }
                // Ports are forwarded by the container engine
                "port_handler" => match value {
                    "rootlesskit" | "slirp4netns" => {}
                    _ => {
                        return Err(Error::invalid_config(format!(
                            "unknown port_handler for slirp4netns: {value:?}"
                        )));
                    }
                },
                _ => {
                    return Err(Error::invalid_config(format!(
                        "unknown option for slirp4netns: {option:?}"
                    )));
                }
            }
        }

        Ok(opts)
    }

    /// Command line for these options, without the trailing fixed arguments
    pub fn args(&self, features: &SlirpFeatures) -> Result<Vec<String>> {
        let mut args = Vec::new();

        if self.disable_host_loopback && features.disable_host_loopback {
            args.push("--disable-host-loopback".to_string());
        }
        if features.mtu {
            args.push(format!("--mtu={}", self.mtu));
        }
        if features.enable_sandbox {
            args.push("--enable-sandbox".to_string());
        }
        if features.enable_seccomp {
            args.push("--enable-seccomp".to_string());
        }

        if let Some(cidr) = &self.cidr {
            if !features.cidr {
                return Err(Error::invalid_config("cidr not supported"));
            }
            args.push(format!("--cidr={cidr}"));
        }

        if self.enable_ipv6 {
            if !features.ipv6 {
                return Err(Error::invalid_config("enable_ipv6 not supported"));
            }
            args.push("--enable-ipv6".to_string());
        }

        if let Some(addr) = &self.outbound_addr {
            if !features.outbound_addr {
                return Err(Error::invalid_config("outbound_addr not supported"));
            }
            args.push(format!("--outbound-addr={addr}"));
        }

        if let Some(addr) = &self.outbound_addr6 {
            if !features.outbound_addr || !features.ipv6 {
                return Err(Error::invalid_config("outbound_addr6 not supported"));
            }
            if !self.enable_ipv6 {
                return Err(Error::invalid_config(
                    "enable_ipv6=true is required for outbound_addr6",
                ));
            }
            args.push(format!("--outbound-addr6={addr}"));
        }

        Ok(args)
    }

    /// Subnet served to the namespace
    #[must_use]
    pub fn subnet(&self) -> Ipv4Subnet {
        self.cidr.unwrap_or(DEFAULT_SUBNET)
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(Error::invalid_config(format!(
            "invalid value of {key} for slirp4netns: {value:?}"
        ))),
    }
}

fn interface_exists(name: &str) -> bool {
    !name.is_empty() && !name.contains('/') && Path::new("/sys/class/net").join(name).exists()
}

/// slirp4netns(1) helper
#[derive(Debug, Clone, Default)]
pub struct Slirp4netns {
    binary: Option<PathBuf>,
    binary_dirs: Vec<PathBuf>,
    options: Vec<String>,
}

impl Slirp4netns {
    /// Create a helper using the configured slirp4netns options
    #[must_use]
    pub fn new(binary_dirs: Vec<PathBuf>, options: Vec<String>) -> Self {
        Self {
            binary: None,
            binary_dirs,
            options,
        }
    }

    /// Use an explicit binary instead of searching for it
    #[must_use]
    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = Some(binary.into());
        self
    }

    fn binary(&self) -> Result<PathBuf> {
        match &self.binary {
            Some(binary) => Ok(binary.clone()),
            None => find_helper_binary(BINARY, &self.binary_dirs),
        }
    }
}

impl NetworkHelper for Slirp4netns {
    fn name(&self) -> &'static str {
        BINARY
    }

    fn setup(&self, opts: &HelperOptions) -> Result<HelperOutput> {
        let binary = self.binary()?;
        let options = SlirpOptions::parse(&self.options)?;
        let features = SlirpFeatures::detect(&binary)?;

        let mut args = options.args(&features)?;
        // -c brings up the tap device, -r names the ready fd
        args.extend(["-c", "-r", "3", "--netns-type=path"].map(String::from));
        args.push(opts.netns.display().to_string());
        args.push("tap0".to_string());

        debug!(command = %format!("{} {}", binary.display(), args.join(" ")), "slirp4netns command");

        let (ready_r, ready_w) = nix::unistd::pipe2(OFlag::O_CLOEXEC)
            .map_err(|e| helper_error(format!("failed to open pipe: {e}")))?;

        let mut log = tempfile::tempfile()
            .map_err(|e| helper_error(format!("failed to open slirp4netns log file: {e}")))?;

        let mut cmd = Command::new(&binary);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(log.try_clone()?)
            .stderr(log.try_clone()?)
            .process_group(0);

        let ready_raw = ready_w.as_raw_fd();
        let sandbox = features.enable_sandbox;
        // SAFETY: only async-signal-safe calls between fork and exec
        unsafe {
            cmd.pre_exec(move || {
                if ready_raw == READY_FD {
                    if libc::fcntl(READY_FD, libc::F_SETFD, 0) < 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                } else if libc::dup2(ready_raw, READY_FD) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                // The sandbox pivots root, keep that out of our mount namespace
                if sandbox {
                    unshare(CloneFlags::CLONE_NEWNS).map_err(std::io::Error::from)?;
                }
                Ok(())
            });
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| helper_error(format!("failed to start slirp4netns process: {e}")))?;
        drop(ready_w);

        let pid = child_pid(&child)?;
        if let Err(e) = wait_for_ready(ready_r, &mut child, &mut log) {
            let _ = child.kill();
            let _ = child.wait();
            return Err(e);
        }

        // Reap it whenever it exits
        std::thread::spawn(move || {
            let _ = child.wait();
        });

        debug!(pid = %pid, "slirp4netns ready");
        Ok(HelperOutput {
            addresses: Vec::new(),
            dns_forward: Vec::new(),
            map_guest: Vec::new(),
            ipv6: options.enable_ipv6,
            pid: Some(pid),
            subnet: Some(options.subnet()),
        })
    }
}

fn child_pid(child: &Child) -> Result<ProcessId> {
    i32::try_from(child.id())
        .map(ProcessId::from_raw)
        .map_err(|_| helper_error(format!("invalid pid {}", child.id())))
}

fn helper_error(message: String) -> Error {
    Error::Helper {
        helper: BINARY,
        message,
    }
}

/// Wait until slirp4netns writes to the ready pipe
///
/// The child is checked once per interval so an early exit is reported with
/// its log instead of blocking forever.
fn wait_for_ready(ready: OwnedFd, child: &mut Child, log: &mut File) -> Result<()> {
    let mut ready = File::from(ready);
    let mut buf = [0u8; 16];

    loop {
        let readable = {
            let mut fds = [PollFd::new(ready.as_fd(), PollFlags::POLLIN)];
            match poll(&mut fds, PollTimeout::from(READY_POLL_INTERVAL_MS)) {
                Ok(n) => n > 0,
                Err(Errno::EINTR) => false,
                Err(e) => {
                    return Err(helper_error(format!(
                        "failed to read from slirp4netns sync pipe: {e}"
                    )));
                }
            }
        };

        if readable {
            match ready.read(&mut buf) {
                Ok(n) if n > 0 => return Ok(()),
                // EOF, the child closed the pipe without signaling
                Ok(_) => {
                    let status = child.wait()?;
                    return Err(exit_error(status, log));
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(helper_error(format!(
                        "failed to read from slirp4netns sync pipe: {e}"
                    )));
                }
            }
        }

        if let Some(status) = child.try_wait().map_err(|e| {
            helper_error(format!("failed to read slirp4netns process status: {e}"))
        })? {
            return Err(exit_error(status, log));
        }
    }
}

fn exit_error(status: std::process::ExitStatus, log: &mut File) -> Error {
    use std::os::unix::process::ExitStatusExt;

    if status.code().is_none() && status.signal().is_some() {
        return helper_error("slirp4netns killed by signal".to_string());
    }

    let mut content = String::new();
    if log.seek(SeekFrom::Start(0)).is_ok() {
        let _ = log.read_to_string(&mut content);
    }
    helper_error(format!("slirp4netns failed: {content:?}"))
}

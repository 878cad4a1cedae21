//! resolv.conf generation for the namespace
//!
//! The host file is the base. Loopback resolvers are unreachable from a
//! separate network namespace, so they are filtered and a single local stub
//! resolver is replaced by the upstream file it forwards to.

use std::fmt::Write as _;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::net::{IpAddr, Ipv4Addr};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use tracing::{debug, info};
use warren_core::{Error, Result};

/// Default host resolver file
pub const DEFAULT_RESOLV_CONF: &str = "/etc/resolv.conf";

const DEFAULT_IPV4_DNS: [&str; 2] = ["8.8.8.8", "8.8.4.4"];
const DEFAULT_IPV6_DNS: [&str; 2] = ["2001:4860:4860::8888", "2001:4860:4860::8844"];

/// Parameters of a generated resolv.conf
#[derive(Debug, Clone, Default)]
pub struct ResolvConfParams {
    /// File to write
    pub path: PathBuf,
    /// The file is used from a separate network namespace
    pub netns: bool,
    /// Keep IPv6 nameservers
    pub ipv6_enabled: bool,
    /// Append the host nameservers after [`Self::nameservers`]
    pub keep_host_servers: bool,
    /// Nameservers placed first
    pub nameservers: Vec<IpAddr>,
}

/// Writes resolv.conf files
pub trait ResolvConfGenerator: Send + Sync {
    /// Generate the file described by `params`
    fn generate(&self, params: &ResolvConfParams) -> Result<()>;
}

/// Generator based on the host resolver configuration
#[derive(Debug, Clone)]
pub struct HostResolvConf {
    host_path: PathBuf,
    stub_resolvers: Vec<(IpAddr, PathBuf)>,
}

impl Default for HostResolvConf {
    fn default() -> Self {
        Self::new(DEFAULT_RESOLV_CONF)
    }
}

impl HostResolvConf {
    /// Create a generator reading `host_path`
    #[must_use]
    pub fn new(host_path: impl Into<PathBuf>) -> Self {
        Self {
            host_path: host_path.into(),
            stub_resolvers: vec![
                // systemd-resolved
                (
                    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 53)),
                    PathBuf::from("/run/systemd/resolve/resolv.conf"),
                ),
                // NetworkManager
                (
                    IpAddr::V4(Ipv4Addr::LOCALHOST),
                    PathBuf::from("/run/NetworkManager/no-stub-resolv.conf"),
                ),
            ],
        }
    }

    /// Replace the upstream file used when `stub` is the only nameserver
    #[must_use]
    pub fn with_stub_resolver(mut self, stub: IpAddr, upstream: impl Into<PathBuf>) -> Self {
        let upstream = upstream.into();
        match self.stub_resolvers.iter_mut().find(|(ip, _)| *ip == stub) {
            Some(entry) => entry.1 = upstream,
            None => self.stub_resolvers.push((stub, upstream)),
        }
        self
    }

    fn host_contents(&self, netns: bool) -> Result<String> {
        let contents = read_optional(&self.host_path)?;
        if !netns {
            return Ok(contents);
        }

        let parsed = ResolvConf::parse(&contents);
        let [only] = parsed.nameservers.as_slice() else {
            return Ok(contents);
        };
        let Some((_, upstream)) = self
            .stub_resolvers
            .iter()
            .find(|(ip, _)| Some(*ip) == nameserver_ip(only))
        else {
            return Ok(contents);
        };

        match std::fs::read_to_string(upstream) {
            Ok(real) => {
                debug!(path = %upstream.display(), "Found local resolver, using its upstream nameservers");
                Ok(real)
            }
            // Detection is heuristic, a missing file just keeps the host one
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(contents),
            Err(e) => Err(Error::namespace(format!(
                "local resolver detected, but could not read real resolv.conf at {}: {e}",
                upstream.display()
            ))),
        }
    }
}

impl ResolvConfGenerator for HostResolvConf {
    fn generate(&self, params: &ResolvConfParams) -> Result<()> {
        let contents = self.host_contents(params.netns).map_err(|e| {
            Error::namespace(format!(
                "failed to get the default {} content: {e}",
                self.host_path.display()
            ))
        })?;

        let mut host = ResolvConf::parse(&contents);
        if params.netns {
            host.filter_for_netns(params.ipv6_enabled);
        }

        let mut nameservers: Vec<String> =
            params.nameservers.iter().map(ToString::to_string).collect();
        if nameservers.is_empty() || params.keep_host_servers {
            nameservers.append(&mut host.nameservers);
        }

        let conf = ResolvConf {
            nameservers,
            search: host.search,
            options: host.options,
        };
        conf.write(&params.path)?;

        debug!(path = %params.path.display(), "Generated resolv.conf");
        Ok(())
    }
}

fn read_optional(path: &Path) -> Result<String> {
    match std::fs::read_to_string(path) {
        Ok(contents) => Ok(contents),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(e.into()),
    }
}

/// Address of a nameserver entry, without any IPv6 zone
fn nameserver_ip(entry: &str) -> Option<IpAddr> {
    entry.split('%').next()?.parse().ok()
}

/// Parsed resolv.conf, comments dropped
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvConf {
    /// `nameserver` entries in order, IPv6 zones kept
    pub nameservers: Vec<String>,
    /// Domains of the last `search` line
    pub search: Vec<String>,
    /// Options of the last `options` line
    pub options: Vec<String>,
}

impl ResolvConf {
    /// Parse resolv.conf contents
    #[must_use]
    pub fn parse(contents: &str) -> Self {
        let mut conf = Self::default();

        for line in contents.lines() {
            let line = line.split('#').next().unwrap_or_default();
            let mut fields = line.split_whitespace();
            match fields.next() {
                Some("nameserver") => {
                    if let (Some(ns), None) = (fields.next(), fields.next()) {
                        if nameserver_ip(ns).is_some() {
                            conf.nameservers.push(ns.to_string());
                        }
                    }
                }
                Some("search") => conf.search = fields.map(str::to_string).collect(),
                Some("options") => conf.options = fields.map(str::to_string).collect(),
                _ => {}
            }
        }

        conf
    }

    /// Drop nameservers unreachable from a separate network namespace
    ///
    /// Loopback entries always go, IPv6 ones unless `ipv6_enabled` and
    /// link-local ones with a zone in any case. Public resolvers are used
    /// when nothing is left.
    pub fn filter_for_netns(&mut self, ipv6_enabled: bool) {
        self.nameservers.retain(|ns| {
            let Some(ip) = nameserver_ip(ns) else {
                return false;
            };
            if ip.is_loopback() {
                return false;
            }
            match ip {
                IpAddr::V4(_) => true,
                IpAddr::V6(_) => ipv6_enabled && !ns.contains('%'),
            }
        });

        if self.nameservers.is_empty() {
            info!(
                "No non-localhost DNS nameservers are left in resolv.conf. Using default external servers: {DEFAULT_IPV4_DNS:?}"
            );
            self.nameservers
                .extend(DEFAULT_IPV4_DNS.iter().map(ToString::to_string));
            if ipv6_enabled {
                info!("IPv6 enabled; Adding default IPv6 external servers: {DEFAULT_IPV6_DNS:?}");
                self.nameservers
                    .extend(DEFAULT_IPV6_DNS.iter().map(ToString::to_string));
            }
        }
    }

    /// Render in resolv.conf syntax
    ///
    /// A search list consisting of `.` only is left out.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();

        let search = self.search.join(" ");
        if !search.is_empty() && search.trim() != "." {
            let _ = writeln!(out, "search {search}");
        }
        for ns in &self.nameservers {
            let _ = writeln!(out, "nameserver {ns}");
        }
        let options = self.options.join(" ");
        if !options.trim().is_empty() {
            let _ = writeln!(out, "options {options}");
        }

        out
    }

    /// Write the file with mode 0644
    pub fn write(&self, path: &Path) -> Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o644)
            .open(path)?;
        file.write_all(self.render().as_bytes())?;
        Ok(())
    }
}

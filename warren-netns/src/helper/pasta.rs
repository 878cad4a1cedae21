//! pasta(1) helper
//!
//! pasta configures the namespace itself (`--config-net`), forks into the
//! background once ready and exits when the namespace goes away.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::process::Command;

use nix::ifaddrs::getifaddrs;
use tracing::{debug, info};
use warren_core::{Error, Result};

use super::{HelperOptions, HelperOutput, NetworkHelper, find_helper_binary};
use crate::NetnsHandle;

const BINARY: &str = "pasta";

const DNS_FORWARD_OPT: &str = "--dns-forward";
const MAP_GUEST_ADDR_OPT: &str = "--map-guest-addr";

/// Nameserver address inside the namespace, link-local to avoid conflicts
pub const DNS_FORWARD_IPV4: Ipv4Addr = Ipv4Addr::new(169, 254, 1, 1);

/// Address inside the namespace that reaches the host
pub const MAP_GUEST_ADDR_IPV4: Ipv4Addr = Ipv4Addr::new(169, 254, 1, 2);

/// pasta(1) arguments together with the addresses they request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PastaArgs {
    /// Command line, without the binary
    pub args: Vec<String>,
    /// `--dns-forward` values
    pub dns_forward: Vec<String>,
    /// `--map-guest-addr` values
    pub map_guest: Vec<String>,
}

impl PastaArgs {
    /// Build the command line from user `options` and `extra` options
    ///
    /// Port forwarding is disabled unless requested and `--quiet` is added
    /// unless debugging was asked for. `--map-gw` is not a pasta option, it
    /// only suppresses `--no-map-gw`. The default `--map-guest-addr` comes
    /// last so it can be dropped for older pasta versions.
    #[must_use]
    pub fn new(options: &[String], extra: &[String]) -> Self {
        let mut args = vec!["--config-net".to_string()];
        args.extend(options.iter().cloned());
        args.extend(extra.iter().cloned());

        let mut no_map_gw = true;
        args.retain(|arg| {
            if arg == "--map-gw" {
                no_map_gw = false;
                return false;
            }
            true
        });

        let mut no_tcp_init_ports = true;
        let mut no_udp_init_ports = true;
        let mut no_tcp_ns_ports = true;
        let mut no_udp_ns_ports = true;
        let mut quiet = true;
        let mut dns_forward = Vec::new();
        let mut map_guest = Vec::new();

        for (idx, arg) in args.iter().enumerate() {
            match arg.as_str() {
                "-t" | "--tcp-ports" => no_tcp_init_ports = false,
                "-u" | "--udp-ports" => no_udp_init_ports = false,
                "-T" | "--tcp-ns" => no_tcp_ns_ports = false,
                "-U" | "--udp-ns" => no_udp_ns_ports = false,
                "-d" | "--debug" | "--trace" => quiet = false,
                DNS_FORWARD_OPT => dns_forward.extend(args.get(idx + 1).cloned()),
                MAP_GUEST_ADDR_OPT => map_guest.extend(args.get(idx + 1).cloned()),
                _ => {}
            }
        }

        if dns_forward.is_empty() {
            let ip = DNS_FORWARD_IPV4.to_string();
            args.extend([DNS_FORWARD_OPT.to_string(), ip.clone()]);
            dns_forward.push(ip);
        }

        for (disabled, flag) in [
            (no_tcp_init_ports, "-t"),
            (no_udp_init_ports, "-u"),
            (no_tcp_ns_ports, "-T"),
            (no_udp_ns_ports, "-U"),
        ] {
            if disabled {
                args.extend([flag.to_string(), "none".to_string()]);
            }
        }

        if no_map_gw {
            args.push("--no-map-gw".to_string());
        }
        if quiet {
            args.push("--quiet".to_string());
        }

        if map_guest.is_empty() {
            let ip = MAP_GUEST_ADDR_IPV4.to_string();
            args.extend([MAP_GUEST_ADDR_OPT.to_string(), ip.clone()]);
            map_guest.push(ip);
        }

        Self {
            args,
            dns_forward,
            map_guest,
        }
    }

    /// Insert `--netns <path>` before the trailing default map-guest option
    pub fn set_netns(&mut self, netns: &std::path::Path) {
        let at = if self.uses_default_map_guest() {
            self.args.len() - 2
        } else {
            self.args.len()
        };
        self.args.splice(
            at..at,
            ["--netns".to_string(), netns.display().to_string()],
        );
    }

    fn uses_default_map_guest(&self) -> bool {
        self.map_guest.len() == 1
            && self.map_guest[0] == MAP_GUEST_ADDR_IPV4.to_string()
            && self.args.len() >= 2
            && self.args[self.args.len() - 2] == MAP_GUEST_ADDR_OPT
    }

    /// Drop the default `--map-guest-addr`, for pasta versions without it
    ///
    /// Returns false if the option was set by the user.
    pub fn drop_default_map_guest(&mut self) -> bool {
        if !self.uses_default_map_guest() {
            return false;
        }
        self.args.truncate(self.args.len() - 2);
        self.map_guest.clear();
        true
    }
}

/// pasta(1) helper
#[derive(Debug, Clone, Default)]
pub struct Pasta {
    binary_dirs: Vec<PathBuf>,
    options: Vec<String>,
}

impl Pasta {
    /// Create a helper using the configured pasta options
    #[must_use]
    pub fn new(binary_dirs: Vec<PathBuf>, options: Vec<String>) -> Self {
        Self {
            binary_dirs,
            options,
        }
    }
}

impl NetworkHelper for Pasta {
    fn name(&self) -> &'static str {
        BINARY
    }

    fn setup(&self, opts: &HelperOptions) -> Result<HelperOutput> {
        let binary = find_helper_binary(BINARY, &self.binary_dirs)?;

        let extra = ["--pid".to_string(), opts.pid_file.display().to_string()];
        let mut args = PastaArgs::new(&self.options, &extra);
        args.set_netns(&opts.netns);

        loop {
            debug!(args = %args.args.join(" "), "pasta arguments");

            // pasta forks once ready
            let out = Command::new(&binary)
                .args(&args.args)
                .output()
                .map_err(|e| helper_error(format!("failed to start pasta: {e}")))?;
            let mut log = String::from_utf8_lossy(&out.stdout).into_owned();
            log.push_str(&String::from_utf8_lossy(&out.stderr));

            if !out.status.success() {
                let code = out.status.code().unwrap_or(-1);
                if code == 1
                    && log.contains(&format!("unrecognized option '{MAP_GUEST_ADDR_OPT}"))
                    && args.drop_default_map_guest()
                {
                    debug!("pasta does not support {MAP_GUEST_ADDR_OPT}, retrying without it");
                    continue;
                }
                return Err(helper_error(format!(
                    "pasta failed with exit code {code}:\n{log}"
                )));
            }

            if !log.trim().is_empty() {
                info!("pasta logged warnings: {:?}", log.trim());
            }
            break;
        }

        let addresses = NetnsHandle::open(&opts.netns)?.run(namespace_addresses)?;
        let ipv4 = addresses.iter().any(IpAddr::is_ipv4);
        let ipv6 = addresses.iter().any(IpAddr::is_ipv6);

        Ok(HelperOutput {
            dns_forward: filter_ip_family(&args.dns_forward, ipv4, ipv6),
            map_guest: filter_ip_family(&args.map_guest, ipv4, ipv6),
            addresses,
            ipv6,
            pid: None,
            subnet: None,
        })
    }
}

fn helper_error(message: String) -> Error {
    Error::Helper {
        helper: BINARY,
        message,
    }
}

/// Usable addresses of the current network namespace
///
/// Loopback and multicast addresses are skipped, and so are IPv6 link-local
/// ones: they need a zone to be of any use and the kernel assigns them even
/// when IPv6 connectivity is off.
fn namespace_addresses() -> Result<Vec<IpAddr>> {
    let mut addresses = Vec::new();

    for ifaddr in getifaddrs()? {
        let Some(address) = ifaddr.address else {
            continue;
        };
        let ip = if let Some(v4) = address.as_sockaddr_in() {
            IpAddr::V4(v4.ip())
        } else if let Some(v6) = address.as_sockaddr_in6() {
            IpAddr::V6(v6.ip())
        } else {
            continue;
        };

        if usable_address(ip) && !addresses.contains(&ip) {
            addresses.push(ip);
        }
    }

    Ok(addresses)
}

fn usable_address(ip: IpAddr) -> bool {
    if ip.is_loopback() || ip.is_multicast() {
        return false;
    }
    match ip {
        IpAddr::V4(_) => true,
        IpAddr::V6(v6) => !v6.is_unicast_link_local(),
    }
}

/// Keep the addresses whose family is configured in the namespace
fn filter_ip_family(ips: &[String], ipv4: bool, ipv6: bool) -> Vec<IpAddr> {
    ips.iter()
        .filter_map(|ip| ip.parse::<IpAddr>().ok())
        .filter(|ip| (ipv4 && ip.is_ipv4()) || (ipv6 && ip.is_ipv6()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_default_args() {
        let mut args = PastaArgs::new(&[], &strings(&["--pid", "/tmp/ns/pid"]));
        args.set_netns(Path::new("/tmp/ns/rootless-netns"));

        assert_eq!(
            args.args,
            strings(&[
                "--config-net",
                "--pid",
                "/tmp/ns/pid",
                "--dns-forward",
                "169.254.1.1",
                "-t",
                "none",
                "-u",
                "none",
                "-T",
                "none",
                "-U",
                "none",
                "--no-map-gw",
                "--quiet",
                "--netns",
                "/tmp/ns/rootless-netns",
                "--map-guest-addr",
                "169.254.1.2",
            ])
        );
        assert_eq!(args.dns_forward, strings(&["169.254.1.1"]));
        assert_eq!(args.map_guest, strings(&["169.254.1.2"]));
    }

    #[test]
    fn test_user_options_win() {
        let options = strings(&[
            "--map-gw",
            "-t",
            "8080",
            "--debug",
            "--dns-forward",
            "10.0.0.1",
            "--map-guest-addr",
            "10.0.0.2",
        ]);
        let mut args = PastaArgs::new(&options, &[]);
        args.set_netns(Path::new("/ns"));

        assert!(!args.args.contains(&"--map-gw".to_string()));
        assert!(!args.args.contains(&"--no-map-gw".to_string()));
        assert!(!args.args.contains(&"--quiet".to_string()));
        assert_eq!(args.dns_forward, strings(&["10.0.0.1"]));
        assert_eq!(args.map_guest, strings(&["10.0.0.2"]));
        assert_eq!(&args.args[args.args.len() - 2..], strings(&["--netns", "/ns"]));

        // User supplied, must stay
        assert!(!args.drop_default_map_guest());

        let tcp_none = args
            .args
            .windows(2)
            .any(|w| w[0] == "-t" && w[1] == "none");
        assert!(!tcp_none);
        assert!(args.args.windows(2).any(|w| w[0] == "-u" && w[1] == "none"));
    }

    #[test]
    fn test_drop_default_map_guest() {
        let mut args = PastaArgs::new(&[], &[]);
        args.set_netns(Path::new("/ns"));

        assert!(args.drop_default_map_guest());
        assert!(args.map_guest.is_empty());
        assert_eq!(&args.args[args.args.len() - 2..], strings(&["--netns", "/ns"]));
        assert!(!args.drop_default_map_guest());
    }

    #[test]
    fn test_filter_ip_family() {
        let ips = strings(&["169.254.1.1", "fd00::1", "bogus"]);
        assert_eq!(
            filter_ip_family(&ips, true, false),
            vec!["169.254.1.1".parse::<IpAddr>().unwrap()]
        );
        assert_eq!(filter_ip_family(&ips, true, true).len(), 2);
        assert!(filter_ip_family(&ips, false, false).is_empty());
    }

    #[test]
    fn test_usable_address() {
        assert!(usable_address("10.0.2.100".parse().unwrap()));
        assert!(usable_address("fd00::100".parse().unwrap()));
        assert!(!usable_address("127.0.0.1".parse().unwrap()));
        assert!(!usable_address("::1".parse().unwrap()));
        assert!(!usable_address("fe80::1".parse().unwrap()));
        assert!(!usable_address("224.0.0.1".parse().unwrap()));
    }

    #[test]
    fn test_namespace_addresses_of_host() {
        // Never reports loopback, even on hosts without other interfaces
        let addresses = namespace_addresses().unwrap();
        assert!(addresses.iter().all(|ip| !ip.is_loopback()));
    }
}

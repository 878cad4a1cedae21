//! User-space networking helpers
//!
//! A helper connects the namespace to the host network without privileges.
//! [`pasta::Pasta`] and [`slirp::Slirp4netns`] implement [`NetworkHelper`].

pub mod pasta;
pub mod slirp;

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::str::FromStr;

use warren_core::{Error, ProcessId, Result};

pub use pasta::Pasta;
pub use slirp::Slirp4netns;

/// Options passed to a helper
#[derive(Debug, Clone)]
pub struct HelperOptions {
    /// Mount point of the namespace to connect
    pub netns: PathBuf,
    /// Where the helper's PID belongs
    pub pid_file: PathBuf,
}

/// Result of a started helper
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HelperOutput {
    /// Addresses configured in the namespace
    pub addresses: Vec<IpAddr>,
    /// Nameservers forwarded by the helper
    pub dns_forward: Vec<IpAddr>,
    /// Addresses mapped to the host
    pub map_guest: Vec<IpAddr>,
    /// IPv6 connectivity is available
    pub ipv6: bool,
    /// PID of the helper, if it does not write the PID file itself
    pub pid: Option<ProcessId>,
    /// Subnet served by the helper
    pub subnet: Option<Ipv4Subnet>,
}

/// User-space networking helper
pub trait NetworkHelper: Send + Sync {
    /// Binary name, used in error messages
    fn name(&self) -> &'static str;

    /// Start the helper for the namespace in `opts`
    ///
    /// Returns once the helper is ready to forward traffic.
    fn setup(&self, opts: &HelperOptions) -> Result<HelperOutput>;
}

/// Find a helper binary in `dirs`, then in `$PATH`
pub fn find_helper_binary(name: &'static str, dirs: &[PathBuf]) -> Result<PathBuf> {
    let not_found = |cause: String| Error::Helper {
        helper: name,
        message: format!(
            "could not find {name}, the network namespace can't be configured: {cause}"
        ),
    };

    let path = std::env::var_os("PATH").unwrap_or_default();
    let search = std::env::join_paths(dirs.iter().cloned().chain(std::env::split_paths(&path)))
        .map_err(|e| not_found(e.to_string()))?;
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));

    which::which_in(name, Some(search), cwd)
        .map_err(|e| not_found(format!("{e} in {dirs:?} or $PATH")))
}

/// IPv4 network in CIDR notation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv4Subnet {
    network: Ipv4Addr,
    prefix: u8,
}

impl Ipv4Subnet {
    /// Create a subnet, host bits of `addr` are cleared
    pub fn new(addr: Ipv4Addr, prefix: u8) -> Result<Self> {
        Self::from_parts(addr, prefix)
            .ok_or_else(|| Error::invalid_config(format!("invalid prefix length {prefix}")))
    }

    /// Like [`Ipv4Subnet::new`], `None` for a prefix over 32
    #[must_use]
    pub const fn from_parts(addr: Ipv4Addr, prefix: u8) -> Option<Self> {
        if prefix > 32 {
            return None;
        }
        Some(Self {
            network: Ipv4Addr::from_bits(addr.to_bits() & Self::mask(prefix)),
            prefix,
        })
    }

    const fn mask(prefix: u8) -> u32 {
        if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) }
    }

    /// Network address
    #[must_use]
    pub const fn network(&self) -> Ipv4Addr {
        self.network
    }

    /// Prefix length
    #[must_use]
    pub const fn prefix(&self) -> u8 {
        self.prefix
    }

    /// Check if `ip` is inside the subnet
    #[must_use]
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) & Self::mask(self.prefix) == u32::from(self.network)
    }

    /// Address `offset` hosts after the network address
    pub fn offset(&self, offset: u32) -> Result<Ipv4Addr> {
        let ip = u32::from(self.network).checked_add(offset).ok_or_else(|| {
            Error::namespace(format!(
                "integer overflow while calculating ip address offset, {} + {offset}",
                self.network
            ))
        })?;
        let ip = Ipv4Addr::from(ip);

        if !self.contains(ip) {
            return Err(Error::namespace(format!(
                "calculated ip address {ip} is not within given subnet {self}"
            )));
        }
        Ok(ip)
    }
}

impl fmt::Display for Ipv4Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

impl FromStr for Ipv4Subnet {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::invalid_config(format!("invalid cidr {s:?}"));
        let (addr, prefix) = s.split_once('/').ok_or_else(invalid)?;
        let addr: Ipv4Addr = addr.parse().map_err(|_| invalid())?;
        let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
        Self::new(addr, prefix).map_err(|_| invalid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subnet_parse() {
        let subnet: Ipv4Subnet = "10.0.2.17/24".parse().unwrap();
        assert_eq!(subnet.network(), Ipv4Addr::new(10, 0, 2, 0));
        assert_eq!(subnet.prefix(), 24);
        assert_eq!(subnet.to_string(), "10.0.2.0/24");

        assert!("10.0.2.0".parse::<Ipv4Subnet>().is_err());
        assert!("10.0.2.0/33".parse::<Ipv4Subnet>().is_err());
        assert!("fd00::/64".parse::<Ipv4Subnet>().is_err());
    }

    #[test]
    fn test_subnet_offset() {
        let subnet: Ipv4Subnet = "10.0.2.0/24".parse().unwrap();
        assert_eq!(subnet.offset(3).unwrap(), Ipv4Addr::new(10, 0, 2, 3));
        assert_eq!(subnet.offset(100).unwrap(), Ipv4Addr::new(10, 0, 2, 100));
        assert!(subnet.offset(256).is_err());

        let small: Ipv4Subnet = "192.168.5.0/30".parse().unwrap();
        assert!(small.offset(100).unwrap_err().to_string().contains("not within"));
    }

    #[test]
    fn test_subnet_overflow() {
        let subnet = Ipv4Subnet::new(Ipv4Addr::new(255, 255, 255, 255), 32).unwrap();
        assert!(subnet.offset(1).unwrap_err().to_string().contains("overflow"));
    }

    #[test]
    fn test_find_helper_binary() {
        use std::os::unix::fs::PermissionsExt;

        const NAME: &str = "warren-test-helper";
        let dir = tempfile::tempdir().unwrap();
        let dirs = [dir.path().to_path_buf()];
        let bin = dir.path().join(NAME);
        std::fs::write(&bin, "#!/bin/sh\n").unwrap();

        let err = find_helper_binary(NAME, &dirs).unwrap_err();
        assert!(err.to_string().contains("could not find warren-test-helper"));

        std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).unwrap();
        assert_eq!(find_helper_binary(NAME, &dirs).unwrap(), bin);
    }
}

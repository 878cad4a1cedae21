//! Core type definitions with strong typing and validation

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::path::Path;
use std::str::FromStr;

use crate::{Error, Result, WrapErr};

/// Process identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
#[serde(transparent)]
pub struct ProcessId(i32);

impl ProcessId {
    /// Create from raw PID
    #[must_use]
    pub const fn from_raw(pid: i32) -> Self {
        Self(pid)
    }

    /// Get the current process ID
    #[must_use]
    pub fn current() -> Self {
        #[allow(clippy::cast_possible_wrap)]
        Self(std::process::id() as i32)
    }

    /// Convert to `nix::unistd::Pid`
    #[must_use]
    pub const fn as_nix_pid(self) -> nix::unistd::Pid {
        nix::unistd::Pid::from_raw(self.0)
    }

    /// Get raw PID value
    #[must_use]
    pub const fn as_raw(self) -> i32 {
        self.0
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ProcessId {
    type Err = Error;

    /// Parse a PID as written to a pid file, surrounding whitespace allowed
    fn from_str(s: &str) -> Result<Self> {
        let pid: i32 = s.trim().parse().map_err(|e| Error::Namespace {
            message: format!("invalid pid {:?}: {e}", s.trim()),
        })?;

        if pid <= 0 {
            return Err(Error::Namespace {
                message: format!("invalid pid {pid}"),
            });
        }

        Ok(Self(pid))
    }
}

impl From<nix::unistd::Pid> for ProcessId {
    fn from(pid: nix::unistd::Pid) -> Self {
        Self(pid.as_raw())
    }
}

impl From<ProcessId> for nix::unistd::Pid {
    fn from(pid: ProcessId) -> Self {
        nix::unistd::Pid::from_raw(pid.0)
    }
}

/// Addressing of the shared rootless network namespace
///
/// Written by whichever process started the networking helper and read by
/// every process that later joins the namespace, so the JSON field names
/// are part of the on-disk format.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInfo {
    /// Addresses assigned inside the namespace
    #[serde(rename = "IPAddresses", default)]
    pub ip_addresses: Vec<IpAddr>,

    /// Nameservers forwarded by the helper, used in resolv.conf
    #[serde(rename = "DnsForwardIps", default)]
    pub dns_forward_ips: Vec<IpAddr>,

    /// Whether the helper maps a guest address to the host
    #[serde(rename = "MapGuestIps", default)]
    pub map_guest_ips: bool,
}

impl NetworkInfo {
    /// Cache file name inside the namespace working directory
    pub const FILE_NAME: &'static str = "info.json";

    /// Check if the helper reported any namespace address
    #[must_use]
    pub fn has_addresses(&self) -> bool {
        !self.ip_addresses.is_empty()
    }

    /// Read the cached record from `dir`
    ///
    /// A missing cache yields an empty record; a record that exists but
    /// cannot be decoded is an error.
    pub fn read(dir: impl AsRef<Path>) -> Result<Self> {
        let path = dir.as_ref().join(Self::FILE_NAME);
        match std::fs::read(&path) {
            Ok(data) => serde_json::from_slice(&data).wrap_err("deserialize info"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(Error::wrap("read info", e)),
        }
    }

    /// Persist the record into `dir`
    pub fn write(&self, dir: impl AsRef<Path>) -> Result<()> {
        let data = serde_json::to_vec(self).wrap_err("serialize info")?;
        std::fs::write(dir.as_ref().join(Self::FILE_NAME), data).wrap_err("write info")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_process_id() {
        let pid = ProcessId::from_raw(123);
        assert_eq!(pid.as_raw(), 123);

        let nix_pid = pid.as_nix_pid();
        assert_eq!(nix_pid.as_raw(), 123);
    }

    #[test]
    fn test_process_id_parse() {
        assert_eq!("4242\n".parse::<ProcessId>().unwrap().as_raw(), 4242);
        assert!("".parse::<ProcessId>().is_err());
        assert!("0".parse::<ProcessId>().is_err());
        assert!("-5".parse::<ProcessId>().is_err());
        assert!("abc".parse::<ProcessId>().is_err());
    }

    #[test]
    fn test_network_info_field_names() {
        let info = NetworkInfo {
            ip_addresses: vec![IpAddr::V4(Ipv4Addr::new(10, 0, 2, 100))],
            dns_forward_ips: vec![IpAddr::V4(Ipv4Addr::new(10, 0, 2, 3))],
            map_guest_ips: false,
        };

        let json = serde_json::to_string(&info).unwrap();
        assert_eq!(
            json,
            r#"{"IPAddresses":["10.0.2.100"],"DnsForwardIps":["10.0.2.3"],"MapGuestIps":false}"#
        );
    }

    #[test]
    fn test_network_info_cache_file() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(NetworkInfo::read(dir.path()).unwrap(), NetworkInfo::default());

        let info = NetworkInfo {
            ip_addresses: vec!["10.0.2.100".parse().unwrap()],
            dns_forward_ips: vec!["169.254.1.1".parse().unwrap()],
            map_guest_ips: true,
        };
        info.write(dir.path()).unwrap();
        assert_eq!(NetworkInfo::read(dir.path()).unwrap(), info);

        std::fs::write(dir.path().join(NetworkInfo::FILE_NAME), b"{not json").unwrap();
        let err = NetworkInfo::read(dir.path()).unwrap_err();
        assert!(err.to_string().starts_with("rootless netns: deserialize info:"));
    }

    #[test]
    fn test_network_info_missing_fields() {
        let info: NetworkInfo = serde_json::from_str(r#"{"IPAddresses":["fd00::2"]}"#).unwrap();
        assert!(info.has_addresses());
        assert!(info.dns_forward_ips.is_empty());
        assert!(!info.map_guest_ips);
    }
}

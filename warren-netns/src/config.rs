//! Rootless network configuration

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use warren_core::{Error, Result};

/// User-space networking helper used to connect the namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum HelperKind {
    /// pasta(1)
    Pasta,
    /// slirp4netns(1)
    #[default]
    Slirp4netns,
}

impl HelperKind {
    /// Binary name of the helper
    #[must_use]
    pub const fn binary_name(self) -> &'static str {
        match self {
            Self::Pasta => "pasta",
            Self::Slirp4netns => "slirp4netns",
        }
    }
}

impl fmt::Display for HelperKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.binary_name())
    }
}

impl FromStr for HelperKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "" | "slirp4netns" => Ok(Self::Slirp4netns),
            "pasta" => Ok(Self::Pasta),
            _ => Err(Error::invalid_config(format!(
                "invalid rootless network command {s:?}"
            ))),
        }
    }
}

impl TryFrom<String> for HelperKind {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<HelperKind> for String {
    fn from(kind: HelperKind) -> Self {
        kind.binary_name().to_string()
    }
}

/// Plugin runner that configures container interfaces inside the namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PluginBackend {
    /// Container Network Interface plugins, need a writable CNI state dir
    Cni,
    /// netavark
    #[default]
    Netavark,
}

impl FromStr for PluginBackend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "cni" => Ok(Self::Cni),
            "" | "netavark" => Ok(Self::Netavark),
            _ => Err(Error::invalid_config(format!("invalid network backend {s:?}"))),
        }
    }
}

impl TryFrom<String> for PluginBackend {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl fmt::Display for PluginBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cni => f.write_str("cni"),
            Self::Netavark => f.write_str("netavark"),
        }
    }
}

impl From<PluginBackend> for String {
    fn from(backend: PluginBackend) -> Self {
        backend.to_string()
    }
}

/// Rootless network configuration
///
/// Owned by the caller and read-only to the namespace manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Helper that provides connectivity
    pub helper: HelperKind,

    /// Plugin runner used by the container engine
    pub plugins: PluginBackend,

    /// Directories searched for helper binaries before `$PATH`
    pub helper_binaries_dirs: Vec<PathBuf>,

    /// Explicit slirp4netns binary
    pub network_cmd_path: Option<PathBuf>,

    /// Extra pasta(1) arguments
    pub pasta_options: Vec<String>,

    /// slirp4netns `key=value` options
    pub slirp_options: Vec<String>,

    /// User runtime directory, `$XDG_RUNTIME_DIR` when unset
    pub runtime_dir: Option<PathBuf>,

    /// Host resolver configuration
    pub resolv_conf: PathBuf,

    /// Persistent CNI state directory
    pub cni_state_dir: PathBuf,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            helper: HelperKind::default(),
            plugins: PluginBackend::default(),
            helper_binaries_dirs: vec![
                PathBuf::from("/usr/local/libexec/podman"),
                PathBuf::from("/usr/libexec/podman"),
                PathBuf::from("/usr/lib/podman"),
            ],
            network_cmd_path: None,
            pasta_options: Vec::new(),
            slirp_options: Vec::new(),
            runtime_dir: None,
            resolv_conf: PathBuf::from("/etc/resolv.conf"),
            cni_state_dir: PathBuf::from(crate::DEFAULT_CNI_DIR),
        }
    }
}

impl NetworkConfig {
    /// Create a new configuration with defaults
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a configuration from a JSON file
    ///
    /// Missing fields keep their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::invalid_config(format!("read {}: {e}", path.display()))
        })?;
        let config = serde_json::from_str(&content)?;
        tracing::debug!(path = %path.display(), "Loaded network configuration");
        Ok(config)
    }

    /// Select the networking helper
    #[must_use]
    pub fn with_helper(mut self, helper: HelperKind) -> Self {
        self.helper = helper;
        self
    }

    /// Select the plugin backend
    #[must_use]
    pub fn with_plugins(mut self, plugins: PluginBackend) -> Self {
        self.plugins = plugins;
        self
    }

    /// Set the user runtime directory
    #[must_use]
    pub fn with_runtime_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.runtime_dir = Some(dir.into());
        self
    }

    /// Add a pasta(1) argument
    #[must_use]
    pub fn with_pasta_option(mut self, option: impl Into<String>) -> Self {
        self.pasta_options.push(option.into());
        self
    }

    /// Add a slirp4netns `key=value` option
    #[must_use]
    pub fn with_slirp_option(mut self, option: impl Into<String>) -> Self {
        self.slirp_options.push(option.into());
        self
    }

    /// Override the host resolv.conf path
    #[must_use]
    pub fn with_resolv_conf(mut self, path: impl Into<PathBuf>) -> Self {
        self.resolv_conf = path.into();
        self
    }

    /// Resolve the user runtime directory
    ///
    /// Falls back to `$XDG_RUNTIME_DIR` and then `/run/user/<uid>`.
    #[must_use]
    pub fn runtime_dir(&self) -> PathBuf {
        if let Some(dir) = &self.runtime_dir {
            return dir.clone();
        }
        match std::env::var_os("XDG_RUNTIME_DIR") {
            Some(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => PathBuf::from(format!("/run/user/{}", nix::unistd::getuid())),
        }
    }

    /// Default working directory of the shared namespace
    #[must_use]
    pub fn default_workdir(&self) -> PathBuf {
        self.runtime_dir().join("warren").join(crate::NETNS_NAME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_helper_kind_parse() {
        assert_eq!("".parse::<HelperKind>().unwrap(), HelperKind::Slirp4netns);
        assert_eq!("Pasta".parse::<HelperKind>().unwrap(), HelperKind::Pasta);
        assert_eq!(
            "slirp4netns".parse::<HelperKind>().unwrap(),
            HelperKind::Slirp4netns
        );

        let err = "vpnkit".parse::<HelperKind>().unwrap_err();
        assert!(err.to_string().contains("invalid rootless network command"));
    }

    #[test]
    fn test_plugin_backend_parse() {
        assert_eq!("CNI".parse::<PluginBackend>().unwrap(), PluginBackend::Cni);
        assert_eq!(
            "netavark".parse::<PluginBackend>().unwrap(),
            PluginBackend::Netavark
        );
        assert!("flannel".parse::<PluginBackend>().is_err());
    }

    #[test]
    fn test_builder_pattern() {
        let config = NetworkConfig::new()
            .with_helper(HelperKind::Pasta)
            .with_plugins(PluginBackend::Cni)
            .with_runtime_dir("/run/user/1000")
            .with_pasta_option("--mtu")
            .with_pasta_option("1500")
            .with_slirp_option("mtu=1500");

        assert_eq!(config.helper, HelperKind::Pasta);
        assert_eq!(config.plugins, PluginBackend::Cni);
        assert_eq!(config.pasta_options, vec!["--mtu", "1500"]);
        assert_eq!(config.slirp_options, vec!["mtu=1500"]);
        assert_eq!(
            config.default_workdir(),
            PathBuf::from("/run/user/1000/warren/rootless-netns")
        );
    }

    #[test]
    fn test_load_partial_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("network.json");
        std::fs::write(&path, r#"{"helper": "pasta", "slirp_options": ["mtu=1500"]}"#).unwrap();

        let config = NetworkConfig::load(&path).unwrap();
        assert_eq!(config.helper, HelperKind::Pasta);
        assert_eq!(config.slirp_options, vec!["mtu=1500"]);
        assert_eq!(config.cni_state_dir, PathBuf::from(crate::DEFAULT_CNI_DIR));
    }

    #[test]
    fn test_load_accepts_parse_spellings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("network.json");

        std::fs::write(&path, r#"{"helper": "", "plugins": "CNI"}"#).unwrap();
        let config = NetworkConfig::load(&path).unwrap();
        assert_eq!(config.helper, HelperKind::Slirp4netns);
        assert_eq!(config.plugins, PluginBackend::Cni);

        std::fs::write(&path, r#"{"helper": "Pasta", "plugins": ""}"#).unwrap();
        let config = NetworkConfig::load(&path).unwrap();
        assert_eq!(config.helper, HelperKind::Pasta);
        assert_eq!(config.plugins, PluginBackend::Netavark);

        std::fs::write(&path, r#"{"helper": "vpnkit"}"#).unwrap();
        let err = NetworkConfig::load(&path).unwrap_err();
        assert!(err.to_string().contains("invalid rootless network command"));
    }

    #[test]
    fn test_serialize_lowercase() {
        let config = NetworkConfig::new()
            .with_helper(HelperKind::Pasta)
            .with_plugins(PluginBackend::Cni);
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains(r#""helper":"pasta""#));
        assert!(json.contains(r#""plugins":"cni""#));
    }

    #[test]
    fn test_load_missing_file() {
        let err = NetworkConfig::load("/nonexistent/warren.json").unwrap_err();
        assert!(matches!(err, Error::InvalidConfig { .. }));
    }
}

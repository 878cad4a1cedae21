//! Process supervisor scope
//!
//! A helper started from a container engine's unit would be killed when
//! that unit stops. On systemd hosts it is moved into its own transient
//! scope in `user.slice` instead.

use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::debug;
use warren_core::{Error, ProcessId, Result};

/// Init system hosting the helper processes
pub trait Supervisor: Send + Sync {
    /// Check if the host runs systemd
    fn runs_on_systemd(&self) -> bool;

    /// Move `pid` into a scope of its own in the user slice
    fn move_to_user_scope(&self, pid: ProcessId) -> Result<()>;
}

/// systemd user manager
#[derive(Debug, Clone)]
pub struct Systemd {
    marker: PathBuf,
    busctl: PathBuf,
}

impl Default for Systemd {
    fn default() -> Self {
        Self {
            marker: PathBuf::from("/run/systemd/system"),
            busctl: PathBuf::from("busctl"),
        }
    }
}

impl Systemd {
    /// Create a supervisor using the host systemd
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Directory whose presence means systemd is running
    #[must_use]
    pub fn with_marker(mut self, marker: impl Into<PathBuf>) -> Self {
        self.marker = marker.into();
        self
    }

    /// busctl binary to call
    #[must_use]
    pub fn with_busctl(mut self, busctl: impl Into<PathBuf>) -> Self {
        self.busctl = busctl.into();
        self
    }

    /// Transient unit name for `pid`
    #[must_use]
    pub fn scope_name(pid: ProcessId) -> String {
        format!("warren-rootless-netns-{pid}.scope")
    }

    /// Arguments of the `StartTransientUnit` call
    #[must_use]
    pub fn start_unit_args(pid: ProcessId) -> Vec<String> {
        [
            "--user",
            "call",
            "org.freedesktop.systemd1",
            "/org/freedesktop/systemd1",
            "org.freedesktop.systemd1.Manager",
            "StartTransientUnit",
            "ssa(sv)a(sa(sv))",
        ]
        .into_iter()
        .map(String::from)
        .chain([Self::scope_name(pid), "fail".to_string()])
        .chain(["2", "PIDs", "au", "1"].into_iter().map(String::from))
        .chain([pid.to_string()])
        .chain(["Slice", "s", "user.slice", "0"].into_iter().map(String::from))
        .collect()
    }
}

impl Supervisor for Systemd {
    fn runs_on_systemd(&self) -> bool {
        Path::new(&self.marker).is_dir()
    }

    fn move_to_user_scope(&self, pid: ProcessId) -> Result<()> {
        let output = Command::new(&self.busctl)
            .args(Self::start_unit_args(pid))
            .output()
            .map_err(|e| Error::wrap("start transient scope", e))?;

        if !output.status.success() {
            return Err(Error::namespace(format!(
                "start transient scope {}: {}",
                Self::scope_name(pid),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        debug!(pid = %pid, scope = %Self::scope_name(pid), "Moved process to user scope");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_unit_args() {
        let args = Systemd::start_unit_args(ProcessId::from_raw(4242));
        assert_eq!(args[0], "--user");
        assert_eq!(args[5], "StartTransientUnit");
        assert_eq!(args[7], "warren-rootless-netns-4242.scope");
        assert_eq!(args[8], "fail");
        assert_eq!(&args[9..14], &["2", "PIDs", "au", "1", "4242"]);
        assert_eq!(&args[14..], &["Slice", "s", "user.slice", "0"]);
    }

    #[test]
    fn test_runs_on_systemd_marker() {
        let dir = tempfile::tempdir().unwrap();
        let systemd = Systemd::new().with_marker(dir.path());
        assert!(systemd.runs_on_systemd());

        let systemd = Systemd::new().with_marker(dir.path().join("missing"));
        assert!(!systemd.runs_on_systemd());
    }

    #[test]
    fn test_move_to_user_scope_failure() {
        let systemd = Systemd::new().with_busctl("false");
        assert!(systemd.move_to_user_scope(ProcessId::from_raw(1)).is_err());

        let systemd = Systemd::new().with_busctl("/nonexistent/busctl");
        assert!(systemd.move_to_user_scope(ProcessId::from_raw(1)).is_err());
    }

    #[test]
    fn test_move_to_user_scope_success() {
        let systemd = Systemd::new().with_busctl("true");
        systemd.move_to_user_scope(ProcessId::from_raw(1)).unwrap();
    }
}

//! SELinux file labels

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use nix::errno::Errno;
use tracing::debug;
use warren_core::{Error, Result};

/// Label iptables expects on its `/run` state
pub const IPTABLES_VAR_RUN_LABEL: &str = "system_u:object_r:iptables_var_run_t:s0";

const SELINUX_XATTR: &std::ffi::CStr = c"security.selinux";

/// Check if SELinux is enabled on the host
#[must_use]
pub fn enabled() -> bool {
    Path::new("/sys/fs/selinux/enforce").exists()
}

/// Set the file label of `path`
///
/// Does nothing when SELinux is disabled. Filesystems without label support
/// are skipped.
pub fn relabel(path: &Path, label: &str) -> Result<()> {
    if !enabled() {
        return Ok(());
    }

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| Error::namespace(format!("invalid path {}: {e}", path.display())))?;

    // Use libc directly since nix doesn't expose xattrs
    let ret = unsafe {
        libc::lsetxattr(
            c_path.as_ptr(),
            SELINUX_XATTR.as_ptr(),
            label.as_ptr().cast(),
            label.len(),
            0,
        )
    };

    if ret != 0 {
        let errno = Errno::last();
        if errno == Errno::ENOTSUP {
            debug!(path = %path.display(), "Labeling not supported");
            return Ok(());
        }
        return Err(Error::wrap(format!("relabel {label}"), errno));
    }

    debug!(path = %path.display(), label, "Relabeled");
    Ok(())
}

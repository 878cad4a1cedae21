//! Manual symlink resolution for the resolver file
//!
//! The kernel follows symlinks before mounting, so a bind mount over
//! `/etc/resolv.conf` lands on the final link target. Inside the private
//! mount namespace only the first target under `/run` is reachable, so
//! resolution walks every path component itself and stops there.

use std::path::{Component, Path, PathBuf};

use tracing::debug;
use warren_core::{Error, Result};

/// Maximum number of symlinks followed
pub const MAX_SYMLINKS: usize = 255;

/// Resolve `path` one component at a time
///
/// Each symlink found in any component is replaced by its target and the
/// walk restarts from the root of the new path. Resolution stops once the
/// path lies below `stop_under`.
pub fn resolve_path(path: &Path, stop_under: &Path) -> Result<PathBuf> {
    let mut resolved = clean(path);
    let mut links = 0;

    'walk: loop {
        let components: Vec<Component<'_>> = resolved.components().collect();
        let mut prefix = PathBuf::new();

        for (idx, component) in components.iter().enumerate() {
            prefix.push(component);
            if matches!(component, Component::RootDir | Component::Prefix(_)) {
                continue;
            }

            let meta = std::fs::symlink_metadata(&prefix).map_err(|e| {
                Error::namespace(format!("failed to stat resolv.conf path: {e}"))
            })?;
            if !meta.file_type().is_symlink() {
                continue;
            }

            let link = std::fs::read_link(&prefix).map_err(|e| {
                Error::namespace(format!("failed to read resolv.conf symlink: {e}"))
            })?;
            links += 1;

            let base = if link.is_absolute() {
                link
            } else {
                prefix.parent().unwrap_or_else(|| Path::new("/")).join(link)
            };
            let rest: PathBuf = components[idx + 1..].iter().collect();
            resolved = clean(&base.join(rest));

            if is_below(&resolved, stop_under) {
                break 'walk;
            }
            if links == MAX_SYMLINKS {
                return Err(Error::TooManySymlinks {
                    path: path.to_path_buf(),
                });
            }
            continue 'walk;
        }

        break;
    }

    debug!(path = %resolved.display(), "Resolved resolv.conf path in the mount namespace");
    Ok(resolved)
}

/// Check if `path` is strictly below `dir`
#[must_use]
pub fn is_below(path: &Path, dir: &Path) -> bool {
    path != dir && path.starts_with(dir)
}

/// Lexically normalize `path`, dropping `.` and folding `..`
fn clean(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() && !out.has_root() {
                    out.push("..");
                }
            }
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;

    fn workdir() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        (dir, root)
    }

    #[test]
    fn test_clean() {
        assert_eq!(clean(Path::new("/etc/../run/./x")), PathBuf::from("/run/x"));
        assert_eq!(clean(Path::new("/../etc")), PathBuf::from("/etc"));
        assert_eq!(clean(Path::new("/a/b/")), PathBuf::from("/a/b"));
    }

    #[test]
    fn test_is_below() {
        assert!(is_below(Path::new("/run/systemd"), Path::new("/run")));
        assert!(!is_below(Path::new("/run"), Path::new("/run")));
        assert!(!is_below(Path::new("/running/x"), Path::new("/run")));
    }

    #[test]
    fn test_plain_file() {
        let (_dir, root) = workdir();
        let file = root.join("etc/resolv.conf");
        std::fs::create_dir_all(file.parent().unwrap()).unwrap();
        std::fs::write(&file, "nameserver 1.1.1.1\n").unwrap();

        assert_eq!(resolve_path(&file, &root.join("run")).unwrap(), file);
    }

    #[test]
    fn test_relative_link_into_stop_dir() {
        let (_dir, root) = workdir();
        std::fs::create_dir_all(root.join("etc")).unwrap();
        std::fs::create_dir_all(root.join("run/systemd/resolve")).unwrap();
        symlink(
            "../run/systemd/resolve/stub-resolv.conf",
            root.join("etc/resolv.conf"),
        )
        .unwrap();
        // Second hop must not be followed, only the first target is visible
        symlink("resolv.conf", root.join("run/systemd/resolve/stub-resolv.conf")).unwrap();

        let resolved = resolve_path(&root.join("etc/resolv.conf"), &root.join("run")).unwrap();
        assert_eq!(resolved, root.join("run/systemd/resolve/stub-resolv.conf"));
    }

    #[test]
    fn test_link_in_directory_component() {
        let (_dir, root) = workdir();
        std::fs::create_dir_all(root.join("real")).unwrap();
        std::fs::write(root.join("real/resolv.conf"), "").unwrap();
        symlink(root.join("real"), root.join("etc")).unwrap();

        let resolved = resolve_path(&root.join("etc/resolv.conf"), &root.join("run")).unwrap();
        assert_eq!(resolved, root.join("real/resolv.conf"));
    }

    #[test]
    fn test_missing_component() {
        let (_dir, root) = workdir();
        let err = resolve_path(&root.join("nope/resolv.conf"), &root.join("run")).unwrap_err();
        assert!(err.to_string().contains("failed to stat resolv.conf path"));
    }

    #[test]
    fn test_chain_of_255_links_fails() {
        let (_dir, root) = workdir();
        let chain = root.join("chain");
        std::fs::create_dir(&chain).unwrap();
        std::fs::write(chain.join("target"), "").unwrap();

        for i in 0..MAX_SYMLINKS {
            let next = if i + 1 == MAX_SYMLINKS {
                chain.join("target")
            } else {
                chain.join(format!("link{}", i + 1))
            };
            symlink(next, chain.join(format!("link{i}"))).unwrap();
        }

        let err = resolve_path(&chain.join("link0"), &root.join("run")).unwrap_err();
        assert!(matches!(err, Error::TooManySymlinks { .. }));
        assert!(err.to_string().contains("too many symlinks"));
    }

    #[test]
    fn test_chain_of_254_links_ending_in_stop_dir() {
        let (_dir, root) = workdir();
        let chain = root.join("chain");
        let run = root.join("run");
        std::fs::create_dir(&chain).unwrap();
        std::fs::create_dir(&run).unwrap();
        // Points back out of the stop dir, must be left alone
        symlink(chain.join("link0"), run.join("stub")).unwrap();

        let hops = MAX_SYMLINKS - 1;
        for i in 0..hops {
            let next = if i + 1 == hops {
                run.join("stub")
            } else {
                chain.join(format!("link{}", i + 1))
            };
            symlink(next, chain.join(format!("link{i}"))).unwrap();
        }

        let resolved = resolve_path(&chain.join("link0"), &run).unwrap();
        assert_eq!(resolved, run.join("stub"));
    }
}

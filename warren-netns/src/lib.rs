//! Rootless network namespace lifecycle
//!
//! This crate creates, shares and tears down the single network namespace
//! used by every unprivileged container process of a user:
//! - Persistent reference count guarding creation and teardown
//! - Namespace handle bound to a mount point in the working directory
//! - Private mount namespace with the resolver file and plugin state
//! - pasta and slirp4netns helper supervision
//! - Rollback of partially built namespaces

#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]

pub mod config;
pub mod helper;
pub mod launcher;
pub mod lock;
pub mod manager;
pub mod mounts;
pub mod netns;
pub mod refcount;
pub mod resolvconf;
pub mod resolve;
pub mod selinux;
pub mod supervisor;

pub use config::{HelperKind, NetworkConfig, PluginBackend};
pub use lock::{AdvisoryLock, FileLock};
pub use manager::RootlessNetns;
pub use netns::NetnsHandle;
pub use resolvconf::{HostResolvConf, ResolvConfGenerator, ResolvConfParams};
pub use supervisor::{Supervisor, Systemd};

/// Name of the namespace mount point inside the working directory
pub const NETNS_NAME: &str = "rootless-netns";

/// Reference count file
pub const REF_COUNT_FILE: &str = "ref-count";

/// PID file of the networking helper
pub const PID_FILE: &str = "rootless-netns-conn.pid";

/// Private resolver file bind-mounted over the host one
pub const RESOLV_CONF_FILE: &str = "resolv.conf";

/// Private directory bind-mounted over `/run`
pub const RUN_DIR: &str = "run";

/// Default CNI state directory
pub const DEFAULT_CNI_DIR: &str = "/var/lib/cni";

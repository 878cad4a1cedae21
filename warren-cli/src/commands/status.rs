//! Status command implementation

use anyhow::{Context, Result};
use warren_netns::{HelperKind, NETNS_NAME, NetnsHandle, refcount};

use super::Settings;

pub fn execute(settings: &Settings) -> Result<()> {
    let count = refcount::read(&settings.workdir).context("Failed to read reference count")?;
    let ns_path = settings.workdir.join(NETNS_NAME);

    let state = match NetnsHandle::open(&ns_path) {
        Ok(_) => "mounted",
        Err(e) if e.is_not_found() => "absent",
        Err(_) => "stale",
    };

    println!("Working directory: {}", settings.workdir.display());
    println!("Helper: {}", settings.config.helper);
    let options = match settings.config.helper {
        HelperKind::Pasta => &settings.config.pasta_options,
        HelperKind::Slirp4netns => &settings.config.slirp_options,
    };
    if !options.is_empty() {
        println!("Helper options: {}", options.join(" "));
    }
    println!("References: {count}");
    println!("Namespace: {state}");
    Ok(())
}

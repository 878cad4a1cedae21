//! Run command implementation

use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing::{debug, info};
use warren_netns::{FileLock, RootlessNetns};

use super::Settings;

/// Lock file next to the working directory, which cleanup removes
fn lock_path(workdir: &std::path::Path) -> PathBuf {
    let mut name = workdir.file_name().unwrap_or_default().to_os_string();
    name.push(".lock");
    workdir.with_file_name(name)
}

pub async fn execute(settings: Settings, command: Vec<String>) -> Result<i32> {
    tokio::task::spawn_blocking(move || run_blocking(&settings, &command))
        .await
        .context("Run task failed")?
}

fn run_blocking(settings: &Settings, command: &[String]) -> Result<i32> {
    let netns = RootlessNetns::new(&settings.workdir, settings.config.clone())
        .context("Failed to prepare rootless network namespace")?;
    let lock = FileLock::new(lock_path(&settings.workdir));

    info!(
        helper = %settings.config.helper,
        workdir = %settings.workdir.display(),
        "Entering rootless network namespace"
    );

    let exit_code = Mutex::new(0);
    netns
        .run(&lock, || {
            let (program, args) = command.split_first().ok_or_else(|| {
                warren_core::Error::invalid_config("no command given")
            })?;
            debug!(command = %command.join(" "), "Spawning command");

            let status = Command::new(program).args(args).status()?;
            let code = status
                .code()
                .or_else(|| status.signal().map(|signal| 128 + signal))
                .unwrap_or(1);
            if let Ok(mut exit_code) = exit_code.lock() {
                *exit_code = code;
            }
            Ok(())
        })
        .with_context(|| format!("Failed to run {}", command.join(" ")))?;

    let code = exit_code.into_inner().unwrap_or(1);
    debug!(code, "Command exited");
    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_path() {
        assert_eq!(
            lock_path(std::path::Path::new("/run/user/1000/warren/rootless-netns")),
            PathBuf::from("/run/user/1000/warren/rootless-netns.lock")
        );
    }
}

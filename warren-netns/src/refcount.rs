//! Persistent reference count
//!
//! The count lives in a small decimal file inside the working directory.
//! Callers must hold the namespace lock around [`adjust`], the
//! read-modify-write is not atomic by itself.

use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use tracing::{debug, error};
use warren_core::{Error, Result, WrapErr};

use crate::REF_COUNT_FILE;

/// Read the current count, a missing or empty file counts as zero
///
/// An out-of-sync negative value reads as zero.
pub fn read(dir: &Path) -> Result<u64> {
    Ok(read_raw(dir)?.try_into().unwrap_or(0))
}

/// Add `delta` to the stored count and persist it, returning the new value
///
/// A result below zero is reset to zero and logged.
pub fn adjust(dir: &Path, delta: i64) -> Result<u64> {
    let updated = read_raw(dir)?.saturating_add(delta);

    let updated = if updated < 0 {
        error!(
            count = updated,
            dir = %dir.display(),
            "rootless netns ref counter out of sync, counter is at {updated}, resetting it to 0"
        );
        0
    } else {
        updated.unsigned_abs()
    };

    write(dir, updated)?;
    debug!(count = updated, delta, "Adjusted rootless netns ref counter");
    Ok(updated)
}

fn read_raw(dir: &Path) -> Result<i64> {
    let path = dir.join(REF_COUNT_FILE);
    let content = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(Error::wrap("read ref counter", e)),
    };

    let content = content.trim();
    if content.is_empty() {
        return Ok(0);
    }

    content.parse().map_err(|e| {
        Error::wrap(
            "parse ref counter",
            Error::namespace(format!("invalid count {content:?}: {e}")),
        )
    })
}

fn write(dir: &Path, count: u64) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(dir.join(REF_COUNT_FILE))
        .wrap_err("write ref counter")?;
    file.write_all(count.to_string().as_bytes())
        .wrap_err("write ref counter")
}

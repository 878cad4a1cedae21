//! Info command implementation

use anyhow::{Context, Result};
use warren_core::NetworkInfo;

use super::Settings;

pub fn execute(settings: &Settings) -> Result<()> {
    let info = NetworkInfo::read(&settings.workdir).context("Failed to read network info")?;
    let json = serde_json::to_string_pretty(&info).context("Failed to encode network info")?;
    println!("{json}");
    Ok(())
}

use std::path::PathBuf;

use anyhow::{Context, Result};
use warren_netns::{HelperKind, NetworkConfig, PluginBackend};

use crate::cli::{Cli, Commands};

pub mod info;
pub mod run;
pub mod status;

/// Configuration and working directory selected on the command line
pub struct Settings {
    pub config: NetworkConfig,
    pub workdir: PathBuf,
}

impl Settings {
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        let mut config = match &cli.config {
            Some(path) => NetworkConfig::load(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?,
            None => NetworkConfig::new(),
        };

        if let Some(helper) = &cli.helper {
            config.helper = helper.parse::<HelperKind>().context("Invalid --helper")?;
        }
        if cli.cni {
            config.plugins = PluginBackend::Cni;
        }
        let config = cli
            .pasta_options
            .iter()
            .fold(config, |config, option| config.with_pasta_option(option.as_str()));
        let config = cli
            .slirp_options
            .iter()
            .fold(config, |config, option| config.with_slirp_option(option.as_str()));

        let workdir = cli
            .workdir
            .clone()
            .unwrap_or_else(|| config.default_workdir());

        Ok(Self { config, workdir })
    }
}

/// Dispatch command to appropriate handler, returning the exit code
pub async fn dispatch(cli: Cli) -> Result<i32> {
    let settings = Settings::from_cli(&cli)?;

    match cli.command {
        Commands::Run { command } => run::execute(settings, command).await,
        Commands::Info => info::execute(&settings).map(|()| 0),
        Commands::Status => status::execute(&settings).map(|()| 0),
        Commands::Version => {
            crate::print_version();
            Ok(0)
        }
    }
}

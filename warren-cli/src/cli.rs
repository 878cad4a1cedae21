//! CLI argument definitions

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "warren")]
#[command(about = "Shared rootless network namespace manager", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Namespace working directory
    #[arg(long, global = true)]
    pub workdir: Option<PathBuf>,

    /// JSON network configuration file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Networking helper (pasta or slirp4netns)
    #[arg(long, global = true)]
    pub helper: Option<String>,

    /// Extra pasta argument, may be repeated
    #[arg(long = "pasta-option", global = true, allow_hyphen_values = true)]
    pub pasta_options: Vec<String>,

    /// Extra slirp4netns key=value option, may be repeated
    #[arg(long = "slirp-option", global = true)]
    pub slirp_options: Vec<String>,

    /// Containers use CNI plugins
    #[arg(long, global = true)]
    pub cni: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a command inside the shared namespace
    Run {
        /// Command to run
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },

    /// Print the namespace network information as JSON
    Info,

    /// Show the reference count and whether the namespace exists
    Status,

    /// Show version information
    Version,
}

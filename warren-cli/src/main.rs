//! Warren CLI
//!
//! Runs commands inside the shared rootless network namespace and shows
//! its state.

use clap::Parser;
use std::process;
use tracing::Level;
use tracing_subscriber::EnvFilter;

mod cli;
mod commands;

use cli::Cli;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // RUST_LOG wins over --verbose
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.as_str().to_lowercase()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match commands::dispatch(cli).await {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("❌ Error: {e:#}");
            process::exit(1);
        }
    }
}

fn print_version() {
    println!("🐇 Warren rootless network namespace manager");
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Helpers:");
    println!("  • pasta");
    println!("  • slirp4netns");
}

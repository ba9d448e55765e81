//! CLI command definitions and dispatch.

mod build;
mod cache;
mod version;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// sbuild: build container root filesystems from definition files.
#[derive(Parser)]
#[command(name = "sbuild", version, about)]
pub struct Cli {
    /// Log at debug level
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Build a sandbox directory from a definition file or image URI
    Build(build::BuildArgs),
    /// Inspect or clear the image blob cache
    Cache(cache::CacheArgs),
    /// Show version information
    Version(version::VersionArgs),
}

/// Default blob cache location (~/.cache/sbuild).
pub(crate) fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from(".cache"))
        .join("sbuild")
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Command::Build(args) => build::execute(args).await,
        Command::Cache(args) => cache::execute(args).await,
        Command::Version(args) => version::execute(args).await,
    }
}

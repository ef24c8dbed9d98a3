//! CLI interface for poly-scalper
//!
//! Subcommands:
//! - `run`: start the engine against the configured venue
//! - `status`: show a one-shot engine status summary
//! - `config`: print the resolved configuration

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "poly-scalper")]
#[command(about = "Scalping engine for short-duration binary prediction markets")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    pub config: String,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the engine
    Run(RunArgs),
    /// Show engine status
    Status,
    /// Show resolved configuration
    Config,
}

#[derive(clap::Args, Debug)]
pub struct RunArgs {
    /// Force dry-run regardless of the configured trading_enabled flag
    #[arg(long)]
    pub dry_run: bool,
}

//! Riffle - unified CLI entrypoint.
//!
//! Usage:
//!   riffle serve --config config/riffle.toml
//!   riffle config validate --config config/riffle.toml
//!   riffle config show --config config/riffle.toml

use anyhow::Result;
use clap::Parser;
use riffle::cli::commands::{run_config, run_serve};
use riffle::cli::{Cli, Commands};
use std::path::PathBuf;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config/riffle.toml"));

    match cli.command {
        Commands::Serve(args) => run_serve(args, &config_path, cli.log_level.as_deref()).await,
        Commands::Config(args) => run_config(args, &config_path),
    }
}

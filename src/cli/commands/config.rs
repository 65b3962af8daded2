//! Config command implementation.

use crate::core::config::Config;
use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use std::path::PathBuf;

/// Configuration operations.
#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: ConfigAction,
}

/// Config subcommands.
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Parse and validate the configuration file.
    Validate,
    /// Print the effective configuration as TOML.
    Show,
}

/// Run a config subcommand against the given config path.
pub fn run_config(args: ConfigArgs, config_path: &PathBuf) -> Result<()> {
    let config = Config::from_file(config_path)
        .with_context(|| format!("failed to load config from {config_path:?}"))?;

    match args.action {
        ConfigAction::Validate => {
            println!("configuration OK: {}", config_path.display());
        }
        ConfigAction::Show => {
            let rendered =
                toml::to_string_pretty(&config).context("failed to render configuration")?;
            print!("{rendered}");
        }
    }
    Ok(())
}

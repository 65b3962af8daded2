//! Serve command implementation.

use crate::core::config::Config;
use crate::server::{Server, ServerConfig};
use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;

/// Start the shuffle server.
#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Listener port, overriding the configured bind address.
    #[arg(long)]
    pub port: Option<u16>,

    /// TLS material directory, overriding the configured one.
    #[arg(long)]
    pub tls_dir: Option<String>,
}

/// Initialize the tracing subscriber.
fn init_tracing(default_level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();
}

/// Run the serve command with the given config path.
pub async fn run_serve(args: ServeArgs, config_path: &PathBuf, log_level: Option<&str>) -> Result<()> {
    let mut config = Config::from_file(config_path)
        .with_context(|| format!("failed to load config from {config_path:?}"))?;

    if let Some(port) = args.port {
        let mut bind: std::net::SocketAddr = config
            .server
            .bind
            .parse()
            .with_context(|| format!("invalid bind address {}", config.server.bind))?;
        bind.set_port(port);
        config.server.bind = bind.to_string();
    }
    if let Some(tls_dir) = args.tls_dir {
        config.server.tls_dir = Some(tls_dir);
    }

    let level = log_level.unwrap_or(&config.telemetry.log_level);
    init_tracing(level);

    let server = Server::new(ServerConfig::from_config(&config)?);
    server.run().await
}

//! Shuffle server.
//!
//! A [`Server`] value owns the shuffle registry, the scratch root, and the
//! listener; connection tasks borrow the registry through it rather than
//! reaching for process globals. One tokio task runs per accepted
//! connection; operations on different shuffles proceed independently,
//! while each store linearizes its own operations internally.
//!
//! Shutdown flows through a watch channel: the accept loop stops taking
//! connections, live connection tasks finish their current record and
//! close, and the registry drains (closing every store and deleting its
//! scratch directory).

pub mod connection;

use crate::core::config::Config;
use crate::registry::ShuffleRegistry;
use crate::store::StoreConfig;
use crate::transport::tls::ServerTlsConfig;
use crate::transport::{SessionTokens, TokenVerifier};
use anyhow::{Context, Result};
use connection::{serve_connection, ConnectionContext};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

/// Server construction parameters.
#[derive(Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind: SocketAddr,
    /// Scratch root; each shuffle gets a directory beneath it.
    pub scratch_dir: PathBuf,
    /// Store tuning applied to every shuffle.
    pub store: StoreConfig,
    /// TLS material; `None` serves plaintext (testing only).
    pub tls: Option<ServerTlsConfig>,
    /// Session-token check applied at handshake time.
    pub verifier: TokenVerifier,
    /// Idle-connection read timeout.
    pub read_timeout: Duration,
}

impl ServerConfig {
    /// Build from the loaded TOML configuration.
    pub fn from_config(config: &Config) -> Result<Self> {
        let bind: SocketAddr = config
            .server
            .bind
            .parse()
            .with_context(|| format!("invalid bind address {}", config.server.bind))?;

        let tls = match &config.server.tls_dir {
            Some(dir) => Some(
                ServerTlsConfig::from_dir(dir)
                    .with_context(|| format!("failed to load TLS material from {dir}"))?,
            ),
            None => None,
        };

        let verifier = match &config.server.token_file {
            Some(path) => {
                let tokens = SessionTokens::from_file(path)
                    .with_context(|| format!("failed to load token file {path}"))?;
                TokenVerifier::from_tokens(&tokens)
            }
            None => TokenVerifier::accept_all(),
        };

        Ok(Self {
            bind,
            scratch_dir: PathBuf::from(&config.server.scratch_dir),
            store: config.store_config(),
            tls,
            verifier,
            read_timeout: Duration::from_secs(config.server.read_timeout_secs),
        })
    }
}

/// The shuffle server, pre-start.
pub struct Server {
    config: ServerConfig,
    registry: Arc<ShuffleRegistry>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            config,
            registry: Arc::new(ShuffleRegistry::new()),
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Bind the listener and spawn the accept loop.
    pub async fn start(self) -> Result<RunningServer> {
        std::fs::create_dir_all(&self.config.scratch_dir).with_context(|| {
            format!(
                "failed to create scratch root {}",
                self.config.scratch_dir.display()
            )
        })?;

        let acceptor = match &self.config.tls {
            Some(tls) => Some(tls.acceptor().context("failed to build TLS acceptor")?),
            None => {
                tracing::warn!(bind = %self.config.bind, "serving in INSECURE mode (no TLS)");
                None
            }
        };

        let listener = TcpListener::bind(self.config.bind)
            .await
            .with_context(|| format!("failed to bind {}", self.config.bind))?;
        let local_addr = listener.local_addr().context("failed to read bound address")?;

        let ctx = ConnectionContext {
            registry: Arc::clone(&self.registry),
            scratch_dir: self.config.scratch_dir.clone(),
            store_config: self.config.store.clone(),
            verifier: self.config.verifier.clone(),
            read_timeout: self.config.read_timeout,
            shutdown: self.shutdown_rx.clone(),
        };

        let accept_handle = tokio::spawn(accept_loop(
            listener,
            acceptor,
            ctx,
            self.shutdown_rx.clone(),
        ));

        tracing::info!(bind = %local_addr, "shuffle server started");
        Ok(RunningServer {
            local_addr,
            registry: self.registry,
            shutdown_tx: self.shutdown_tx,
            accept_handle,
        })
    }

    /// Run until SIGINT, then shut down gracefully.
    pub async fn run(self) -> Result<()> {
        let running = self.start().await?;
        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for shutdown signal")?;
        tracing::warn!("shutdown signal received (SIGINT)");
        running.shutdown().await;
        Ok(())
    }
}

/// Handle to a started server.
pub struct RunningServer {
    local_addr: SocketAddr,
    registry: Arc<ShuffleRegistry>,
    shutdown_tx: watch::Sender<bool>,
    accept_handle: JoinHandle<()>,
}

impl RunningServer {
    /// The bound listener address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The live shuffle registry.
    pub fn registry(&self) -> &Arc<ShuffleRegistry> {
        &self.registry
    }

    /// Signal shutdown, wait for the accept loop, and drain the registry.
    pub async fn shutdown(self) {
        tracing::info!("stopping shuffle server");
        let _ = self.shutdown_tx.send(true);
        if tokio::time::timeout(Duration::from_secs(5), self.accept_handle)
            .await
            .is_err()
        {
            tracing::warn!("accept loop did not stop in time");
        }
        self.registry.drain();
        tracing::info!("shuffle server stopped");
    }
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    ctx: ConnectionContext,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    tracing::debug!("accept loop stopping");
                    break;
                }
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((socket, peer)) => {
                        let acceptor = acceptor.clone();
                        let ctx = ctx.clone();
                        tokio::spawn(handle_socket(socket, peer, acceptor, ctx));
                    }
                    Err(error) => {
                        tracing::warn!(%error, "accept failed");
                    }
                }
            }
        }
    }
}

async fn handle_socket(
    socket: TcpStream,
    peer: SocketAddr,
    acceptor: Option<TlsAcceptor>,
    ctx: ConnectionContext,
) {
    if let Err(error) = socket.set_nodelay(true) {
        tracing::debug!(%peer, %error, "failed to set TCP_NODELAY");
    }
    match acceptor {
        Some(acceptor) => match acceptor.accept(socket).await {
            Ok(tls_stream) => serve_connection(tls_stream, peer, ctx).await,
            Err(error) => {
                tracing::warn!(%peer, %error, "TLS accept failed");
            }
        },
        None => serve_connection(socket, peer, ctx).await,
    }
}

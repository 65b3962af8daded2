//! Connection establishment and the transport handshake.
//!
//! Two reachability modes exist. **Direct** resolves
//! `<service>.<namespace>` and connects on the service port; after the TLS
//! handshake the client writes two 32-byte session tokens (the default
//! namespace's token, then the service namespace's token or 32 zero bytes
//! when the service lives in the default namespace), reads a 1-byte ack
//! (non-1 means declined) and a server-minted 16-byte connection UUID.
//! **Proxied** connects to the L4 proxy instead and, after the tokens,
//! sends a length-prefixed namespace, a length-prefixed service name, and
//! a 2-byte port so the proxy can dial the target on the client's behalf;
//! the trailing ack + UUID exchange is identical.
//!
//! `SHUFFLER_HOST` / `SHUFFLER_PORT` override discovery entirely and force
//! a direct connection to the given endpoint.

pub mod tls;

use crate::core::config::{DeployConfig, Location};
use crate::core::error::{ShuffleError, ShuffleResult};
use crate::wire::{self, CONNECTION_UUID_LEN, HANDSHAKE_OK, SESSION_TOKEN_LEN};
use base64::Engine;
use std::collections::HashMap;
use std::path::Path;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

/// Port the L4 proxy listens on.
pub const PROXY_PORT: u16 = 5000;

/// A 32-byte session token.
pub type SessionToken = [u8; SESSION_TOKEN_LEN];

/// Zero token sent when the service lives in the default namespace.
pub const ZERO_TOKEN: SessionToken = [0u8; SESSION_TOKEN_LEN];

/// Pre-shared session tokens, keyed by namespace.
#[derive(Clone, Default)]
pub struct SessionTokens {
    tokens: HashMap<String, SessionToken>,
}

impl std::fmt::Debug for SessionTokens {
    /// Token values never reach logs; only the namespaces do.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionTokens")
            .field("namespaces", &self.tokens.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl SessionTokens {
    /// Load tokens from a JSON file mapping namespace to a base64 token.
    pub fn from_file(path: impl AsRef<Path>) -> ShuffleResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ShuffleError::config(format!("failed to read token file {}: {e}", path.display()))
        })?;
        let raw: HashMap<String, String> = serde_json::from_str(&contents).map_err(|e| {
            ShuffleError::config(format!("failed to parse token file {}: {e}", path.display()))
        })?;
        let mut tokens = HashMap::with_capacity(raw.len());
        for (namespace, encoded) in raw {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(&encoded)
                .map_err(|e| {
                    ShuffleError::config(format!("invalid token for namespace {namespace}: {e}"))
                })?;
            let token: SessionToken = bytes.try_into().map_err(|_| {
                ShuffleError::config(format!(
                    "token for namespace {namespace} is not {SESSION_TOKEN_LEN} bytes"
                ))
            })?;
            tokens.insert(namespace, token);
        }
        Ok(Self { tokens })
    }

    /// Insert a token (used by tests and programmatic setups).
    pub fn insert(&mut self, namespace: impl Into<String>, token: SessionToken) {
        self.tokens.insert(namespace.into(), token);
    }

    /// The token for a namespace.
    pub fn namespace_token(&self, namespace: &str) -> ShuffleResult<SessionToken> {
        self.tokens.get(namespace).copied().ok_or_else(|| {
            ShuffleError::config(format!("no session token for namespace {namespace}"))
        })
    }

    /// All known tokens (for server-side verification).
    pub fn all(&self) -> impl Iterator<Item = &SessionToken> {
        self.tokens.values()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// Server-side token check applied during the handshake.
#[derive(Clone, Default)]
pub struct TokenVerifier {
    /// Accepted tokens; `None` accepts any pair (tokens were already
    /// authenticated upstream, e.g. by the proxy).
    accepted: Option<Vec<SessionToken>>,
}

impl std::fmt::Debug for TokenVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenVerifier")
            .field("accepted", &self.accepted.as_ref().map(Vec::len))
            .finish()
    }
}

impl TokenVerifier {
    /// Accept any token pair.
    pub fn accept_all() -> Self {
        Self { accepted: None }
    }

    /// Accept only handshakes presenting one of the given tokens.
    pub fn from_tokens(tokens: &SessionTokens) -> Self {
        Self {
            accepted: Some(tokens.all().copied().collect()),
        }
    }

    /// Whether a presented token pair passes.
    pub fn accepts(&self, default_token: &SessionToken, namespace_token: &SessionToken) -> bool {
        match &self.accepted {
            None => true,
            Some(accepted) => {
                accepted.contains(default_token) || accepted.contains(namespace_token)
            }
        }
    }
}

/// A connection that may or may not be TLS-wrapped.
pub enum TransportStream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl std::fmt::Debug for TransportStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportStream::Plain(_) => f.write_str("TransportStream::Plain"),
            TransportStream::Tls(_) => f.write_str("TransportStream::Tls"),
        }
    }
}

impl AsyncRead for TransportStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut *self {
            TransportStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            TransportStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for TransportStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match &mut *self {
            TransportStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            TransportStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            TransportStream::Plain(s) => Pin::new(s).poll_flush(cx),
            TransportStream::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            TransportStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            TransportStream::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Everything needed to reach the service.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Service name (resolves as `<service>.<namespace>` in direct mode).
    pub service: String,
    /// Service port.
    pub port: u16,
    /// Deploy-configuration document.
    pub deploy: DeployConfig,
    /// Pre-shared session tokens.
    pub tokens: SessionTokens,
    /// TLS client material; `None` connects in plaintext (testing only).
    pub tls: Option<tls::ClientTlsConfig>,
    /// Explicit endpoint override; populated from `SHUFFLER_HOST` /
    /// `SHUFFLER_PORT` by default.
    pub host_override: Option<(String, u16)>,
}

impl ConnectOptions {
    /// Options for a service, picking up the environment overrides.
    pub fn new(service: impl Into<String>, port: u16, deploy: DeployConfig) -> Self {
        Self {
            service: service.into(),
            port,
            deploy,
            tokens: SessionTokens::default(),
            tls: None,
            host_override: env_override(port),
        }
    }

    /// The token pair to present: the default namespace's token, then the
    /// service namespace's token or zeros when the service is in the
    /// default namespace.
    fn token_pair(&self) -> ShuffleResult<(SessionToken, SessionToken)> {
        if self.tokens.is_empty() {
            // No tokens configured (test deployments): present zeros.
            return Ok((ZERO_TOKEN, ZERO_TOKEN));
        }
        let default_token = self
            .tokens
            .namespace_token(&self.deploy.default_namespace)?;
        let service_ns = self.deploy.service_namespace(&self.service);
        let namespace_token = if service_ns == self.deploy.default_namespace {
            ZERO_TOKEN
        } else {
            self.tokens.namespace_token(service_ns)?
        };
        Ok((default_token, namespace_token))
    }
}

/// `SHUFFLER_HOST` / `SHUFFLER_PORT` discovery override.
pub fn env_override(default_port: u16) -> Option<(String, u16)> {
    let host = std::env::var("SHUFFLER_HOST").ok()?;
    let port = std::env::var("SHUFFLER_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(default_port);
    Some((host, port))
}

/// Result of a successful handshake.
#[derive(Debug)]
pub struct EstablishedConnection {
    pub stream: TransportStream,
    /// Server-minted per-connection UUID; carried in client logs so both
    /// sides of a trace correlate.
    pub connection_uuid: [u8; CONNECTION_UUID_LEN],
}

/// Open an authenticated connection to the service.
pub async fn open_connection(opts: &ConnectOptions) -> ShuffleResult<EstablishedConnection> {
    let service_ns = opts.deploy.service_namespace(&opts.service).to_string();

    if let Some((host, port)) = &opts.host_override {
        return connect_direct(opts, host, *port).await;
    }

    match opts.deploy.location {
        Location::Direct => {
            let host = format!("{}.{}", opts.service, service_ns);
            connect_direct(opts, &host, opts.port).await
        }
        Location::ProxiedInternal | Location::ProxiedExternal => {
            connect_proxied(opts, &service_ns).await
        }
    }
}

async fn connect_direct(
    opts: &ConnectOptions,
    host: &str,
    port: u16,
) -> ShuffleResult<EstablishedConnection> {
    let mut stream = dial(opts, host, port).await?;
    let (default_token, namespace_token) = opts.token_pair()?;
    stream
        .write_all(&default_token)
        .await
        .map_err(ShuffleError::from_io)?;
    stream
        .write_all(&namespace_token)
        .await
        .map_err(ShuffleError::from_io)?;
    stream.flush().await.map_err(ShuffleError::from_io)?;
    finish_handshake(stream).await
}

async fn connect_proxied(
    opts: &ConnectOptions,
    service_ns: &str,
) -> ShuffleResult<EstablishedConnection> {
    let proxy_host = match opts.deploy.location {
        // The in-cluster proxy answers on the bare first label of the
        // deploy domain; the public one on the domain itself.
        Location::ProxiedInternal => opts
            .deploy
            .domain
            .split('.')
            .next()
            .unwrap_or(&opts.deploy.domain)
            .to_string(),
        _ => opts.deploy.domain.clone(),
    };

    let mut stream = dial(opts, &proxy_host, PROXY_PORT).await?;
    let (default_token, namespace_token) = opts.token_pair()?;
    stream
        .write_all(&default_token)
        .await
        .map_err(ShuffleError::from_io)?;
    stream
        .write_all(&namespace_token)
        .await
        .map_err(ShuffleError::from_io)?;
    wire::write_block(&mut stream, service_ns.as_bytes()).await?;
    wire::write_block(&mut stream, opts.service.as_bytes()).await?;
    stream
        .write_u16(opts.port)
        .await
        .map_err(ShuffleError::from_io)?;
    stream.flush().await.map_err(ShuffleError::from_io)?;
    finish_handshake(stream).await
}

/// TCP connect, then TLS if material is configured.
async fn dial(opts: &ConnectOptions, host: &str, port: u16) -> ShuffleResult<TransportStream> {
    let tcp = TcpStream::connect((host, port))
        .await
        .map_err(|source| ShuffleError::Connection { source })?;
    tcp.set_nodelay(true)
        .map_err(|source| ShuffleError::Connection { source })?;

    match &opts.tls {
        Some(tls_config) => {
            let connector: TlsConnector = tls_config.connector()?;
            let name = tls::server_name(host)?;
            let stream = connector
                .connect(name, tcp)
                .await
                .map_err(|e| ShuffleError::Tls {
                    detail: format!("handshake with {host}:{port} failed: {e}"),
                })?;
            Ok(TransportStream::Tls(Box::new(stream)))
        }
        None => Ok(TransportStream::Plain(tcp)),
    }
}

/// Read the ack byte and connection UUID that finish every handshake.
async fn finish_handshake(mut stream: TransportStream) -> ShuffleResult<EstablishedConnection> {
    let ack = wire::read_u8(&mut stream).await?;
    if ack != HANDSHAKE_OK {
        return Err(ShuffleError::TransportAck { ack });
    }
    let connection_uuid = wire::read_array::<CONNECTION_UUID_LEN, _>(&mut stream).await?;
    Ok(EstablishedConnection {
        stream,
        connection_uuid,
    })
}

/// Server side of the handshake, mirroring direct mode: read the two
/// tokens, verify, and answer with the ack byte and a freshly minted
/// connection UUID.
pub async fn handshake_server<S>(
    stream: &mut S,
    verifier: &TokenVerifier,
) -> ShuffleResult<uuid::Uuid>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let default_token = wire::read_array::<SESSION_TOKEN_LEN, _>(stream).await?;
    let namespace_token = wire::read_array::<SESSION_TOKEN_LEN, _>(stream).await?;

    if !verifier.accepts(&default_token, &namespace_token) {
        stream.write_u8(0).await.map_err(ShuffleError::from_io)?;
        stream.flush().await.map_err(ShuffleError::from_io)?;
        return Err(ShuffleError::TransportAck { ack: 0 });
    }

    let connection_uuid = uuid::Uuid::new_v4();
    stream
        .write_u8(HANDSHAKE_OK)
        .await
        .map_err(ShuffleError::from_io)?;
    stream
        .write_all(connection_uuid.as_bytes())
        .await
        .map_err(ShuffleError::from_io)?;
    stream.flush().await.map_err(ShuffleError::from_io)?;
    Ok(connection_uuid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_verifier_accept_all() {
        let verifier = TokenVerifier::accept_all();
        assert!(verifier.accepts(&ZERO_TOKEN, &ZERO_TOKEN));
    }

    #[test]
    fn test_verifier_matches_either_token() {
        let mut tokens = SessionTokens::default();
        let token = [7u8; SESSION_TOKEN_LEN];
        tokens.insert("default", token);
        let verifier = TokenVerifier::from_tokens(&tokens);

        assert!(verifier.accepts(&token, &ZERO_TOKEN));
        assert!(verifier.accepts(&ZERO_TOKEN, &token));
        assert!(!verifier.accepts(&ZERO_TOKEN, &ZERO_TOKEN));
    }

    #[test]
    fn test_token_file_roundtrip() {
        let token = [42u8; SESSION_TOKEN_LEN];
        let encoded = base64::engine::general_purpose::STANDARD.encode(token);
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), format!(r#"{{"default": "{encoded}"}}"#)).unwrap();

        let tokens = SessionTokens::from_file(file.path()).unwrap();
        assert_eq!(tokens.namespace_token("default").unwrap(), token);
        assert!(tokens.namespace_token("other").is_err());
    }

    #[test]
    fn test_token_file_rejects_wrong_length() {
        let encoded = base64::engine::general_purpose::STANDARD.encode([1u8; 8]);
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), format!(r#"{{"default": "{encoded}"}}"#)).unwrap();
        assert!(SessionTokens::from_file(file.path()).is_err());
    }

    #[tokio::test]
    async fn test_server_handshake_over_duplex() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let server_task = tokio::spawn(async move {
            handshake_server(&mut server, &TokenVerifier::accept_all()).await
        });

        client.write_all(&ZERO_TOKEN).await.unwrap();
        client.write_all(&ZERO_TOKEN).await.unwrap();
        let ack = client.read_u8().await.unwrap();
        assert_eq!(ack, HANDSHAKE_OK);
        let mut uuid_bytes = [0u8; CONNECTION_UUID_LEN];
        client.read_exact(&mut uuid_bytes).await.unwrap();

        let minted = server_task.await.unwrap().unwrap();
        assert_eq!(minted.as_bytes(), &uuid_bytes);
    }

    #[tokio::test]
    async fn test_server_handshake_declines_bad_tokens() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let mut tokens = SessionTokens::default();
        tokens.insert("default", [9u8; SESSION_TOKEN_LEN]);
        let verifier = TokenVerifier::from_tokens(&tokens);

        let server_task =
            tokio::spawn(async move { handshake_server(&mut server, &verifier).await });

        client.write_all(&ZERO_TOKEN).await.unwrap();
        client.write_all(&ZERO_TOKEN).await.unwrap();
        let ack = client.read_u8().await.unwrap();
        assert_eq!(ack, 0);
        assert!(matches!(
            server_task.await.unwrap(),
            Err(ShuffleError::TransportAck { ack: 0 })
        ));
    }
}

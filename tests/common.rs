//! Common test utilities.
//!
//! Shared helpers for integration tests. Import with `mod common;`.

#![allow(dead_code)]

use riffle::codec::types::{EncodedField, EncodedKind, EncodedType, Field};
use riffle::codec::{LogicalType, ShuffleSchema, SortField, Value};
use riffle::core::config::DeployConfig;
use riffle::server::{RunningServer, Server, ServerConfig};
use riffle::store::StoreConfig;
use riffle::transport::{ConnectOptions, SessionTokens, TokenVerifier};
use riffle::{ClientConfig, ShuffleClient};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

/// Row type `(a: int32, b: string)` keyed by `a` ascending.
pub fn int_string_schema() -> ShuffleSchema {
    int_string_schema_with(SortField::ascending("a"))
}

/// Row type `(a: int32, b: string)` keyed by `a` descending.
pub fn int_string_desc_schema() -> ShuffleSchema {
    int_string_schema_with(SortField::descending("a"))
}

fn int_string_schema_with(key: SortField) -> ShuffleSchema {
    ShuffleSchema {
        row_type: LogicalType::Struct(vec![
            Field {
                name: "a".to_string(),
                typ: LogicalType::Int32,
            },
            Field {
                name: "b".to_string(),
                typ: LogicalType::Str,
            },
        ]),
        row_encoded: EncodedType::required(EncodedKind::Struct(vec![
            EncodedField {
                name: "a".to_string(),
                typ: EncodedType::required(EncodedKind::Int32),
            },
            EncodedField {
                name: "b".to_string(),
                typ: EncodedType::required(EncodedKind::Str),
            },
        ])),
        key_fields: vec![key],
        key_encoded: EncodedType::required(EncodedKind::Struct(vec![EncodedField {
            name: "a".to_string(),
            typ: EncodedType::required(EncodedKind::Int32),
        }])),
    }
}

/// A `(a, b)` row value.
pub fn row(a: i32, b: &str) -> Value {
    Value::row(vec![Value::Int32(a), Value::str(b)])
}

/// Store tuning that exercises flushes and compactions quickly.
pub fn small_store_config() -> StoreConfig {
    StoreConfig {
        memtable_flush_bytes: 1024,
        max_runs: 3,
        sample_capacity: 16 * 1024,
    }
}

/// An in-process server plus its scratch directory.
pub struct TestServer {
    pub running: RunningServer,
    pub scratch: tempfile::TempDir,
}

impl TestServer {
    /// Start a plaintext server on a random loopback port.
    pub async fn start() -> Self {
        Self::start_with(None, TokenVerifier::accept_all()).await
    }

    /// Start with optional TLS material and a token verifier.
    pub async fn start_with(
        tls: Option<riffle::transport::tls::ServerTlsConfig>,
        verifier: TokenVerifier,
    ) -> Self {
        let scratch = tempfile::tempdir().expect("failed to create scratch dir");
        let config = ServerConfig {
            bind: "127.0.0.1:0".parse().unwrap(),
            scratch_dir: scratch.path().to_path_buf(),
            store: small_store_config(),
            tls,
            verifier,
            read_timeout: Duration::from_secs(60),
        };
        let running = Server::new(config)
            .start()
            .await
            .expect("failed to start test server");
        Self { running, scratch }
    }

    pub fn addr(&self) -> SocketAddr {
        self.running.local_addr()
    }

    /// A client wired straight at this server.
    pub fn client(&self) -> ShuffleClient {
        self.client_at(self.addr())
    }

    /// A client wired at the given endpoint (e.g. a relay).
    pub fn client_at(&self, addr: SocketAddr) -> ShuffleClient {
        let mut connect = ConnectOptions::new("shuffler", addr.port(), DeployConfig::default());
        connect.host_override = Some((addr.ip().to_string(), addr.port()));
        connect.tokens = SessionTokens::default();
        let mut config = ClientConfig::new(connect);
        config.backoff.initial = Duration::from_millis(10);
        config.backoff.max = Duration::from_millis(100);
        ShuffleClient::new(config)
    }
}

/// TCP relay for exercising the client's reconnect path against a healthy
/// server. Each direction is piped independently: live connections can be
/// severed on demand, and the server→client direction can be switched to
/// discard mode to simulate a response (such as a PUT ack) lost in
/// transit while the request itself went through.
pub struct Relay {
    pub addr: SocketAddr,
    kill_tx: broadcast::Sender<()>,
    block_responses: Arc<AtomicBool>,
}

impl Relay {
    pub async fn start(upstream: SocketAddr) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind relay");
        let addr = listener.local_addr().unwrap();
        let (kill_tx, _) = broadcast::channel(8);
        let block_responses = Arc::new(AtomicBool::new(false));
        let accept_kill = kill_tx.clone();
        let accept_block = Arc::clone(&block_responses);

        tokio::spawn(async move {
            loop {
                let Ok((inbound, _)) = listener.accept().await else {
                    break;
                };
                let Ok(outbound) = TcpStream::connect(upstream).await else {
                    continue;
                };
                let (client_read, client_write) = inbound.into_split();
                let (server_read, server_write) = outbound.into_split();

                let requests = tokio::spawn(pipe(client_read, server_write, None));
                let responses = tokio::spawn(pipe(
                    server_read,
                    client_write,
                    Some(Arc::clone(&accept_block)),
                ));

                let mut kill_rx = accept_kill.subscribe();
                tokio::spawn(async move {
                    let _ = kill_rx.recv().await;
                    requests.abort();
                    responses.abort();
                });
            }
        });

        Self {
            addr,
            kill_tx,
            block_responses,
        }
    }

    /// Drop every live relayed connection; the listener stays up, so new
    /// connections keep working.
    pub fn sever(&self) {
        let _ = self.kill_tx.send(());
    }

    /// While set, bytes flowing server→client are read and discarded: the
    /// server sees its writes succeed, the client never receives them.
    pub fn set_block_responses(&self, block: bool) {
        self.block_responses.store(block, Ordering::SeqCst);
    }
}

/// Forward one direction of a relayed connection, optionally discarding
/// while the flag is set.
async fn pipe(
    mut read: tokio::net::tcp::OwnedReadHalf,
    mut write: tokio::net::tcp::OwnedWriteHalf,
    discard: Option<Arc<AtomicBool>>,
) {
    let mut buf = [0u8; 16 * 1024];
    loop {
        let n = match read.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        if discard
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
        {
            continue;
        }
        if write.write_all(&buf[..n]).await.is_err() {
            break;
        }
    }
}

/// Extract the `a` fields of `(a, b)` rows.
pub fn a_values(rows: &[Value]) -> Vec<i32> {
    rows.iter()
        .map(|row| match row {
            Value::Struct(fields) => match &fields[0] {
                Value::Int32(a) => *a,
                other => panic!("unexpected key field {other:?}"),
            },
            other => panic!("unexpected row {other:?}"),
        })
        .collect()
}

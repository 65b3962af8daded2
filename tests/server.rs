//! End-to-end scenarios against an in-process server.

mod common;

use common::{a_values, row, Relay, TestServer};
use riffle::codec::Value;
use riffle::core::error::ShuffleError;
use riffle::transport::{self, tls, ConnectOptions, SessionTokens, TokenVerifier};
use riffle::wire::{self, OpCode};
use riffle::KeyRange;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;

fn init_logging() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

#[tokio::test]
async fn test_put_then_ordered_get() {
    init_logging();
    let server = TestServer::start().await;
    let mut client = server.client();

    client.start(common::int_string_schema()).await.unwrap();
    assert!(client.shuffle_id().is_some());
    for (a, b) in [(3, "x"), (1, "y"), (2, "z")] {
        client.put_row(&row(a, b)).unwrap();
    }
    assert_eq!(client.pending_rows(), 3);
    client.end_put().await.unwrap();
    assert_eq!(client.pending_rows(), 0);

    let rows = client.get(&KeyRange::all()).await.unwrap();
    assert_eq!(a_values(&rows), vec![1, 2, 3]);
    assert_eq!(rows[0], row(1, "y"));
    assert_eq!(rows[1], row(2, "z"));
    assert_eq!(rows[2], row(3, "x"));

    client.stop().await.unwrap();
    client.close().await;
    server.running.shutdown().await;
}

#[tokio::test]
async fn test_get_half_open_interval() {
    let server = TestServer::start().await;
    let mut client = server.client();

    client.start(common::int_string_schema()).await.unwrap();
    for (a, b) in [(3, "x"), (1, "y"), (2, "z")] {
        client.put_row(&row(a, b)).unwrap();
    }
    client.end_put().await.unwrap();

    // [2, 3) keeps only (2, "z").
    let rows = client
        .get(&KeyRange::new(
            Some(vec![Value::Int32(2)]),
            true,
            Some(vec![Value::Int32(3)]),
            false,
        ))
        .await
        .unwrap();
    assert_eq!(rows, vec![row(2, "z")]);

    client.stop().await.unwrap();
    client.close().await;
    server.running.shutdown().await;
}

#[tokio::test]
async fn test_descending_keys() {
    let server = TestServer::start().await;
    let mut client = server.client();

    client.start(common::int_string_desc_schema()).await.unwrap();
    for a in [1, 2, 3] {
        client.put_row(&row(a, "r")).unwrap();
    }
    client.end_put().await.unwrap();

    let rows = client.get(&KeyRange::all()).await.unwrap();
    assert_eq!(a_values(&rows), vec![3, 2, 1]);

    client.stop().await.unwrap();
    client.close().await;
    server.running.shutdown().await;
}

#[tokio::test]
async fn test_partition_bounds_via_client() {
    let server = TestServer::start().await;
    let mut client = server.client();

    client.start(common::int_string_schema()).await.unwrap();
    for a in 0..1000 {
        client.put_row(&row(a, "r")).unwrap();
    }
    client.end_put().await.unwrap();

    let bounds = client.partition_bounds(4).await.unwrap();
    assert_eq!(bounds.len(), 5);
    assert_eq!(bounds[0], Value::Struct(vec![Value::Int32(0)]));
    assert_eq!(bounds[4], Value::Struct(vec![Value::Int32(999)]));
    let values: Vec<i32> = bounds
        .iter()
        .map(|b| match b {
            Value::Struct(fields) => match fields[0] {
                Value::Int32(v) => v,
                _ => panic!("unexpected bound field"),
            },
            _ => panic!("unexpected bound"),
        })
        .collect();
    for pair in values.windows(2) {
        assert!(pair[0] <= pair[1]);
    }

    assert!(client.partition_bounds(0).await.unwrap().is_empty());

    client.stop().await.unwrap();
    client.close().await;
    server.running.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_shuffles_are_isolated() {
    let server = TestServer::start().await;
    let mut a = server.client();
    let mut b = server.client();

    let id_a = a.start(common::int_string_schema()).await.unwrap();
    let id_b = b.start(common::int_string_schema()).await.unwrap();
    assert_ne!(id_a, id_b);

    for v in [1, 2, 3] {
        a.put_row(&row(v, "from-a")).unwrap();
    }
    for v in [10, 11, 12] {
        b.put_row(&row(v, "from-b")).unwrap();
    }
    a.end_put().await.unwrap();
    b.end_put().await.unwrap();

    let rows_a = a.get(&KeyRange::all()).await.unwrap();
    let rows_b = b.get(&KeyRange::all()).await.unwrap();
    assert_eq!(a_values(&rows_a), vec![1, 2, 3]);
    assert_eq!(a_values(&rows_b), vec![10, 11, 12]);

    a.stop().await.unwrap();
    b.stop().await.unwrap();
    a.close().await;
    b.close().await;
    server.running.shutdown().await;
}

#[tokio::test]
async fn test_reconnect_resends_unacked_batch() {
    init_logging();
    let server = TestServer::start().await;
    let relay = Relay::start(server.addr()).await;
    let mut client = server.client_at(relay.addr);

    client.start(common::int_string_schema()).await.unwrap();
    client.put_row(&row(1, "first")).unwrap();
    client.end_put().await.unwrap();

    // Kill the live connection; the client only notices on next use, so
    // the first attempt dies before the batch ever reaches the server and
    // the retried resend is the only copy.
    relay.sever();

    client.put_row(&row(2, "second")).unwrap();
    client.put_row(&row(3, "third")).unwrap();
    client.end_put().await.unwrap();

    let rows = client.get(&KeyRange::all()).await.unwrap();
    assert_eq!(a_values(&rows), vec![1, 2, 3]);

    client.stop().await.unwrap();
    client.close().await;
    server.running.shutdown().await;
}

/// The hard half of reconnect transparency: the server commits the whole
/// batch and writes its ack, but the ack is lost in transit. The retried
/// batch carries the same token, so it must not be inserted again.
#[tokio::test]
async fn test_lost_ack_does_not_duplicate_batch() {
    init_logging();
    let server = TestServer::start().await;
    let relay = Relay::start(server.addr()).await;
    let mut client = server.client_at(relay.addr);

    client.start(common::int_string_schema()).await.unwrap();
    let id = client.shuffle_id().unwrap();
    client.put_row(&row(1, "first")).unwrap();
    client.end_put().await.unwrap();

    let shuffle = server.running.registry().get(&id).unwrap();
    assert_eq!(shuffle.store().entry_count(), 1);

    // Swallow everything the server sends back: the request direction
    // still flows, so the batch commits server-side while the ack never
    // reaches the client.
    relay.set_block_responses(true);
    client.put_row(&row(2, "second")).unwrap();
    client.put_row(&row(3, "third")).unwrap();
    let pending = tokio::spawn(async move {
        let result = client.end_put().await;
        (client, result)
    });

    // Wait until the server has committed the batch.
    let deadline = Instant::now() + Duration::from_secs(5);
    while shuffle.store().entry_count() < 3 {
        assert!(
            Instant::now() < deadline,
            "server never committed the batch"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // The ack is already lost; now drop the connection and let the client
    // retry over a healthy path.
    relay.sever();
    relay.set_block_responses(false);

    let (mut client, result) = pending.await.unwrap();
    result.unwrap();

    // The resend was suppressed by the batch token: rows appear exactly
    // once.
    assert_eq!(shuffle.store().entry_count(), 3);
    let rows = client.get(&KeyRange::all()).await.unwrap();
    assert_eq!(a_values(&rows), vec![1, 2, 3]);

    client.stop().await.unwrap();
    client.close().await;
    server.running.shutdown().await;
}

#[tokio::test]
async fn test_reconnect_reissues_get() {
    let server = TestServer::start().await;
    let relay = Relay::start(server.addr()).await;
    let mut client = server.client_at(relay.addr);

    client.start(common::int_string_schema()).await.unwrap();
    for (a, b) in [(3, "x"), (1, "y"), (2, "z")] {
        client.put_row(&row(a, b)).unwrap();
    }
    client.end_put().await.unwrap();

    let before = client.get(&KeyRange::all()).await.unwrap();
    relay.sever();
    let after = client.get(&KeyRange::all()).await.unwrap();
    assert_eq!(before, after);
    assert_eq!(a_values(&after), vec![1, 2, 3]);

    client.stop().await.unwrap();
    client.close().await;
    server.running.shutdown().await;
}

/// Open a raw transport connection for hand-framed requests.
async fn raw_connection(server: &TestServer) -> transport::TransportStream {
    let addr = server.addr();
    let mut connect =
        ConnectOptions::new("shuffler", addr.port(), riffle::config::DeployConfig::default());
    connect.host_override = Some((addr.ip().to_string(), addr.port()));
    connect.tokens = SessionTokens::default();
    transport::open_connection(&connect).await.unwrap().stream
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let server = TestServer::start().await;
    let mut client = server.client();
    let id = client.start(common::int_string_schema()).await.unwrap();
    client.put_row(&row(1, "r")).unwrap();
    client.end_put().await.unwrap();

    let mut raw = raw_connection(&server).await;
    for _ in 0..2 {
        raw.write_u8(OpCode::Stop.as_byte()).await.unwrap();
        raw.write_all(id.as_bytes()).await.unwrap();
        raw.flush().await.unwrap();
        let ack = wire::read_u8(&mut raw).await.unwrap();
        assert_eq!(ack, 0);
    }
    assert!(server.running.registry().is_empty());

    client.close().await;
    server.running.shutdown().await;
}

#[tokio::test]
async fn test_unknown_shuffle_closes_connection() {
    let server = TestServer::start().await;
    let mut raw = raw_connection(&server).await;

    raw.write_u8(OpCode::Get.as_byte()).await.unwrap();
    raw.write_all(&[0u8; 16]).await.unwrap();
    raw.write_all(&0u32.to_be_bytes()).await.unwrap();
    raw.write_u8(1).await.unwrap();
    raw.write_all(&0u32.to_be_bytes()).await.unwrap();
    raw.write_u8(1).await.unwrap();
    raw.flush().await.unwrap();

    // No error frame exists; the server just closes.
    assert!(wire::read_u8(&mut raw).await.is_err());
    server.running.shutdown().await;
}

#[tokio::test]
async fn test_eos_echo() {
    let server = TestServer::start().await;
    let mut raw = raw_connection(&server).await;

    raw.write_u8(OpCode::Eos.as_byte()).await.unwrap();
    raw.flush().await.unwrap();
    let echo = wire::read_u8(&mut raw).await.unwrap();
    assert_eq!(echo, OpCode::Eos.as_byte());
    server.running.shutdown().await;
}

#[tokio::test]
async fn test_malformed_opcode_closes_connection() {
    let server = TestServer::start().await;
    let mut raw = raw_connection(&server).await;

    raw.write_u8(77).await.unwrap();
    raw.flush().await.unwrap();
    assert!(wire::read_u8(&mut raw).await.is_err());
    server.running.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_deletes_scratch() {
    let server = TestServer::start().await;
    let scratch_root = server.scratch.path().to_path_buf();
    let mut client = server.client();

    let id = client.start(common::int_string_schema()).await.unwrap();
    client.put_row(&row(1, "r")).unwrap();
    client.end_put().await.unwrap();
    assert!(scratch_root.join(id.to_hex()).exists());

    client.close().await;
    server.running.shutdown().await;
    assert!(!scratch_root.join(id.to_hex()).exists());
}

fn test_tls_material() -> (tls::ServerTlsConfig, tls::ClientTlsConfig) {
    let ca_key = rcgen::KeyPair::generate().unwrap();
    let mut ca_params = rcgen::CertificateParams::default();
    ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    let ca_cert = ca_params.self_signed(&ca_key).unwrap();

    let server_key = rcgen::KeyPair::generate().unwrap();
    let server_params =
        rcgen::CertificateParams::new(vec!["localhost".to_string(), "127.0.0.1".to_string()])
            .unwrap();
    let server_cert = server_params.signed_by(&server_key, &ca_cert, &ca_key).unwrap();

    let server_tls = tls::ServerTlsConfig {
        cert_chain_pem: server_cert.pem().into_bytes(),
        key_pem: server_key.serialize_pem().into_bytes(),
        client_ca_pem: None,
    };
    let client_tls = tls::ClientTlsConfig {
        ca_pem: ca_cert.pem().into_bytes(),
        cert_chain_pem: None,
        key_pem: None,
    };
    (server_tls, client_tls)
}

#[tokio::test]
async fn test_tls_end_to_end() {
    init_logging();
    let (server_tls, client_tls) = test_tls_material();
    let server = TestServer::start_with(Some(server_tls), TokenVerifier::accept_all()).await;

    let addr = server.addr();
    let mut connect =
        ConnectOptions::new("shuffler", addr.port(), riffle::config::DeployConfig::default());
    connect.host_override = Some(("127.0.0.1".to_string(), addr.port()));
    connect.tls = Some(client_tls);
    let mut client = riffle::ShuffleClient::new(riffle::ClientConfig::new(connect));

    client.start(common::int_string_schema()).await.unwrap();
    client.put_row(&row(5, "secure")).unwrap();
    client.end_put().await.unwrap();
    let rows = client.get(&KeyRange::all()).await.unwrap();
    assert_eq!(rows, vec![row(5, "secure")]);

    client.stop().await.unwrap();
    client.close().await;
    server.running.shutdown().await;
}

#[tokio::test]
async fn test_token_rejection_surfaces_transport_ack() {
    let mut expected = SessionTokens::default();
    expected.insert("default", [1u8; 32]);
    let server = TestServer::start_with(None, TokenVerifier::from_tokens(&expected)).await;

    let addr = server.addr();
    let mut connect =
        ConnectOptions::new("shuffler", addr.port(), riffle::config::DeployConfig::default());
    connect.host_override = Some((addr.ip().to_string(), addr.port()));
    // No tokens configured: the client presents zeros, which the server
    // rejects.
    let result = transport::open_connection(&connect).await;
    assert!(matches!(result, Err(ShuffleError::TransportAck { ack: 0 })));
    server.running.shutdown().await;
}

//! Per-connection protocol loop.
//!
//! After the transport handshake, a connection cycles through
//! read-opcode → read-payload → dispatch → write-response until EOS, an
//! error, the idle timeout, or server shutdown. Any parse or I/O error
//! closes the connection; there is no error frame on the wire, so clients
//! recover by reconnecting. Every log line carries the connection UUID
//! minted at accept time.

use crate::core::error::{ShuffleError, ShuffleResult};
use crate::registry::{Shuffle, ShuffleId, ShuffleRegistry};
use crate::store::{KeyInterval, Store, StoreConfig};
use crate::transport::{handshake_server, TokenVerifier};
use crate::wire::{self, OpCode, ACK, BATCH_TOKEN_LEN, SHUFFLE_ID_LEN, STREAM_CONTINUE, STREAM_END};
use bytes::Bytes;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufStream};
use tokio::sync::watch;
use tracing::Instrument;

/// Shared state a connection task needs.
#[derive(Clone)]
pub struct ConnectionContext {
    pub registry: Arc<ShuffleRegistry>,
    pub scratch_dir: PathBuf,
    pub store_config: StoreConfig,
    pub verifier: TokenVerifier,
    pub read_timeout: Duration,
    pub shutdown: watch::Receiver<bool>,
}

impl ConnectionContext {
    fn shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }
}

/// Serve one accepted connection to completion.
pub async fn serve_connection<S>(stream: S, peer: SocketAddr, ctx: ConnectionContext)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut stream = BufStream::new(stream);

    let connection = match handshake_server(&mut stream, &ctx.verifier).await {
        Ok(uuid) => uuid,
        Err(error) => {
            tracing::warn!(%peer, %error, "transport handshake failed");
            return;
        }
    };

    // Every log line below carries the connection UUID minted at accept
    // time, so client and server traces correlate.
    let span = tracing::info_span!("connection", id = %connection);
    connection_loop(stream, peer, ctx).instrument(span).await;
}

async fn connection_loop<S>(
    mut stream: BufStream<S>,
    peer: SocketAddr,
    mut ctx: ConnectionContext,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tracing::info!(%peer, "connection established");

    loop {
        let op_byte = tokio::select! {
            changed = ctx.shutdown.changed() => {
                if changed.is_err() || *ctx.shutdown.borrow() {
                    tracing::info!("closing connection for shutdown");
                    break;
                }
                continue;
            }
            read = tokio::time::timeout(ctx.read_timeout, wire::read_u8(&mut stream)) => {
                match read {
                    Err(_) => {
                        tracing::info!("idle timeout, closing connection");
                        break;
                    }
                    Ok(Err(ShuffleError::Truncated)) => {
                        // Peer hung up between requests without an EOS.
                        tracing::debug!("peer closed connection");
                        break;
                    }
                    Ok(Err(error)) => {
                        tracing::warn!(%error, "read failed");
                        break;
                    }
                    Ok(Ok(byte)) => byte,
                }
            }
        };

        let op = match OpCode::from_byte(op_byte) {
            Ok(op) => op,
            Err(error) => {
                tracing::warn!(%error, "closing connection");
                break;
            }
        };

        if op == OpCode::Eos {
            let _ = stream.write_u8(OpCode::Eos.as_byte()).await;
            let _ = stream.flush().await;
            tracing::info!("end of session");
            break;
        }

        if let Err(error) = dispatch(&mut stream, op, &ctx).await {
            tracing::warn!(op = ?op, %error, "request failed, closing connection");
            break;
        }
    }
}

async fn dispatch<S>(
    stream: &mut BufStream<S>,
    op: OpCode,
    ctx: &ConnectionContext,
) -> ShuffleResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if !op.carries_identifier() {
        return match op {
            OpCode::Start => handle_start(stream, ctx).await,
            _ => Err(ShuffleError::malformed_request(format!(
                "opcode {op:?} handled outside the dispatch path"
            ))),
        };
    }

    let id = ShuffleId::from_bytes(wire::read_array::<SHUFFLE_ID_LEN, _>(stream).await?);
    match op {
        OpCode::Put => handle_put(stream, ctx, ctx.registry.resolve(&id)?.as_ref()).await,
        OpCode::Get => handle_get(stream, ctx, ctx.registry.resolve(&id)?.as_ref()).await,
        OpCode::Stop => handle_stop(stream, ctx, id).await,
        OpCode::PartitionBounds => {
            handle_partition_bounds(stream, ctx.registry.resolve(&id)?.as_ref()).await
        }
        OpCode::Start | OpCode::Eos => Err(ShuffleError::malformed_request(format!(
            "opcode {op:?} carries no identifier"
        ))),
    }
}

/// START: read the schema, allocate a shuffle, answer with its identifier.
async fn handle_start<S>(stream: &mut BufStream<S>, ctx: &ConnectionContext) -> ShuffleResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let schema = wire::read_schema(stream).await?;
    let codec = crate::codec::RowCodec::new(&schema)?;

    let id = ShuffleId::mint();
    let store = Store::create(ctx.scratch_dir.join(id.to_hex()), ctx.store_config.clone())?;
    let shuffle = Arc::new(Shuffle::new(id, schema, codec, store));
    ctx.registry.insert(shuffle);
    tracing::info!(shuffle = %id, live = ctx.registry.len(), "shuffle started");

    stream
        .write_all(id.as_bytes())
        .await
        .map_err(ShuffleError::from_io)?;
    stream.flush().await.map_err(ShuffleError::from_io)
}

/// PUT: stream-decode records, apply the batch exactly once, then
/// acknowledge.
///
/// Records are staged and only land in the store after the terminator
/// flag, under the batch token: a retried batch whose acknowledgement was
/// lost inserts nothing, and a batch torn mid-stream leaves no partial
/// prefix behind to be duplicated by the resend.
async fn handle_put<S>(
    stream: &mut BufStream<S>,
    ctx: &ConnectionContext,
    shuffle: &Shuffle,
) -> ShuffleResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let token = wire::read_array::<BATCH_TOKEN_LEN, _>(stream).await?;
    let codec = shuffle.codec();
    let mut staged: Vec<(Bytes, Bytes)> = Vec::new();
    loop {
        if ctx.shutting_down() {
            return Err(ShuffleError::Connection {
                source: std::io::Error::new(std::io::ErrorKind::Interrupted, "server shutting down"),
            });
        }
        match wire::read_u8(stream).await? {
            STREAM_END => break,
            STREAM_CONTINUE => {
                let row: Bytes = wire::read_block(stream).await?;
                let value = codec.decode_row(&row)?;
                let key = codec.encode_key(&value)?;
                staged.push((key, row));
            }
            other => {
                return Err(ShuffleError::malformed_request(format!(
                    "invalid continue flag {other}"
                )))
            }
        }
    }
    let rows = staged.len();
    let fresh = shuffle.store().apply_batch(token, staged)?;
    tracing::debug!(shuffle = %shuffle.id(), rows, fresh, "put acknowledged");
    stream.write_u8(ACK).await.map_err(ShuffleError::from_io)?;
    stream.flush().await.map_err(ShuffleError::from_io)
}

/// GET: stream every row in the requested interval, in key order.
async fn handle_get<S>(
    stream: &mut BufStream<S>,
    ctx: &ConnectionContext,
    shuffle: &Shuffle,
) -> ShuffleResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let start = wire::read_block(stream).await?;
    let start_inclusive = read_inclusive_flag(stream).await?;
    let end = wire::read_block(stream).await?;
    let end_inclusive = read_inclusive_flag(stream).await?;

    let interval = KeyInterval::new(start, start_inclusive, end, end_inclusive);
    let scan = shuffle.store().range(interval)?;

    let mut sent = 0u64;
    for entry in scan {
        if ctx.shutting_down() {
            return Err(ShuffleError::Connection {
                source: std::io::Error::new(std::io::ErrorKind::Interrupted, "server shutting down"),
            });
        }
        let (_, row) = entry?;
        stream
            .write_u8(STREAM_CONTINUE)
            .await
            .map_err(ShuffleError::from_io)?;
        wire::write_block(stream, &row).await?;
        sent += 1;
    }
    stream
        .write_u8(STREAM_END)
        .await
        .map_err(ShuffleError::from_io)?;
    tracing::debug!(shuffle = %shuffle.id(), rows = sent, "range served");
    stream.flush().await.map_err(ShuffleError::from_io)
}

/// STOP: release the shuffle. A STOP for an identifier that is no longer
/// live is accepted with no effect, so a retried STOP stays idempotent.
async fn handle_stop<S>(
    stream: &mut BufStream<S>,
    ctx: &ConnectionContext,
    id: ShuffleId,
) -> ShuffleResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let removed = ctx.registry.remove(&id);
    tracing::info!(shuffle = %id, removed, live = ctx.registry.len(), "shuffle stopped");
    stream.write_u8(ACK).await.map_err(ShuffleError::from_io)?;
    stream.flush().await.map_err(ShuffleError::from_io)
}

/// PARTITION_BOUNDS: n+1 boundary keys for n requested partitions.
async fn handle_partition_bounds<S>(
    stream: &mut BufStream<S>,
    shuffle: &Shuffle,
) -> ShuffleResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let n = wire::read_u32(stream).await?;
    let bounds = shuffle.store().partition_keys(n)?;
    for key in &bounds {
        stream
            .write_u8(STREAM_CONTINUE)
            .await
            .map_err(ShuffleError::from_io)?;
        wire::write_block(stream, key).await?;
    }
    stream
        .write_u8(STREAM_END)
        .await
        .map_err(ShuffleError::from_io)?;
    tracing::debug!(shuffle = %shuffle.id(), n, bounds = bounds.len(), "partition bounds served");
    stream.flush().await.map_err(ShuffleError::from_io)
}

async fn read_inclusive_flag<S>(stream: &mut BufStream<S>) -> ShuffleResult<bool>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match wire::read_u8(stream).await? {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(ShuffleError::malformed_request(format!(
            "invalid inclusivity byte {other}"
        ))),
    }
}
